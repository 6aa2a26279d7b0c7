//! Condition variable over a monotonically incrementing generation word.
//!
//! The two low bits of the generation are reserved, so signals bump the
//! word by four. A waiter snapshots the generation, drops the mutex and
//! futex-waits for the snapshot to go stale; missed-wakeup safety comes
//! from the futex's enqueue-time recheck.

use core::sync::atomic::{AtomicU32, Ordering};

use storpu_abi::errors::Errno;

use super::futex::Futex;
use crate::utils::locks::MutexGuard;

const COND_INC_STEP: u32 = 0x4;

pub struct Condvar {
    state: AtomicU32,
    futex: Futex,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            futex: Futex::new(),
        }
    }

    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
        let generation = self.state.load(Ordering::Acquire);

        MutexGuard::unlocked(guard, || {
            self.futex.wait(&self.state, generation);
        });
    }

    /// Waits until signalled or until `deadline` (absolute milliseconds).
    pub fn wait_until<T>(&self, guard: &mut MutexGuard<'_, T>, deadline: u64) -> Result<(), Errno> {
        let generation = self.state.load(Ordering::Acquire);

        MutexGuard::unlocked(guard, || {
            self.futex.wait_until(&self.state, generation, deadline)
        })
    }

    fn pulse(&self, count: u32) {
        self.state.fetch_add(COND_INC_STEP, Ordering::Relaxed);
        self.futex.wake(count);
    }

    pub fn signal(&self) {
        self.pulse(1);
    }

    pub fn broadcast(&self) {
        self.pulse(u32::MAX);
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
