//! The sleeping mutex.
//!
//! Three states: unlocked, locked with no waiters, locked contended. The
//! contended transition uses an unconditional swap so an unlocker knows
//! whether anyone needs a wake. Exposed as a `lock_api` raw mutex; the
//! guarded `Mutex<T>` alias lives in `utils::locks`. Guests get the same
//! state machine through `spu_mutex_*`.

use core::sync::atomic::{AtomicU32, Ordering};

use lock_api::{GuardSend, RawMutex};

use storpu_abi::errors::Errno;

use super::futex::Futex;

pub const UNLOCKED: u32 = 0;
pub const LOCKED_UNCONTENDED: u32 = 1;
pub const LOCKED_CONTENDED: u32 = 2;

pub struct RawSleepMutex {
    state: AtomicU32,
    futex: Futex,
}

impl RawSleepMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            futex: Futex::new(),
        }
    }

    /// Non-blocking acquire; `EBUSY` when held.
    pub fn try_lock_raw(&self) -> Result<(), Errno> {
        self.state
            .compare_exchange(
                UNLOCKED,
                LOCKED_UNCONTENDED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(|_| Errno::EBUSY)
    }

    pub fn lock_raw(&self) {
        if self.try_lock_raw().is_ok() {
            return;
        }

        while self.state.swap(LOCKED_CONTENDED, Ordering::Acquire) != UNLOCKED {
            self.futex.wait(&self.state, LOCKED_CONTENDED);
        }
    }

    pub fn unlock_raw(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == LOCKED_CONTENDED {
            self.futex.wake(1);
        }
    }
}

impl Default for RawSleepMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for RawSleepMutex {
    const INIT: Self = Self::new();
    type GuardMarker = GuardSend;

    fn lock(&self) {
        self.lock_raw();
    }

    fn try_lock(&self) -> bool {
        self.try_lock_raw().is_ok()
    }

    unsafe fn unlock(&self) {
        self.unlock_raw();
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_state_machine() {
        let mutex = RawSleepMutex::new();

        mutex.try_lock_raw().unwrap();
        assert_eq!(mutex.state.load(Ordering::Relaxed), LOCKED_UNCONTENDED);
        assert_eq!(mutex.try_lock_raw(), Err(Errno::EBUSY));

        mutex.unlock_raw();
        assert_eq!(mutex.state.load(Ordering::Relaxed), UNLOCKED);

        mutex.lock_raw();
        assert_eq!(mutex.state.load(Ordering::Relaxed), LOCKED_UNCONTENDED);
        mutex.unlock_raw();
    }
}
