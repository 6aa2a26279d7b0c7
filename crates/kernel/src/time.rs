//! Timekeeping and the deadline registry for timed waits.
//!
//! There is no tick interrupt on the compute cores; the per-cpu idle loops
//! sweep the registry instead, which bounds timeout latency by how busy
//! the cores are. Good enough for the one API that takes a timeout.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::scheduler;
use crate::thread::Thread;
use crate::utils::locks::{SpinLock, spinlock};

/// Milliseconds since the cores came up.
#[macro_export]
macro_rules! time {
    (ms) => {
        $crate::time::now_ms()
    };
}

#[inline]
pub fn now_ms() -> u64 {
    crate::arch::time_ms()
}

struct Sleeper {
    token: u64,
    deadline: u64,
    thread: Weak<Thread>,
}

static SLEEPERS: SpinLock<Vec<Sleeper>> = spinlock(Vec::new());
static NEXT_TOKEN: SpinLock<u64> = spinlock(1);

/// Arms a timeout wake-up for `thread` at `deadline`. Returns a token for
/// [`unregister_sleeper`].
pub fn register_sleeper(deadline: u64, thread: &Arc<Thread>) -> u64 {
    let token = {
        let mut next = NEXT_TOKEN.lock();
        let token = *next;
        *next += 1;
        token
    };

    SLEEPERS.lock().push(Sleeper {
        token,
        deadline,
        thread: Arc::downgrade(thread),
    });

    token
}

pub fn unregister_sleeper(token: u64) {
    SLEEPERS.lock().retain(|s| s.token != token);
}

/// Wakes every sleeper whose deadline has passed. Called from the idle
/// loops; harmless to call from anywhere else.
pub fn check_sleepers() {
    let now = now_ms();

    let expired: Vec<Weak<Thread>> = {
        let mut sleepers = SLEEPERS.lock();
        let mut expired = Vec::new();
        sleepers.retain(|s| {
            if s.deadline <= now {
                expired.push(s.thread.clone());
                false
            } else {
                true
            }
        });
        expired
    };

    for weak in expired {
        if let Some(thread) = weak.upgrade() {
            scheduler::wake_up_thread(&thread);
        }
    }
}
