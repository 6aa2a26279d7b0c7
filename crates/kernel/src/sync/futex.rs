//! The in-kernel wait primitive everything else blocks through.
//!
//! A futex is a spinlocked FIFO of waiting threads keyed on a 32-bit word.
//! A waiter enqueues only if the word still holds the expected value; the
//! check happens under the queue lock, so a waker that changes the word
//! and then calls [`Futex::wake`] cannot lose the wake-up. The word read
//! itself is relaxed; ordering comes from the waker's release store on the
//! word plus the queue lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use storpu_abi::errors::Errno;

use crate::scheduler;
use crate::thread::{self, Thread, ThreadState};
use crate::time;
use crate::utils::locks::{SpinLock, spinlock};

pub struct Futex {
    waiters: SpinLock<VecDeque<Arc<Thread>>>,
}

impl Futex {
    pub const fn new() -> Self {
        Self {
            waiters: spinlock(VecDeque::new()),
        }
    }

    /// Blocks until woken, provided `*word == expected` at enqueue time.
    /// Spurious wake-ups return `Ok` like everything else.
    pub fn wait(&self, word: &AtomicU32, expected: u32) {
        let _ = self.wait_inner(word, expected, None);
    }

    /// Like [`wait`](Self::wait), giving up at `deadline` (absolute
    /// milliseconds). The deadline sweep in the idle loop delivers the
    /// timeout wake-up.
    pub fn wait_until(&self, word: &AtomicU32, expected: u32, deadline: u64) -> Result<(), Errno> {
        self.wait_inner(word, expected, Some(deadline))
    }

    fn wait_inner(
        &self,
        word: &AtomicU32,
        expected: u32,
        deadline: Option<u64>,
    ) -> Result<(), Errno> {
        let current = thread::current();

        let mut queue = self.waiters.lock();
        if word.load(Ordering::Relaxed) != expected {
            return Ok(());
        }

        current.set_state(ThreadState::BLOCKED);
        queue.push_back(current.clone());
        drop(queue);

        let sleeper = deadline.map(|at| time::register_sleeper(at, &current));

        scheduler::schedule();

        if let Some(token) = sleeper {
            time::unregister_sleeper(token);
        }

        // A futex wake dequeues before waking; still being linked here
        // means the wake came from the deadline sweep (or was spurious).
        let mut queue = self.waiters.lock();
        let position = queue.iter().position(|t| Arc::ptr_eq(t, &current));
        if let Some(position) = position {
            queue.remove(position);
        }
        let still_queued = position.is_some();
        drop(queue);

        match deadline {
            Some(at) if still_queued && time::now_ms() >= at => Err(Errno::ETIMEDOUT),
            _ => Ok(()),
        }
    }

    /// Wakes up to `count` waiters in FIFO order; returns how many.
    pub fn wake(&self, count: u32) -> usize {
        let mut queue = self.waiters.lock();

        let mut woken = 0;
        while woken < count as usize {
            let Some(thread) = queue.pop_front() else {
                break;
            };
            scheduler::wake_up_thread(&thread);
            woken += 1;
        }

        woken
    }
}

impl Default for Futex {
    fn default() -> Self {
        Self::new()
    }
}
