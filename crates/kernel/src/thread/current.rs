//! Accessors for the thread executing right now.

use alloc::sync::Arc;

use super::Thread;
use crate::scheduler;

/// The current thread. Panics outside scheduler context (before
/// `init_cpu` on this core).
pub fn current() -> Arc<Thread> {
    scheduler::current_thread().expect("no current thread on this cpu yet")
}

/// The current thread, if this core has entered the scheduler.
pub fn try_current() -> Option<Arc<Thread>> {
    scheduler::current_thread()
}

/// Gives up the cpu, staying runnable at the back of the queue.
pub fn yield_now() {
    scheduler::schedule();
}
