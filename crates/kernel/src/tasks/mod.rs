//! The FTL <-> StorPU task channels.
//!
//! Three lock-free lists: requests (FTL to StorPU), completions (StorPU to
//! FTL, drained by the completion IPI) and FTL-bound I/O. Task records are
//! owned by their submitters for their whole lifetime; the `opaque` cookie
//! names the submitter's waiter, and a completion that finds no live
//! waiter behind its cookie (the submitter timed out) is discarded.

pub mod llist;
pub mod service;

#[cfg(test)]
mod tests;

use alloc::sync::Arc;
use core::sync::atomic::AtomicU64;

use slab::Slab;

use storpu_abi::errors::Errno;
use storpu_abi::tasks::{FtlTask, StorpuTask};

use crate::sync::Completion;
use crate::thread::{self, Thread, ThreadState};
use crate::utils::locks::{SpinLock, spinlock};
use crate::{arch, scheduler, smp};

use llist::{LlistHead, LlistNode};

impl LlistNode for StorpuTask {
    fn llist_next(&self) -> &AtomicU64 {
        &self.llist_next
    }
}

impl LlistNode for FtlTask {
    fn llist_next(&self) -> &AtomicU64 {
        &self.llist_next
    }
}

static STORPU_REQUESTS: LlistHead<StorpuTask> = LlistHead::new();
static STORPU_COMPLETIONS: LlistHead<StorpuTask> = LlistHead::new();
static FTL_TASKS: LlistHead<FtlTask> = LlistHead::new();

/// Waiters parked on a StorPU request, keyed by the cookie in the task.
/// The nonce guards against a recycled slab key meeting a late completion
/// of its predecessor.
static TASK_WAITERS: SpinLock<(u32, Slab<(u32, Arc<Completion>)>)> = spinlock((0, Slab::new()));

/// Threads blocked on an FTL-bound I/O task.
static FTL_WAITERS: SpinLock<Slab<Arc<Thread>>> = spinlock(Slab::new());

fn encode_cookie(key: usize, nonce: u32) -> u64 {
    ((nonce as u64) << 32) | (key as u64 + 1)
}

fn decode_cookie(cookie: u64) -> Option<(usize, u32)> {
    let key = (cookie & 0xffff_ffff) as usize;
    (key != 0).then(|| (key - 1, (cookie >> 32) as u32))
}

/// Pushes a request and parks the caller until its completion arrives or
/// the timeout expires (`0` = wait forever). On a timeout the waiter is
/// unregistered, so a completion arriving later is accepted but its
/// effects are discarded; the task record stays owned by the caller
/// either way.
pub fn submit_storpu_task(task: &mut StorpuTask, timeout_ms: u32) -> Result<(), Errno> {
    let done = Arc::new(Completion::new());

    let key;
    let nonce;
    {
        let mut waiters = TASK_WAITERS.lock();
        nonce = waiters.0;
        waiters.0 = waiters.0.wrapping_add(1);
        key = waiters.1.insert((nonce, done.clone()));
    }
    task.opaque = encode_cookie(key, nonce);

    unsafe { STORPU_REQUESTS.push(task) };
    ring_request_doorbell();

    match done.wait_timeout(timeout_ms) {
        Ok(()) => Ok(()),
        Err(err) => {
            let removed = TASK_WAITERS.lock().1.try_remove(key);
            if removed.is_some() {
                return Err(err);
            }
            // The completion squeezed in as we gave up; take it.
            done.wait();
            Ok(())
        }
    }
}

/// StorPU-side: takes every pending request, oldest first.
pub fn dequeue_storpu_requests() -> alloc::vec::Vec<*mut StorpuTask> {
    STORPU_REQUESTS.pop_all()
}

/// StorPU-side: posts a finished request back and rings the FTL core.
pub fn enqueue_storpu_completion(task: *mut StorpuTask) {
    unsafe { STORPU_COMPLETIONS.push(task) };
    arch::ipi::send_ftl_completion();
}

/// Completion-IPI handler on the FTL core: releases every waiter whose
/// task completed, in submission order.
pub fn handle_storpu_completion() {
    for task in STORPU_COMPLETIONS.pop_all() {
        let cookie = unsafe { (*task).opaque };

        let Some((key, nonce)) = decode_cookie(cookie) else {
            continue;
        };

        let done = {
            let mut waiters = TASK_WAITERS.lock();
            let live = waiters
                .1
                .get(key)
                .is_some_and(|(stored_nonce, _)| *stored_nonce == nonce);
            // A stale cookie means the submitter timed out and moved on;
            // the late completion is dropped here.
            live.then(|| waiters.1.remove(key).1)
        };

        if let Some(done) = done {
            done.complete_all();
        }
    }
}

/// Packages the calling thread behind an FTL-bound task and blocks until
/// the FTL services it. State change, enqueue and yield form one unit:
/// the wake can only chase a fully parked thread.
pub fn submit_ftl_task_and_wait(task: &mut FtlTask) -> i32 {
    #[cfg(test)]
    if mock::try_handle(task) {
        return task.retval;
    }

    let current = thread::current::current();
    task.src_cpu = smp::cpu_id() as i32;

    let key = FTL_WAITERS.lock().insert(current.clone());
    task.opaque = key as u64 + 1;

    current.set_state(ThreadState::BLOCKED);
    unsafe { FTL_TASKS.push(task) };
    scheduler::schedule();

    task.retval
}

/// FTL-side: takes every pending I/O task, oldest first.
pub fn dequeue_ftl_tasks() -> alloc::vec::Vec<*mut FtlTask> {
    FTL_TASKS.pop_all()
}

/// FTL-side: wakes the thread behind a serviced I/O task.
pub fn ftl_complete_task(task: *mut FtlTask) {
    let cookie = unsafe { (*task).opaque };
    if cookie == 0 {
        return;
    }

    let waiter = FTL_WAITERS.lock().try_remove(cookie as usize - 1);
    if let Some(waiter) = waiter {
        scheduler::wake_up_thread(&waiter);
    }
}

/// Nudges the online compute cores so an idle one picks the request up.
fn ring_request_doorbell() {
    for cpu in smp::cpu_online_mask().iter() {
        arch::ipi::send_reschedule(cpu);
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! A synchronous stand-in for the FTL core: an installed handler
    //! services FTL-bound tasks inline at submit time.

    use alloc::boxed::Box;

    use storpu_abi::tasks::FtlTask;

    use crate::utils::locks::{SpinLock, spinlock};

    pub type Handler = Box<dyn FnMut(&mut FtlTask) + Send>;

    static HANDLER: SpinLock<Option<Handler>> = spinlock(None);

    pub fn install(handler: Handler) {
        *HANDLER.lock() = Some(handler);
    }

    pub fn clear() {
        *HANDLER.lock() = None;
    }

    pub(super) fn try_handle(task: &mut FtlTask) -> bool {
        match &mut *HANDLER.lock() {
            Some(handler) => {
                handler(task);
                true
            }
            None => false,
        }
    }
}
