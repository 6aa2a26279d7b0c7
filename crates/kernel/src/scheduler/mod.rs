//! The per-cpu round-robin scheduler.
//!
//! Each cpu owns a run queue, an idle thread and a stopper thread. Policy
//! is FIFO round-robin with no priorities: the next thread is the head of
//! the queue and immediately goes back to the tail. Blocked threads leave
//! the queue entirely; wake-ups re-queue them on their wake cpu, sending a
//! reschedule IPI when that is a different core.
//!
//! Cross-cpu ordering rests on three fields of the thread record: `state`
//! (release-published), `on_cpu` (set while the thread's registers are
//! live on some core) and `on_rq` (queued / transiently migrating). The
//! affinity path serializes queue moves through the per-cpu stopper so a
//! thread is never lost between queues.

pub mod stop;

#[cfg(test)]
mod tests;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{Ordering, fence};

use lazy_static::lazy_static;

use storpu_abi::errors::Errno;

use crate::arch::{self, IrqGuard};
use crate::smp::{CpuLocal, CpuMask, cpu_id, cpu_online_mask};
use crate::sync::Completion;
use crate::thread::{self, ON_RQ_MIGRATING, ON_RQ_QUEUED, Thread, ThreadState};
use crate::utils::locks::{SpinLock, SpinLockGuard, spinlock};
use crate::{time, vm};

type RqGuard<'a> = SpinLockGuard<'a, VecDeque<Arc<Thread>>>;

pub struct RunQueue {
    cpu: usize,
    queue: SpinLock<VecDeque<Arc<Thread>>>,
}

/// Everything the scheduler keeps per cpu.
pub struct SchedCpu {
    rq: RunQueue,
    /// Written only during a context switch on this cpu, with the rq lock
    /// held and interrupts masked.
    current: UnsafeCell<Option<Arc<Thread>>>,
    prev: UnsafeCell<Option<Arc<Thread>>>,
    idle: spin::Once<Arc<Thread>>,
}

unsafe impl Send for SchedCpu {}
unsafe impl Sync for SchedCpu {}

impl SchedCpu {
    fn new(cpu: usize) -> Self {
        Self {
            rq: RunQueue {
                cpu,
                queue: spinlock(VecDeque::new()),
            },
            current: UnsafeCell::new(None),
            prev: UnsafeCell::new(None),
            idle: spin::Once::new(),
        }
    }
}

lazy_static! {
    static ref SCHED: CpuLocal<SchedCpu> = CpuLocal::from_fn(SchedCpu::new);
}

/// Installs this cpu's bootstrap and idle threads. Called once per core
/// from `thread::init_cpu`.
pub(crate) fn install_cpu_threads(main: Arc<Thread>, idle: Arc<Thread>) {
    let sc = SCHED.get();
    unsafe { *sc.current.get() = Some(main) };
    sc.idle.call_once(|| idle);
}

/// The thread currently executing on this cpu, if the scheduler is up.
pub fn current_thread() -> Option<Arc<Thread>> {
    // Only this cpu's switch path writes the slot, never concurrently
    // with this read.
    unsafe { (*SCHED.get().current.get()).clone() }
}

fn activate(queue: &mut RqGuard<'_>, thread: &Arc<Thread>) {
    thread.on_rq.store(ON_RQ_QUEUED, Ordering::Release);
    queue.push_back(thread.clone());
}

fn deactivate(queue: &mut RqGuard<'_>, thread: &Arc<Thread>, sleep: bool) {
    thread.on_rq.store(
        if sleep { 0 } else { ON_RQ_MIGRATING },
        Ordering::Release,
    );
    if let Some(pos) = queue.iter().position(|t| Arc::ptr_eq(t, thread)) {
        queue.remove(pos);
    }
}

/// Head of the queue, re-appended at the tail for round-robin.
fn pick_next(queue: &mut RqGuard<'_>) -> Option<Arc<Thread>> {
    let next = queue.pop_front()?;
    queue.push_back(next.clone());
    Some(next)
}

fn resched_curr(sc: &SchedCpu) {
    if sc.rq.cpu != cpu_id() {
        arch::ipi::send_reschedule(sc.rq.cpu);
    }
}

/// Locks the run queue a thread currently belongs to, re-checking after
/// the lock that the thread has neither changed cpus nor is mid-migration.
/// The caller holds the thread's pi-lock.
fn thread_rq_lock<'a>(thread: &Arc<Thread>) -> (&'a SchedCpu, RqGuard<'a>) {
    loop {
        let sc = SCHED.cpu(thread.cpu());
        let queue = sc.rq.queue.lock();
        if sc.rq.cpu == thread.cpu() && !thread.on_rq_migrating() {
            return (sc, queue);
        }
        drop(queue);

        while thread.on_rq_migrating() {
            core::hint::spin_loop();
        }
    }
}

/// Voluntarily gives up the cpu. The only way a thread stops running:
/// either it stays runnable and goes to the back of the queue, or it has
/// already published a blocking state and is detached here.
pub fn schedule() {
    let Some(prev) = current_thread() else {
        // The core has not entered the scheduler yet.
        return;
    };

    arch::irq_disable();
    let sc = SCHED.get();
    let mut queue = sc.rq.queue.lock();

    if prev.state() != ThreadState::RUNNING {
        deactivate(&mut queue, &prev, true);
    }

    let next = match pick_next(&mut queue) {
        Some(next) => next,
        None => sc.idle.get().expect("cpu has no idle thread").clone(),
    };

    if Arc::ptr_eq(&prev, &next) {
        drop(queue);
        unsafe { arch::irq_enable() };
        return;
    }

    // The queue lock stays held across the switch and is released by the
    // epilogue running on the next thread's stack.
    core::mem::forget(queue);
    context_switch(sc, prev, next);
}

fn context_switch(sc: &SchedCpu, prev: Arc<Thread>, next: Arc<Thread>) {
    next.on_cpu.store(1, Ordering::Relaxed);

    if let Some(next_vm) = next.vm_context() {
        let same = prev
            .vm_context()
            .is_some_and(|prev_vm| Arc::ptr_eq(&prev_vm, &next_vm));
        if !same {
            vm::switch_context(&next_vm);
        }
    }

    let prev_ctx;
    let next_ctx;
    unsafe {
        arch::threading::set_current_thread(Arc::as_ptr(&next) as usize);
        arch::threading::set_tls_pointer(next.tls_tcb());

        *sc.prev.get() = Some(prev.clone());
        *sc.current.get() = Some(next.clone());

        prev_ctx = prev.ctx_ptr();
        next_ctx = next.ctx_ptr();
    }

    // Nothing else on this stack may own an Arc past this point: a stack
    // whose thread exits is freed without running destructors.
    drop(prev);
    drop(next);

    unsafe {
        arch::threading::cpu_switch(prev_ctx, next_ctx);
    }

    // Back on this thread's stack, on whichever cpu resumed it.
    finish_switch();
}

fn finish_switch() {
    let sc = SCHED.get();

    let prev = unsafe { (*sc.prev.get()).take() }.expect("switch epilogue without a previous thread");
    prev.on_cpu.store(0, Ordering::Release);

    unsafe {
        sc.rq.queue.force_unlock();
        arch::irq_enable();
    }

    if prev.state().contains(ThreadState::REAPABLE) {
        thread::reap(&prev);
    }
}

/// First code on a fresh thread's stack: releases the locks its creator's
/// cpu handed over.
pub fn schedule_tail() {
    finish_switch();
}

/// Queues a newly created thread on its home cpu.
pub fn wake_up_new_thread(thread: &Arc<Thread>) {
    let _irq = IrqGuard::new();
    let _pi = thread.pi_lock.lock();

    thread.set_state_relaxed(ThreadState::RUNNING);

    let (_sc, mut queue) = thread_rq_lock(thread);
    activate(&mut queue, thread);
}

/// Wake fast path: the thread never left its queue, flipping the state
/// back to running is enough.
fn ttwu_runnable(thread: &Arc<Thread>) -> bool {
    let (_sc, queue) = thread_rq_lock(thread);
    let runnable = thread.on_rq_queued();
    if runnable {
        thread.set_state_relaxed(ThreadState::RUNNING);
    }
    drop(queue);
    runnable
}

fn ttwu_queue(thread: &Arc<Thread>, cpu: usize) {
    let sc = SCHED.cpu(cpu);
    let mut queue = sc.rq.queue.lock();

    activate(&mut queue, thread);
    resched_curr(sc);
    thread.set_state_relaxed(ThreadState::RUNNING);
}

fn try_to_wake_up(thread: &Arc<Thread>, state_mask: ThreadState) -> bool {
    if let Some(current) = current_thread()
        && Arc::ptr_eq(&current, thread)
    {
        if !thread.state().intersects(state_mask) {
            return false;
        }
        thread.set_state_relaxed(ThreadState::RUNNING);
        return true;
    }

    let _irq = IrqGuard::new();
    let _pi = thread.pi_lock.lock();

    if !thread.state_acquire().intersects(state_mask) {
        return false;
    }

    if thread.on_rq.load(Ordering::Acquire) != 0 && ttwu_runnable(thread) {
        return true;
    }

    fence(Ordering::Acquire);
    thread.set_state_relaxed(ThreadState::WAKING);

    // Wait for the previous cpu to finish switching away from it; its
    // registers must be fully saved before it can run elsewhere.
    while thread.on_cpu.load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
    }
    fence(Ordering::Acquire);

    let cpu = thread.wake_cpu();
    if thread.cpu() != cpu {
        thread.set_cpu(cpu);
    }

    ttwu_queue(thread, cpu);
    true
}

/// Wakes a blocked thread; `false` when it was not blocked (the wake is
/// then someone else's, or spurious).
pub fn wake_up_thread(thread: &Arc<Thread>) -> bool {
    try_to_wake_up(thread, ThreadState::BLOCKED)
}

/// Work item handed to a stopper: move `thread` to `dest_cpu`.
pub(crate) struct Migration {
    thread: Arc<Thread>,
    dest_cpu: Cell<usize>,
    pending: *mut SetAffinityPending,
}

/// Lives on the stack of the `set_cpus_allowed` caller, which stays
/// parked on `done` for as long as anything can reach this record.
pub(crate) struct SetAffinityPending {
    stop_pending: Cell<bool>,
    done: Arc<Completion>,
    arg: Migration,
}

/// Dequeues a queued thread from `from`'s queue and re-queues it on
/// `new_cpu`, kicking that cpu. The `MIGRATING` on_rq state covers the
/// window where the thread is on neither queue.
fn move_queued_thread(
    from: &SchedCpu,
    mut queue: RqGuard<'_>,
    thread: &Arc<Thread>,
    new_cpu: usize,
) {
    debug_assert_eq!(from.rq.cpu, thread.cpu());

    deactivate(&mut queue, thread, false);
    thread.set_cpu(new_cpu);
    drop(queue);

    let to = SCHED.cpu(new_cpu);
    let mut queue = to.rq.queue.lock();
    activate(&mut queue, thread);
    resched_curr(to);
}

/// Stopper work: runs on the cpu the thread was last seen on, with the
/// authority to move it. Re-dispatches itself if the thread moved first.
pub(crate) fn migration_cpu_stop(raw: *mut ()) {
    let arg = unsafe { &*(raw as *const Migration) };
    let thread = arg.thread.clone();
    let pending = arg.pending;

    let mut complete = false;
    let done = unsafe { (*pending).done.clone() };

    {
        let _irq = IrqGuard::new();
        let mut pi = thread.pi_lock.lock();
        let sc = SCHED.get();
        let queue = sc.rq.queue.lock();

        if thread.cpu() == sc.rq.cpu {
            pi.migration_pending = core::ptr::null_mut();
            complete = true;

            if !thread.cpus_mask.test(thread.cpu()) {
                if thread.on_rq_queued() {
                    move_queued_thread(sc, queue, &thread, arg.dest_cpu.get());
                } else {
                    thread.set_wake_cpu(arg.dest_cpu.get());
                }
            }
        } else {
            if thread.cpus_mask.test(thread.cpu()) {
                pi.migration_pending = core::ptr::null_mut();
                complete = true;
            } else {
                // The thread migrated on its own before we ran; chase it.
                drop(queue);
                drop(pi);
                stop::stop_one_cpu_nowait(thread.cpu(), migration_cpu_stop, raw);
                return;
            }
        }

        unsafe { (*pending).stop_pending.set(false) };
    }

    if complete {
        done.complete_all();
    }
}

/// Applies a new allowed-cpu mask, migrating the thread off a now-dis-
/// allowed cpu. Blocks until the move is visible.
fn set_cpus_allowed(thread: &Arc<Thread>, new_mask: &CpuMask) -> Result<(), Errno> {
    enum AfterUnlock {
        Nothing,
        Complete(Arc<Completion>),
        QueueStop(usize, *mut ()),
    }

    let mut my_pending: Option<SetAffinityPending> = None;
    let done: Arc<Completion>;
    let after: AfterUnlock;

    {
        let _irq = IrqGuard::new();
        let mut pi = thread.pi_lock.lock();
        let (sc, queue) = thread_rq_lock(thread);

        if thread.cpus_mask.equal(new_mask) {
            return Ok(());
        }

        let dest_cpu = new_mask.any().ok_or(Errno::EINVAL)?;
        thread.cpus_mask.copy_from(new_mask);

        if thread.cpus_mask.test(thread.cpu()) {
            // Still on an allowed cpu; just retire any stale pending move.
            let stale = pi.migration_pending as *mut SetAffinityPending;
            let mut to_complete = None;
            if !stale.is_null() && unsafe { !(*stale).stop_pending.get() } {
                pi.migration_pending = core::ptr::null_mut();
                to_complete = Some(unsafe { (*stale).done.clone() });
            }

            drop(queue);
            drop(pi);
            if let Some(completion) = to_complete {
                completion.complete_all();
            }
            return Ok(());
        }

        // Install (or redirect) the pending descriptor under the pi-lock.
        let pending_ptr = if pi.migration_pending.is_null() {
            let pending = my_pending.insert(SetAffinityPending {
                stop_pending: Cell::new(false),
                done: Arc::new(Completion::new()),
                arg: Migration {
                    thread: thread.clone(),
                    dest_cpu: Cell::new(dest_cpu),
                    pending: core::ptr::null_mut(),
                },
            });
            let ptr = pending as *mut SetAffinityPending;
            pending.arg.pending = ptr;
            pi.migration_pending = ptr as *mut ();
            ptr
        } else {
            let ptr = pi.migration_pending as *mut SetAffinityPending;
            unsafe { (*ptr).arg.dest_cpu.set(dest_cpu) };
            ptr
        };

        done = unsafe { (*pending_ptr).done.clone() };

        let running_or_waking = thread.on_cpu.load(Ordering::Relaxed) != 0
            || thread.state() == ThreadState::WAKING;

        if running_or_waking {
            // Someone must stop the thread's cpu to move it; only one
            // stopper dispatch may be in flight per descriptor.
            let stop_pending = unsafe { (*pending_ptr).stop_pending.get() };
            if !stop_pending {
                unsafe { (*pending_ptr).stop_pending.set(true) };
                after = AfterUnlock::QueueStop(
                    sc.rq.cpu,
                    unsafe { &raw mut (*pending_ptr).arg } as *mut (),
                );
            } else {
                after = AfterUnlock::Nothing;
            }
        } else {
            if thread.on_rq_queued() {
                move_queued_thread(sc, queue, thread, dest_cpu);
            }

            if unsafe { !(*pending_ptr).stop_pending.get() } {
                pi.migration_pending = core::ptr::null_mut();
                after = AfterUnlock::Complete(done.clone());
            } else {
                after = AfterUnlock::Nothing;
            }
        }
    }

    match after {
        AfterUnlock::Nothing => {}
        AfterUnlock::Complete(completion) => completion.complete_all(),
        AfterUnlock::QueueStop(cpu, arg) => stop::stop_one_cpu_nowait(cpu, migration_cpu_stop, arg),
    }

    done.wait();
    Ok(())
}

/// `sched_setaffinity`: intersects with the online cpus and applies.
pub fn sched_setaffinity(thread: &Arc<Thread>, mask: &CpuMask) -> Result<(), Errno> {
    let new_mask = CpuMask::empty();
    if !new_mask.assign_and(mask, cpu_online_mask()) {
        return Err(Errno::EINVAL);
    }

    set_cpus_allowed(thread, &new_mask)
}

/// The idle loop: sweep timed waiters, offer the cpu, sleep until kicked.
pub extern "C" fn idle_main(_cpu: u64) -> u64 {
    loop {
        time::check_sleepers();
        schedule();
        arch::wait_for_interrupt();
    }
}

/// Empties every run queue down to the cpu's current thread so one test's
/// leftovers cannot make a later `schedule` attempt a real switch.
#[cfg(test)]
pub(crate) fn purge_run_queues_for_tests() {
    for cpu in 0..crate::config::NR_CPUS {
        let sc = SCHED.cpu(cpu);
        let current = unsafe { (*sc.current.get()).clone() };
        let mut queue = sc.rq.queue.lock();
        queue.retain(|t| current.as_ref().is_some_and(|c| Arc::ptr_eq(c, t)));
    }
}

/// Whether `thread` sits on `cpu`'s run queue right now.
#[cfg(test)]
pub(crate) fn queued_on_for_tests(thread: &Arc<Thread>, cpu: usize) -> bool {
    SCHED
        .cpu(cpu)
        .rq
        .queue
        .lock()
        .iter()
        .any(|t| Arc::ptr_eq(t, thread))
}

/// Detaches a runnable thread from its queue as if it had blocked.
#[cfg(test)]
pub(crate) fn park_for_tests(thread: &Arc<Thread>) {
    let _irq = IrqGuard::new();
    let _pi = thread.pi_lock.lock();
    let (_sc, mut queue) = thread_rq_lock(thread);
    thread.set_state_relaxed(ThreadState::BLOCKED);
    deactivate(&mut queue, thread, true);
}
