//! Per-cpu stopper threads.
//!
//! A stopper executes short work items on its own cpu with that cpu's
//! scheduling authority; the affinity path uses it to move threads that
//! are running or waking. Work never blocks and never migrates.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use lazy_static::lazy_static;

use crate::arch::IrqGuard;
use crate::debug::Scheduler;
use crate::scheduler;
use crate::smp::{CpuLocal, CpuMask, cpu_id};
use crate::thread::{self, Thread, ThreadState, current::current};
use crate::utils::locks::{SpinLock, spinlock};

pub type StopFn = fn(*mut ());

#[derive(Clone, Copy)]
pub struct StopWork {
    func: StopFn,
    arg: *mut (),
}

unsafe impl Send for StopWork {}

struct CpuStopper {
    works: SpinLock<VecDeque<StopWork>>,
    thread: spin::Once<Arc<Thread>>,
}

lazy_static! {
    static ref STOPPERS: CpuLocal<CpuStopper> = CpuLocal::from_fn(|_| CpuStopper {
        works: spinlock(VecDeque::new()),
        thread: spin::Once::new(),
    });
}

extern "C" fn stopper_main(_cpu: u64) -> u64 {
    let stopper = STOPPERS.get();

    loop {
        let work = loop {
            current().set_state(ThreadState::BLOCKED);

            let work = {
                let _irq = IrqGuard::new();
                stopper.works.lock().pop_front()
            };

            if let Some(work) = work {
                break work;
            }

            scheduler::schedule();
        };
        current().set_state_relaxed(ThreadState::RUNNING);

        (work.func)(work.arg);
    }
}

pub fn init() {
    // Work queues are constructed lazily; the per-cpu threads come up in
    // `init_cpu`.
}

/// Spawns this cpu's stopper thread, pinned here.
pub fn init_cpu() {
    let cpu = cpu_id();
    let stopper = STOPPERS.get();

    let thread = thread::create_on_cpu(
        None,
        core::ptr::null_mut(),
        None,
        cpu,
        stopper_main as usize,
        cpu as u64,
    )
    .expect("failed to create the stopper thread");
    thread.cpus_mask.copy_from(&CpuMask::of(cpu));

    stopper.thread.call_once(|| thread);
    debug!(Scheduler, "cpu {cpu} stopper ready");
}

/// Queues `func(arg)` on `cpu`'s stopper and kicks it; does not wait.
pub fn stop_one_cpu_nowait(cpu: usize, func: StopFn, arg: *mut ()) {
    let stopper = STOPPERS.cpu(cpu);

    let _irq = IrqGuard::new();
    let mut works = stopper.works.lock();
    works.push_back(StopWork { func, arg });

    if let Some(thread) = stopper.thread.get() {
        scheduler::wake_up_thread(thread);
    }
}

/// How many work items sit unprocessed on `cpu`'s stopper.
pub fn queued_work(cpu: usize) -> usize {
    STOPPERS.cpu(cpu).works.lock().len()
}

/// Runs every queued work item of `cpu` inline on the caller. Only the
/// host test harness drives stoppers this way; on the device the per-cpu
/// stopper threads do.
#[cfg(test)]
pub(crate) fn drain_for_tests(cpu: usize) -> usize {
    let mut ran = 0;
    loop {
        let work = STOPPERS.cpu(cpu).works.lock().pop_front();
        match work {
            Some(work) => {
                (work.func)(work.arg);
                ran += 1;
            }
            None => return ran,
        }
    }
}
