use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::Cell;

use super::*;
use crate::arch::host::ipi::{SentIpi, take_sent};
use crate::test_support;
use crate::thread::{self, Thread, ThreadState};

extern "C" fn nop_thread(_arg: u64) -> u64 {
    0
}

fn spawn_queued(cpu: usize) -> Arc<Thread> {
    thread::create_on_cpu(
        None,
        core::ptr::null_mut(),
        None,
        cpu,
        nop_thread as usize,
        0,
    )
    .expect("failed to create a test thread")
}

#[test]
fn schedule_with_empty_queue_is_a_noop() {
    let _guard = test_support::scheduler_guard();

    // Only the bootstrap thread is runnable; schedule must come straight
    // back without attempting a switch.
    schedule();
    schedule();
}

#[test]
fn wake_of_queued_thread_only_flips_state() {
    let _guard = test_support::scheduler_guard();

    let thread = spawn_queued(0);
    assert!(queued_on_for_tests(&thread, 0));
    assert_eq!(thread.state(), ThreadState::RUNNING);

    thread.set_state(ThreadState::BLOCKED);
    assert!(wake_up_thread(&thread));
    assert_eq!(thread.state(), ThreadState::RUNNING);
    assert!(queued_on_for_tests(&thread, 0));

    // The fast path never leaves the queue, so no cross-core kick.
    assert!(take_sent().is_empty());
}

#[test]
fn wake_of_parked_thread_requeues_on_wake_cpu() {
    let _guard = test_support::scheduler_guard();

    let thread = spawn_queued(0);
    park_for_tests(&thread);
    assert!(!queued_on_for_tests(&thread, 0));

    thread.set_wake_cpu(1);
    assert!(wake_up_thread(&thread));

    assert_eq!(thread.cpu(), 1);
    assert_eq!(thread.state(), ThreadState::RUNNING);
    assert!(queued_on_for_tests(&thread, 1));

    let ipis = take_sent();
    assert_eq!(
        ipis.iter()
            .filter(|ipi| **ipi == SentIpi::Reschedule { cpu: 1 })
            .count(),
        1
    );
}

#[test]
fn wake_of_running_thread_is_refused() {
    let _guard = test_support::scheduler_guard();

    let thread = spawn_queued(0);
    // RUNNING does not intersect the BLOCKED wake mask.
    assert!(!wake_up_thread(&thread));
}

#[test]
fn setaffinity_moves_a_queued_thread() {
    let _guard = test_support::scheduler_guard();

    let thread = spawn_queued(0);

    sched_setaffinity(&thread, &CpuMask::of(1)).unwrap();

    assert_eq!(thread.cpu(), 1);
    assert!(!queued_on_for_tests(&thread, 0));
    assert!(queued_on_for_tests(&thread, 1));
    assert!(thread.cpus_mask.test(1));
    assert!(!thread.cpus_mask.test(0));

    let ipis = take_sent();
    assert_eq!(
        ipis.iter()
            .filter(|ipi| **ipi == SentIpi::Reschedule { cpu: 1 })
            .count(),
        1
    );

    // Same mask again: nothing to do, the call returns without a move.
    sched_setaffinity(&thread, &CpuMask::of(1)).unwrap();
    assert!(queued_on_for_tests(&thread, 1));
}

#[test]
fn setaffinity_to_offline_cpus_is_rejected() {
    let _guard = test_support::scheduler_guard();

    let thread = spawn_queued(0);
    // Cpu 3 never came online in the harness.
    assert_eq!(
        sched_setaffinity(&thread, &CpuMask::of(3)),
        Err(storpu_abi::errors::Errno::EINVAL)
    );
}

#[test]
fn stopper_work_migrates_and_completes() {
    let _guard = test_support::scheduler_guard();

    let thread = spawn_queued(0);
    thread.cpus_mask.copy_from(&CpuMask::of(1));

    // Hand-built migration descriptor, the shape `set_cpus_allowed`
    // installs when the target is mid-execution.
    let mut pending = Box::new(SetAffinityPending {
        stop_pending: Cell::new(true),
        done: Arc::new(crate::sync::Completion::new()),
        arg: Migration {
            thread: thread.clone(),
            dest_cpu: Cell::new(1),
            pending: core::ptr::null_mut(),
        },
    });
    let pending_ptr = &mut *pending as *mut SetAffinityPending;
    pending.arg.pending = pending_ptr;
    thread.pi_lock.lock().migration_pending = pending_ptr as *mut ();

    stop::stop_one_cpu_nowait(
        0,
        migration_cpu_stop,
        unsafe { &raw mut (*pending_ptr).arg } as *mut (),
    );
    assert_eq!(stop::queued_work(0), 1);

    // The harness plays cpu 0's stopper.
    assert_eq!(stop::drain_for_tests(0), 1);

    assert!(pending.done.is_done());
    assert!(!pending.stop_pending.get());
    assert_eq!(thread.cpu(), 1);
    assert!(queued_on_for_tests(&thread, 1));
    assert!(thread.pi_lock.lock().migration_pending.is_null());
}
