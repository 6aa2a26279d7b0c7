use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use storpu_abi::tasks::{FtlTask, FtlTaskKind, StorpuTask};

use super::llist::LlistHead;
use super::*;
use crate::arch::host::ipi::{SentIpi, take_sent};
use crate::memory::frame_allocator::{self, ZoneSet};
use crate::memory::paging::PAGE_SIZE;
use crate::test_support;

#[test]
fn llist_pop_recovers_fifo_order() {
    static LIST: LlistHead<StorpuTask> = LlistHead::new();

    let mut records: Vec<Box<StorpuTask>> = (1..=3)
        .map(|cid| Box::new(StorpuTask::new_invoke(cid, 0, 0)))
        .collect();

    assert!(LIST.is_empty());
    for record in records.iter_mut() {
        unsafe { LIST.push(&mut **record) };
    }
    assert!(!LIST.is_empty());

    let popped = LIST.pop_all();
    assert_eq!(popped.len(), 3);
    for (i, task) in popped.iter().enumerate() {
        let cid = unsafe { (**task).payload.invoke.cid };
        assert_eq!(cid as usize, i + 1);
    }

    assert!(LIST.is_empty());
    assert!(LIST.pop_all().is_empty());
}

#[test]
fn completion_releases_waiter_and_discards_stale_cookie() {
    let _guard = test_support::scheduler_guard();

    // Register a waiter the way submit does, minus the blocking.
    let done = Arc::new(crate::sync::Completion::new());
    let (key, nonce) = {
        let mut waiters = TASK_WAITERS.lock();
        let nonce = waiters.0;
        waiters.0 = waiters.0.wrapping_add(1);
        (waiters.1.insert((nonce, done.clone())), nonce)
    };

    let mut task = Box::new(StorpuTask::new_create_context(0));
    task.opaque = encode_cookie(key, nonce);

    enqueue_storpu_completion(&mut *task);
    assert!(take_sent().contains(&SentIpi::FtlCompletion));

    handle_storpu_completion();
    assert!(done.is_done());
    assert!(TASK_WAITERS.lock().1.get(key).is_none());

    // The same cookie again is stale now; the completion must be
    // swallowed without waking anyone.
    enqueue_storpu_completion(&mut *task);
    handle_storpu_completion();
}

#[test]
fn nonce_shields_a_recycled_waiter_slot() {
    let _guard = test_support::scheduler_guard();

    let first = Arc::new(crate::sync::Completion::new());
    let (key, first_nonce) = {
        let mut waiters = TASK_WAITERS.lock();
        let nonce = waiters.0;
        waiters.0 = waiters.0.wrapping_add(1);
        (waiters.1.insert((nonce, first.clone())), nonce)
    };

    // The first submitter times out and unregisters...
    TASK_WAITERS.lock().1.try_remove(key);

    // ...and a second submitter recycles the slab slot.
    let second = Arc::new(crate::sync::Completion::new());
    let second_key = {
        let mut waiters = TASK_WAITERS.lock();
        let nonce = waiters.0;
        waiters.0 = waiters.0.wrapping_add(1);
        waiters.1.insert((nonce, second.clone()))
    };
    assert_eq!(key, second_key);

    // The late completion still carries the first submitter's cookie and
    // must not fire the second waiter.
    let mut task = Box::new(StorpuTask::new_create_context(0));
    task.opaque = encode_cookie(key, first_nonce);
    enqueue_storpu_completion(&mut *task);
    handle_storpu_completion();

    assert!(!first.is_done());
    assert!(!second.is_done());

    TASK_WAITERS.lock().1.try_remove(second_key);
}

#[test]
fn mock_ftl_services_io_synchronously() {
    let _guard = test_support::scheduler_guard();
    let state = test_support::install_mock_ftl(1 << 16);

    let buf = frame_allocator::alloc_vmpages(1, ZoneSet::ANY).unwrap();
    unsafe {
        core::ptr::write_bytes(buf.into_ptr::<u8>(), 0x3C, PAGE_SIZE);
    }

    let mut task = FtlTask::new(FtlTaskKind::FlashWrite, 0);
    task.nsid = 1;
    task.buf_phys = buf.into_phys().into_raw() as u64;
    task.addr = 0x2000;
    task.count = PAGE_SIZE as u64;

    assert_eq!(submit_ftl_task_and_wait(&mut task), 0);

    let st = state.lock().unwrap();
    assert_eq!(st.writes, alloc::vec![(1, 0x2000, PAGE_SIZE as u64)]);
    assert!(st.data[0x2000..0x2000 + PAGE_SIZE].iter().all(|b| *b == 0x3C));
}
