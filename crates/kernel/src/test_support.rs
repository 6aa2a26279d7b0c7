//! Shared scaffolding for the host unit tests.
//!
//! Physical memory is a leaked arena seeded into two zones with an
//! identity direct map; the FTL is a synchronous mock recording the I/O
//! it services. Tests that touch scheduler or current-thread state
//! serialize through [`scheduler_guard`] because the harness runs tests
//! on concurrent OS threads while the runtime models one cpu.

use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::vec::Vec;

use storpu_abi::tasks::FtlTaskKind;

use crate::memory::frame_allocator::Zone;
use crate::memory::paging::PAGE_SIZE;
use crate::memory::{align_down, align_up};
use crate::{PhysAddr, memory, scheduler, smp, tasks, thread, vm};

const ARENA_BYTES: usize = 48 << 20;

static INIT: Once = Once::new();

/// Seeds the frame allocator zones once per process.
pub fn init() {
    INIT.call_once(|| {
        let arena: &'static mut [u8] = Box::leak(vec![0u8; ARENA_BYTES].into_boxed_slice());
        let base = arena.as_mut_ptr() as usize;

        let start = align_up(base, PAGE_SIZE);
        let end = align_down(base + arena.len(), PAGE_SIZE);
        let mid = align_down(start + (end - start) / 2, PAGE_SIZE);

        unsafe {
            memory::init_direct_map(0);
            memory::frame_allocator::seed_zone(
                Zone::HighDdr,
                PhysAddr::from_bits(start),
                PhysAddr::from_bits(mid),
            );
            memory::frame_allocator::seed_zone(
                Zone::PlDdr,
                PhysAddr::from_bits(mid),
                PhysAddr::from_bits(end),
            );
        }
    });
}

static SCHED_LOCK: Mutex<()> = Mutex::new(());
static SCHED_INIT: Once = Once::new();

/// Serializes a test against every other scheduler-touching test and
/// makes sure cpu 0 has a current thread. Queues, recorded IPIs and the
/// mock FTL start clean.
pub fn scheduler_guard() -> MutexGuard<'static, ()> {
    init();

    let guard = SCHED_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    SCHED_INIT.call_once(|| {
        crate::arch::host::set_cpu_id(0);
        vm::init();
        thread::init();
        scheduler::stop::init();
        thread::init_cpu();
        smp::set_cpu_online(0, true);
        smp::set_cpu_online(1, true);
    });

    crate::arch::host::set_cpu_id(0);
    scheduler::purge_run_queues_for_tests();
    let _ = crate::arch::host::ipi::take_sent();
    tasks::mock::clear();

    guard
}

/// What the mock FTL saw and stores.
pub struct MockFtlState {
    pub data: Vec<u8>,
    /// `(nsid, addr, count)` per flash write, in order.
    pub writes: Vec<(u32, u64, u64)>,
    pub reads: Vec<(u32, u64, u64)>,
    pub syncs: usize,
}

/// Installs a mock FTL backed by `size` bytes of zeroed flash/host
/// storage, shared across every namespace.
pub fn install_mock_ftl(size: usize) -> Arc<Mutex<MockFtlState>> {
    let state = Arc::new(Mutex::new(MockFtlState {
        data: vec![0; size],
        writes: Vec::new(),
        reads: Vec::new(),
        syncs: 0,
    }));

    let shared = state.clone();
    tasks::mock::install(Box::new(move |task| {
        let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());

        let addr = task.addr as usize;
        let count = task.count as usize;
        let buf = PhysAddr::from_bits(task.buf_phys as usize)
            .into_virt()
            .into_ptr::<u8>();

        task.retval = 0;
        match task.kind() {
            Ok(FtlTaskKind::FlashRead) | Ok(FtlTaskKind::HostRead) => {
                if addr + count > state.data.len() {
                    task.retval = storpu_abi::errors::Errno::EFAULT as i32;
                    return;
                }
                unsafe {
                    core::ptr::copy_nonoverlapping(state.data[addr..].as_ptr(), buf, count);
                }
                let record = (task.nsid, task.addr, task.count);
                state.reads.push(record);
            }
            Ok(FtlTaskKind::FlashWrite) | Ok(FtlTaskKind::HostWrite) => {
                if addr + count > state.data.len() {
                    task.retval = storpu_abi::errors::Errno::EFAULT as i32;
                    return;
                }
                unsafe {
                    core::ptr::copy_nonoverlapping(buf, state.data[addr..].as_mut_ptr(), count);
                }
                let record = (task.nsid, task.addr, task.count);
                state.writes.push(record);
            }
            Ok(FtlTaskKind::Flush) | Ok(FtlTaskKind::FlushData) | Ok(FtlTaskKind::Sync) => {
                state.syncs += 1;
            }
            Err(_) => task.retval = storpu_abi::errors::Errno::EINVAL as i32,
        }
    }));

    state
}
