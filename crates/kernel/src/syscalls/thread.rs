//! Guest thread and mutex entry points.
//!
//! Guest mutexes are handles: `spu_mutex_init` allocates the kernel-side
//! state machine and writes its id into the guest's word. The original
//! firmware embedded the wait queue in guest memory instead; a registry
//! keeps the queue structure out of reach of guest stores while the lock
//! protocol stays bit-for-bit the same.

use alloc::sync::Arc;

use slab::Slab;

use storpu_abi::errors::Errno;

use crate::smp::CpuMask;
use crate::sync::mutex::RawSleepMutex;
use crate::thread::{self, ThreadAttr, Tid, current::current};
use crate::utils::locks::{SpinLock, spinlock};
use crate::{VirtAddr, scheduler};

/// Mirrors the guest-visible `thread_attr_t`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RawThreadAttr {
    pub stacksize: usize,
    pub stackaddr: usize,
}

pub extern "C" fn spu_thread_self() -> Tid {
    current().tid()
}

pub extern "C" fn spu_thread_create(
    tid_out: *mut Tid,
    attr: *const RawThreadAttr,
    proc: usize,
    arg: u64,
) -> i32 {
    if tid_out.is_null() {
        return Errno::EINVAL as i32;
    }

    let attr = if attr.is_null() {
        None
    } else {
        let raw = unsafe { *attr };
        Some(ThreadAttr {
            stack_size: raw.stacksize,
            stack_addr: (raw.stackaddr != 0).then(|| VirtAddr::from_bits(raw.stackaddr)),
        })
    };

    let vm = current().vm_context();
    match thread::create(vm, core::ptr::null_mut(), attr, proc, arg) {
        Ok(new) => {
            unsafe { *tid_out = new.tid() };
            0
        }
        Err(err) => err as i32,
    }
}

pub extern "C" fn spu_thread_join(tid: Tid, retval: *mut u64) -> i32 {
    let Some(target) = thread::find(tid) else {
        return Errno::ESRCH as i32;
    };

    let mut value = 0u64;
    match thread::join(&target, Some(&mut value)) {
        Ok(()) => {
            if !retval.is_null() {
                unsafe { *retval = value };
            }
            0
        }
        Err(err) => err as i32,
    }
}

pub extern "C" fn spu_thread_exit(result: u64) -> ! {
    thread::exit(result)
}

pub extern "C" fn spu_sched_setaffinity(tid: Tid, cpusetsize: usize, mask: *const u64) -> i32 {
    let Some(target) = thread::find(tid) else {
        return Errno::ESRCH as i32;
    };

    let raw = if mask.is_null() || cpusetsize < core::mem::size_of::<u64>() {
        0
    } else {
        unsafe { *mask }
    };

    match scheduler::sched_setaffinity(&target, &CpuMask::from_value(raw)) {
        Ok(()) => 0,
        Err(err) => err as i32,
    }
}

struct GuestMutex {
    raw: RawSleepMutex,
}

static GUEST_MUTEXES: SpinLock<Slab<Arc<GuestMutex>>> = spinlock(Slab::new());

fn guest_mutex(handle: u32) -> Option<Arc<GuestMutex>> {
    if handle == 0 {
        return None;
    }
    GUEST_MUTEXES.lock().get(handle as usize - 1).cloned()
}

pub extern "C" fn spu_mutex_init(mutex: *mut u32) -> i32 {
    if mutex.is_null() {
        return Errno::EINVAL as i32;
    }

    let handle = {
        let mut registry = GUEST_MUTEXES.lock();
        registry.insert(Arc::new(GuestMutex {
            raw: RawSleepMutex::new(),
        })) as u32
            + 1
    };

    unsafe { *mutex = handle };
    0
}

pub extern "C" fn spu_mutex_trylock(mutex: *mut u32) -> i32 {
    let Some(guest) = (unsafe { mutex.as_ref() }).and_then(|m| guest_mutex(*m)) else {
        return Errno::EINVAL as i32;
    };

    match guest.raw.try_lock_raw() {
        Ok(()) => 0,
        Err(err) => err as i32,
    }
}

pub extern "C" fn spu_mutex_lock(mutex: *mut u32) -> i32 {
    let Some(guest) = (unsafe { mutex.as_ref() }).and_then(|m| guest_mutex(*m)) else {
        return Errno::EINVAL as i32;
    };

    guest.raw.lock_raw();
    0
}

pub extern "C" fn spu_mutex_unlock(mutex: *mut u32) -> i32 {
    let Some(guest) = (unsafe { mutex.as_ref() }).and_then(|m| guest_mutex(*m)) else {
        return Errno::EINVAL as i32;
    };

    guest.raw.unlock_raw();
    0
}
