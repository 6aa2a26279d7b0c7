use core::sync::atomic::{AtomicUsize, Ordering};

use crate::VirtAddr;

/// Callee-saved register context. On the host nothing is saved; the fields
/// exist so the scheduler's bookkeeping compiles and can be inspected.
#[derive(Debug, Default)]
#[repr(C)]
pub struct CpuContext {
    pub sp: usize,
    pub pc: usize,
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self { sp: 0, pc: 0 }
    }
}

pub fn init_context(ctx: &mut CpuContext, stack_top: VirtAddr, entry: extern "C" fn() -> !) {
    ctx.sp = stack_top.into_raw();
    ctx.pc = entry as usize;
}

/// A real stack-and-register swap only exists on the device.
pub unsafe fn cpu_switch(_prev: *mut CpuContext, _next: *const CpuContext) {
    unimplemented!("context switch is not available on the host")
}

static CURRENT_THREAD: AtomicUsize = AtomicUsize::new(0);
static TLS_POINTER: AtomicUsize = AtomicUsize::new(0);

/// Publishes the current-thread pointer for this cpu.
pub unsafe fn set_current_thread(ptr: usize) {
    CURRENT_THREAD.store(ptr, Ordering::Relaxed);
}

pub unsafe fn set_tls_pointer(ptr: usize) {
    TLS_POINTER.store(ptr, Ordering::Relaxed);
}
