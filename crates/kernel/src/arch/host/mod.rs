//! Portable fallback architecture.
//!
//! Builds the runtime on any non-aarch64 target. Interrupt masking and the
//! doorbells are bookkeeping only, the clock is advanced manually, and the
//! register-context switch is unimplemented; unit tests drive the
//! subsystems directly instead of through a real switch.

pub mod ipi;
pub mod mmu;
pub mod serial;
pub mod threading;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static CPU_ID: AtomicUsize = AtomicUsize::new(0);
static IRQ_DEPTH: AtomicUsize = AtomicUsize::new(0);
static CLOCK_MS: AtomicU64 = AtomicU64::new(0);

pub fn cpu_id() -> usize {
    CPU_ID.load(Ordering::Relaxed)
}

/// Pretend the caller migrated to another cpu. Test hook.
pub fn set_cpu_id(cpu: usize) {
    CPU_ID.store(cpu, Ordering::Relaxed);
}

pub fn irq_save() -> usize {
    IRQ_DEPTH.fetch_add(1, Ordering::Relaxed)
}

pub unsafe fn irq_restore(flags: usize) {
    IRQ_DEPTH.store(flags, Ordering::Relaxed);
}

pub unsafe fn irq_enable() {
    IRQ_DEPTH.store(0, Ordering::Relaxed);
}

pub fn time_ms() -> u64 {
    CLOCK_MS.load(Ordering::Relaxed)
}

/// Advances the fake clock. Test hook.
pub fn advance_time_ms(ms: u64) {
    CLOCK_MS.fetch_add(ms, Ordering::Relaxed);
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// The scratchpad is a plain buffer on the host, handed out raw the way
/// the device MMIO window is.
pub fn scratchpad_base() -> *mut u8 {
    use crate::config::SCRATCHPAD_SIZE;

    #[repr(align(4096))]
    struct Scratchpad(core::cell::UnsafeCell<[u8; SCRATCHPAD_SIZE]>);
    unsafe impl Sync for Scratchpad {}

    static SCRATCHPAD: Scratchpad = Scratchpad(core::cell::UnsafeCell::new([0; SCRATCHPAD_SIZE]));
    SCRATCHPAD.0.get().cast()
}

pub fn halt() -> ! {
    panic!("halt() on host");
}
