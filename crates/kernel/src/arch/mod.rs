//! Architecture specific code: cpu identification, interrupt masking, the
//! register-context switch primitive, cache/TLB maintenance, the serial
//! port, timekeeping and the IPI doorbells.
//!
//! Everything above this module is portable. The aarch64 side is what runs
//! on the device; every other target gets the `host` fallback, which is
//! complete enough to build and unit-test the runtime off-device (its
//! context switch is the one thing left unimplemented).

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        use aarch64 as imp;
    } else {
        pub mod host;
        use host as imp;
    }
}

pub use imp::{cpu_id, halt, scratchpad_base, time_ms, wait_for_interrupt};

pub mod serial {
    pub use super::imp::serial::_serial;
}

pub mod threading {
    pub use super::imp::threading::{
        CpuContext, cpu_switch, init_context, set_current_thread, set_tls_pointer,
    };
}

pub mod mmu {
    pub use super::imp::mmu::{flush_icache, flush_tlb_all, flush_tlb_page, switch_address_space};
}

pub mod ipi {
    pub use super::imp::ipi::{send_ftl_completion, send_reschedule};
}

/// Saved interrupt state; interrupts are restored on drop.
pub struct IrqGuard {
    flags: usize,
}

impl IrqGuard {
    /// Masks interrupts on the local cpu, remembering the previous state.
    #[inline]
    pub fn new() -> Self {
        Self {
            flags: imp::irq_save(),
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        unsafe { imp::irq_restore(self.flags) }
    }
}

/// Runs `f` with interrupts masked on the local cpu.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::new();
    f()
}

/// Unconditionally unmasks interrupts on the local cpu.
///
/// # Safety
/// Must not be called while a spinlock that interrupt handlers also take is
/// held.
#[inline]
pub unsafe fn irq_enable() {
    unsafe { imp::irq_enable() }
}

/// Unconditionally masks interrupts on the local cpu, losing the previous
/// state. Prefer [`IrqGuard`].
#[inline]
pub fn irq_disable() {
    imp::irq_save();
}
