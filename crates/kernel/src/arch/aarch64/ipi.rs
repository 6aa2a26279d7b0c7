//! Inter-processor doorbells.
//!
//! Compute-core to compute-core notifications are GIC software-generated
//! interrupts; the FTL core sits behind the SoC's IPI mailbox block and is
//! reached through its trigger register instead.

use core::arch::asm;

use crate::smp::ipi::IpiMsg;

/// IPI mailbox trigger register; the mask selects the FTL core's channel.
const IPI_TRIG: usize = 0xFF30_0000;
const IPI_FTL_CHANNEL: u32 = 1 << 8;

fn send_sgi(cpu: usize, intid: u32) {
    // ICC_SGI1R_EL1: target list in [15:0], INTID in [27:24]; affinity
    // fields stay zero on this single-cluster part.
    let val = (1u64 << (cpu & 0xf)) | ((intid as u64) << 24);
    unsafe {
        asm!("msr icc_sgi1r_el1, {}", "isb", in(reg) val, options(nomem, nostack));
    }
}

/// Pokes `cpu` to re-evaluate its run queue.
pub fn send_reschedule(cpu: usize) {
    send_sgi(cpu, IpiMsg::Reschedule as u32);
}

/// Tells the FTL core to drain the StorPU completion queue.
pub fn send_ftl_completion() {
    unsafe {
        core::ptr::write_volatile(IPI_TRIG as *mut u32, IPI_FTL_CHANNEL);
    }
}
