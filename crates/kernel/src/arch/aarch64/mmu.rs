use core::arch::asm;

use crate::{PhysAddr, VirtAddr};

/// Installs `pgd` as the user-space translation base and drops every stale
/// user mapping from the TLB.
pub fn switch_address_space(pgd: PhysAddr) {
    unsafe {
        asm!(
            "msr ttbr0_el1, {}",
            "tlbi vmalle1",
            "dsb ish",
            "isb",
            in(reg) pgd.into_raw(),
            options(nostack)
        )
    };
}

pub fn flush_tlb_all() {
    unsafe {
        asm!("tlbi vmalle1", "dsb ish", "isb", options(nomem, nostack));
    }
}

pub fn flush_tlb_page(addr: VirtAddr) {
    let page = addr.into_raw() >> 12;
    unsafe {
        asm!(
            "tlbi vaae1is, {}",
            "dsb ish",
            "isb",
            in(reg) page,
            options(nomem, nostack)
        )
    };
}

/// Invalidates the instruction cache after writing code pages (ELF load).
pub fn flush_icache() {
    unsafe {
        asm!("ic iallu", "dsb nsh", "isb", options(nomem, nostack));
    }
}
