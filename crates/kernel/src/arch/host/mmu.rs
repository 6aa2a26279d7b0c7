use crate::{PhysAddr, VirtAddr};

pub fn switch_address_space(_pgd: PhysAddr) {}

pub fn flush_tlb_all() {}

pub fn flush_tlb_page(_addr: VirtAddr) {}

pub fn flush_icache() {}
