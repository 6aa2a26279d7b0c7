//! The anonymous backend: demand-allocated private memory.
//!
//! Faults hand out one zero-filled frame (unzeroed when the region was
//! created `UNINITIALIZED`). Copy-on-write for shared pages is a known
//! gap: a write fault on a page with more than one reference fails with
//! `EINVAL` rather than inventing semantics the rest of the system never
//! exercises.

use storpu_abi::errors::Errno;

use crate::memory::frame_allocator::{self, ZoneSet};
use crate::memory::paging::PAGE_SIZE;

use super::page::page_refcount;
use super::region::{FaultFlags, RegionFlags, VmRegion};

pub(super) fn page_fault(region: &mut VmRegion, offset: usize, flags: FaultFlags) -> Result<(), Errno> {
    let new_phys = frame_allocator::alloc_pages(1, ZoneSet::DDR).ok_or(Errno::ENOMEM)?;

    if !region.flags().contains(RegionFlags::UNINITIALIZED) {
        unsafe {
            core::ptr::write_bytes(new_phys.into_virt().into_ptr::<u8>(), 0, PAGE_SIZE);
        }
    }

    let pr = region.pr(offset).expect("anon fault on an empty page slot");

    if pr.page.phys().is_none() {
        pr.page.set_phys(new_phys);
        return Ok(());
    }

    if page_refcount(&pr.page) < 2 || !flags.contains(FaultFlags::WRITE) {
        frame_allocator::free_mem(new_phys, PAGE_SIZE);
        return Ok(());
    }

    // Write to a shared anonymous page: the copy-on-write gap.
    frame_allocator::free_mem(new_phys, PAGE_SIZE);
    Err(Errno::EINVAL)
}
