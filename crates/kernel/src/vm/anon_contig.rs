//! The contiguous anonymous backend.
//!
//! The whole physically contiguous run is allocated, zeroed and slotted in
//! when the region is created; mapping still happens lazily on fault. A
//! fault that reaches the backend after creation means a slot lost its
//! storage, which cannot happen short of a kernel bug.

use storpu_abi::errors::Errno;

use crate::memory::frame_allocator::{self, ZoneSet};
use crate::memory::paging::PAGE_SIZE;

use super::page::{PageFrame, PhysRegion};
use super::region::{FaultFlags, VmRegion};

/// The creation hook: builds every page slot over one contiguous run.
pub(super) fn preallocate(region: &mut VmRegion, vm_total: &mut usize) -> Result<(), Errno> {
    let pages = region.len() / PAGE_SIZE;
    debug_assert!(pages > 0);

    let Some(base) = frame_allocator::alloc_pages(pages, ZoneSet::DDR) else {
        return Err(Errno::ENOMEM);
    };

    unsafe {
        core::ptr::write_bytes(base.into_virt().into_ptr::<u8>(), 0, pages * PAGE_SIZE);
    }

    for i in 0..pages {
        let offset = i * PAGE_SIZE;
        region.set_pr(
            offset,
            PhysRegion {
                page: PageFrame::new(Some(base + offset)),
            },
            vm_total,
        );
    }

    Ok(())
}

pub(super) fn page_fault(_region: &mut VmRegion, offset: usize, _flags: FaultFlags) -> Result<(), Errno> {
    panic!("page fault at offset {offset:#x} in a contiguous anonymous mapping");
}
