//! The file backend: regions windowing a flash namespace or host memory
//! through the page cache.
//!
//! A miss allocates a cache line (a whole flash page for flash fds, one
//! frame for host memory), fills it with `spu_read` while the faulting
//! thread blocks on the FTL, and publishes it; an `EEXIST` from the
//! publish means someone else won the race and the lookup is retried.
//! Dirty tracking is write-fault driven: shared writable pages are mapped
//! read-only until the first store, which marks frame and cache entry
//! dirty and re-maps writable.

use storpu_abi::errors::Errno;

use crate::memory::frame_allocator::{self, ZoneSet};
use crate::memory::paging::PAGE_SIZE;
use crate::memory::align_down;
use crate::{fs, vm::cache};

use super::page::PageFrame;
use super::region::{FaultFlags, RegionBackend, RegionFlags, VmRegion};

fn fault_dirty_shared_page(page: &PageFrame) {
    page.set_dirty();

    if page.in_cache()
        && let Some(owner) = page.cache_owner()
    {
        owner.mark_dirty();
    }
}

pub(super) fn page_fault(region: &mut VmRegion, offset: usize, flags: FaultFlags) -> Result<(), Errno> {
    let RegionBackend::File {
        fd,
        offset: file_base,
    } = *region.backend()
    else {
        unreachable!("file fault on a non-file region");
    };

    let shared_write =
        flags.contains(FaultFlags::WRITE) && region.flags().contains(RegionFlags::MAP_SHARED);

    {
        let pr = region.pr(offset).expect("file fault on an empty page slot");

        if pr.page.phys().is_some() {
            // Present page: only a dirtying store has work left to do.
            if shared_write {
                fault_dirty_shared_page(&pr.page);
                return Ok(());
            }
            // The private copy-on-write path shares the anonymous gap.
            return Err(Errno::EINVAL);
        }
    }

    let fd_offset = file_base + offset as u64;
    let line = cache::line_size(fd);
    let line_offset = align_down(fd_offset as usize, line) as u64;

    let cached = loop {
        if let Some(page) = cache::find_cached_page(fd, line_offset) {
            break page;
        }

        // Miss: the faulting thread must block on the FTL read.
        if !flags.contains(FaultFlags::INTERRUPTIBLE) {
            return Err(Errno::EFAULT);
        }

        let buf_phys =
            frame_allocator::alloc_pages(line / PAGE_SIZE, ZoneSet::DDR).ok_or(Errno::ENOMEM)?;

        let filled = fs::spu_read(fd, buf_phys.into_virt(), line, line_offset);
        match filled {
            Ok(n) if n == line => {}
            _ => {
                frame_allocator::free_mem(buf_phys, line);
                return Err(Errno::EFAULT);
            }
        }

        match cache::page_cache_add(fd, line_offset, buf_phys, line > PAGE_SIZE) {
            Ok(page) => break page,
            Err(Errno::EEXIST) => {
                frame_allocator::free_mem(buf_phys, line);
                continue;
            }
            Err(err) => {
                frame_allocator::free_mem(buf_phys, line);
                return Err(err);
            }
        }
    };

    // Swap the placeholder for the cached frame under the entry's lock.
    let _content = cached.lock();
    region.relink_pr(offset, cached.subpage(fd_offset));
    drop(_content);

    if shared_write {
        let pr = region.pr(offset).expect("page slot vanished during fault");
        fault_dirty_shared_page(&pr.page);
    }

    Ok(())
}

/// `msync` support: pushes the region's dirty cache lines in
/// `[start, end)` (region offsets) back through the FTL.
pub(super) fn sync_range(region: &VmRegion, start: usize, end: usize) -> Result<(), Errno> {
    let RegionBackend::File {
        fd,
        offset: file_base,
    } = *region.backend()
    else {
        unreachable!("sync on a non-file region");
    };
    debug_assert!(start <= end);

    cache::page_cache_sync_range(fd, file_base + start as u64, file_base + end as u64)
}
