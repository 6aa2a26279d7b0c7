//! The unified page cache.
//!
//! One ordered tree per flash namespace plus one for host memory, keyed by
//! aligned file offset. Entries are single-frame (host memory, 4 KiB) or
//! huge (flash, 16 KiB = 4 frames); each carries a content lock held
//! across fill and write-back I/O. Inserts are atomic with respect to
//! concurrent lookups by failing with `EEXIST` and letting the caller
//! retry the lookup. Nothing is ever evicted; write-back on sync is the
//! only way dirty data leaves.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use lazy_static::lazy_static;

use storpu_abi::errors::Errno;
use storpu_abi::file::FD_HOST_MEM;

use crate::config::{FILE_MAX, FLASH_PG_SIZE};
use crate::memory::paging::PAGE_SIZE;
use crate::thread;
use crate::utils::locks::{Mutex, SpinLock, mutex, spinlock};
use crate::{PhysAddr, fs};

use super::page::PageFrame;

pub const HP_NR_PAGES: usize = FLASH_PG_SIZE / PAGE_SIZE;

/// A cached copy of one cache line of a backing file.
pub struct CachedPage {
    fd: i32,
    offset: u64,
    huge: bool,
    dirty: SpinLock<bool>,
    /// Content lock: held across fill and write-back I/O.
    lock: Mutex<()>,
    frames: [Option<Arc<PageFrame>>; HP_NR_PAGES],
}

impl CachedPage {
    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_huge(&self) -> bool {
        self.huge
    }

    /// Number of frames this entry spans.
    pub fn nr_pages(&self) -> usize {
        if self.huge { HP_NR_PAGES } else { 1 }
    }

    pub fn size(&self) -> usize {
        self.nr_pages() * PAGE_SIZE
    }

    pub fn is_dirty(&self) -> bool {
        *self.dirty.lock()
    }

    pub fn mark_dirty(&self) {
        *self.dirty.lock() = true;
    }

    fn clear_dirty(&self) {
        *self.dirty.lock() = false;
        for frame in self.frames.iter().flatten() {
            frame.clear_dirty();
        }
    }

    /// Locks the entry's contents; dropping the guard unlocks.
    pub fn lock(&self) -> crate::utils::locks::MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// The frame backing `fd_offset`, which must fall inside this entry.
    pub fn subpage(&self, fd_offset: u64) -> Arc<PageFrame> {
        let index = (fd_offset - self.offset) as usize / PAGE_SIZE;
        self.frames[index]
            .clone()
            .expect("cached page missing a frame")
    }

    fn base_phys(&self) -> PhysAddr {
        self.frames[0]
            .as_ref()
            .and_then(|f| f.phys())
            .expect("cached page without storage")
    }
}

impl Drop for CachedPage {
    fn drop(&mut self) {
        // Hand storage ownership back to the last frame reference.
        for frame in self.frames.iter().flatten() {
            frame.flags_clear_incache();
        }
    }
}

impl core::fmt::Debug for CachedPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CachedPage")
            .field("fd", &self.fd)
            .field("offset", &self.offset)
            .field("huge", &self.huge)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

struct AddressSpaceCache {
    pages: SpinLock<BTreeMap<u64, Arc<CachedPage>>>,
}

impl AddressSpaceCache {
    fn new() -> Self {
        Self {
            pages: spinlock(BTreeMap::new()),
        }
    }
}

lazy_static! {
    static ref FILE_CACHES: [AddressSpaceCache; FILE_MAX] =
        core::array::from_fn(|_| AddressSpaceCache::new());
    static ref HOST_MEM_CACHE: AddressSpaceCache = AddressSpaceCache::new();
}

fn cache_by_fd(fd: i32) -> Option<&'static AddressSpaceCache> {
    if fd == FD_HOST_MEM {
        return Some(&HOST_MEM_CACHE);
    }
    if fd < 0 || fd as usize >= FILE_MAX {
        return None;
    }
    Some(&FILE_CACHES[fd as usize])
}

/// The cache-line size of `fd`: flash namespaces cache whole flash pages,
/// host memory single frames.
pub fn line_size(fd: i32) -> usize {
    if fd == FD_HOST_MEM { PAGE_SIZE } else { FLASH_PG_SIZE }
}

/// Looks `(fd, offset)` up. Callers that touch the contents take the
/// entry's [`CachedPage::lock`] next.
pub fn find_cached_page(fd: i32, offset: u64) -> Option<Arc<CachedPage>> {
    let cache = cache_by_fd(fd)?;
    cache.pages.lock().get(&offset).cloned()
}

/// Builds a cache entry owning the frames at `phys` and inserts it.
/// On collision the argument frames are left untouched and `EEXIST` comes
/// back so the caller can free them and retry the lookup.
pub fn page_cache_add(
    fd: i32,
    offset: u64,
    phys: PhysAddr,
    huge: bool,
) -> Result<Arc<CachedPage>, Errno> {
    let cache = cache_by_fd(fd).ok_or(Errno::EINVAL)?;

    let nr_pages = if huge { HP_NR_PAGES } else { 1 };
    let mut frames: [Option<Arc<PageFrame>>; HP_NR_PAGES] = Default::default();
    for (i, slot) in frames.iter_mut().enumerate().take(nr_pages) {
        *slot = Some(PageFrame::new(Some(phys + i * PAGE_SIZE)));
    }

    let page = Arc::new(CachedPage {
        fd,
        offset,
        huge,
        dirty: spinlock(false),
        lock: mutex(()),
        frames,
    });

    for frame in page.frames.iter().flatten() {
        frame.set_cache_owner(&page);
    }

    let mut pages = cache.pages.lock();
    if pages.contains_key(&offset) {
        // Losing inserter: disown the frames again so dropping `page`
        // does not free the caller's buffer.
        drop(pages);
        for frame in page.frames.iter().flatten() {
            frame.forget_storage();
        }
        return Err(Errno::EEXIST);
    }
    pages.insert(offset, page.clone());
    drop(pages);

    Ok(page)
}

/// Write-back: walks dirty entries of `[start, end)` in offset order,
/// pushing each through `spu_write` with the entry locked, clearing dirty
/// flags on success. Yields the cpu between batches. A write error aborts
/// the scan.
pub fn page_cache_sync_range(fd: i32, start: u64, end: u64) -> Result<(), Errno> {
    let cache = cache_by_fd(fd).ok_or(Errno::EINVAL)?;

    let mut cursor = start;
    while cursor < end {
        // Batch of dirty entries starting at the cursor; the cursor then
        // advances past the last one by its own size, so huge pages are
        // not revisited.
        let batch: heapless::Vec<Arc<CachedPage>, 16> = {
            let pages = cache.pages.lock();
            let mut batch = heapless::Vec::new();
            for (_, page) in pages.range(cursor..end) {
                if !page.is_dirty() {
                    continue;
                }
                if batch.push(page.clone()).is_err() {
                    break;
                }
            }
            batch
        };

        if batch.is_empty() {
            break;
        }

        for page in &batch {
            let _content = page.lock();

            // Re-check under the lock: someone may have cleaned it.
            if !page.is_dirty() || page.offset < start || page.offset >= end {
                continue;
            }

            let buf = page.base_phys().into_virt();
            let written = fs::spu_write(fd, buf, page.size(), page.offset)?;
            if written != page.size() {
                return Err(Errno::EFAULT);
            }

            page.clear_dirty();
        }

        cursor = batch
            .last()
            .map(|page| page.offset + page.size() as u64)
            .unwrap_or(end);

        thread::current::yield_now();
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn cached_page_count(fd: i32) -> usize {
    cache_by_fd(fd).map_or(0, |c| c.pages.lock().len())
}
