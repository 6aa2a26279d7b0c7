//! Physical page frames as the VM tracks them.
//!
//! A [`PageFrame`] may exist before it has backing storage (`phys` not yet
//! assigned); backends fill it in on fault. The reference count is the
//! `Arc` itself: physical regions and cached pages hold clones, and the
//! last drop releases the frame to the allocator unless the page cache
//! owns the storage.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use crate::PhysAddr;
use crate::memory::frame_allocator;
use crate::memory::paging::PAGE_SIZE;
use crate::utils::locks::{SpinLock, spinlock};

use super::cache::CachedPage;

/// Sentinel for "no physical storage yet".
const PHYS_NONE: usize = usize::MAX - 1;

const PFF_INCACHE: u16 = 0x1;
const PFF_DIRTY: u16 = 0x2;

pub struct PageFrame {
    phys: AtomicUsize,
    flags: AtomicU16,
    /// Back-link to the cached page owning this frame, when in-cache.
    owner: SpinLock<Option<Weak<CachedPage>>>,
}

impl PageFrame {
    pub fn new(phys: Option<PhysAddr>) -> Arc<Self> {
        if let Some(addr) = phys {
            debug_assert!(addr.is_page_aligned());
        }

        Arc::new(Self {
            phys: AtomicUsize::new(phys.map_or(PHYS_NONE, PhysAddr::into_raw)),
            flags: AtomicU16::new(0),
            owner: spinlock(None),
        })
    }

    pub fn phys(&self) -> Option<PhysAddr> {
        let raw = self.phys.load(Ordering::Acquire);
        (raw != PHYS_NONE).then(|| PhysAddr::from_bits(raw))
    }

    /// Assigns backing storage to a frame that had none.
    pub fn set_phys(&self, phys: PhysAddr) {
        debug_assert!(self.phys().is_none());
        self.phys.store(phys.into_raw(), Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.load(Ordering::Acquire) & PFF_DIRTY != 0
    }

    pub fn set_dirty(&self) {
        self.flags.fetch_or(PFF_DIRTY, Ordering::AcqRel);
    }

    pub fn clear_dirty(&self) {
        self.flags.fetch_and(!PFF_DIRTY, Ordering::AcqRel);
    }

    pub fn in_cache(&self) -> bool {
        self.flags.load(Ordering::Acquire) & PFF_INCACHE != 0
    }

    pub(super) fn set_cache_owner(&self, owner: &Arc<CachedPage>) {
        *self.owner.lock() = Some(Arc::downgrade(owner));
        self.flags.fetch_or(PFF_INCACHE, Ordering::AcqRel);
    }

    pub fn cache_owner(&self) -> Option<Arc<CachedPage>> {
        self.owner.lock().as_ref()?.upgrade()
    }

    /// Detaches the frame from the cache so the final drop frees its
    /// storage after all.
    pub(super) fn flags_clear_incache(&self) {
        self.flags.fetch_and(!PFF_INCACHE, Ordering::AcqRel);
    }

    /// Disowns the storage entirely: the drop will not free it. Used by a
    /// losing cache inserter whose buffer still belongs to the caller.
    pub(super) fn forget_storage(&self) {
        self.phys.store(PHYS_NONE, Ordering::Release);
    }

}

/// The page reference count: how many physical regions and cached pages
/// share this frame.
#[inline]
pub fn page_refcount(page: &Arc<PageFrame>) -> usize {
    Arc::strong_count(page)
}

impl Drop for PageFrame {
    fn drop(&mut self) {
        let raw = *self.phys.get_mut();
        let flags = *self.flags.get_mut();

        // Cache-owned storage belongs to the cached page; everything else
        // goes back to the allocator frame by frame.
        if raw != PHYS_NONE && flags & PFF_INCACHE == 0 {
            frame_allocator::free_mem(PhysAddr::from_bits(raw), PAGE_SIZE);
        }
    }
}

impl core::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageFrame")
            .field("phys", &self.phys())
            .field("dirty", &self.is_dirty())
            .field("in_cache", &self.in_cache())
            .finish()
    }
}

/// A faulted-in (or pre-allocated) page slot of a region.
#[derive(Debug, Clone)]
pub struct PhysRegion {
    pub page: Arc<PageFrame>,
}
