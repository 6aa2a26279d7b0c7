//! The physical page-frame allocator.
//!
//! Three labeled zones (DMA-capable low DDR, high DDR, PL-side DDR). Each
//! seeded range tracks its frames in a bitmap (bit set = frame in use)
//! carved out of the head of the range itself, so the allocator needs no
//! heap and is ready the moment a zone is seeded. Single frames and
//! contiguous runs both come from the same bitmap scan: find a window of
//! clear bits, set it. A rotating hint keeps the scan from rediscovering
//! the same fragmented prefix on every call.

use core::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use bitflags::bitflags;

use storpu_utils::bitmap;

use crate::utils::locks::{SpinLock, spinlock};

use super::{PhysAddr, VirtAddr, align_down, paging::PAGE_SIZE};

/// A pointer to data in a physical frame, reachable through the linear
/// mapping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FramePtr<T>(*mut T);

unsafe impl<T: Send> Send for FramePtr<T> {}
unsafe impl<T: Sync> Sync for FramePtr<T> {}

impl<T> FramePtr<T> {
    pub fn phys_addr(&self) -> PhysAddr {
        VirtAddr::from_ptr(self.0).into_phys()
    }

    pub fn frame(&self) -> Frame {
        Frame(self.phys_addr())
    }

    pub const fn as_ptr(&self) -> *mut T {
        self.0
    }
}

impl<T> Deref for FramePtr<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0 }
    }
}

impl<T> DerefMut for FramePtr<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.0 }
    }
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame(PhysAddr);

impl Frame {
    #[inline(always)]
    pub fn containing_address(address: PhysAddr) -> Self {
        Self(PhysAddr::from_bits(align_down(address.into_raw(), PAGE_SIZE)))
    }

    #[inline(always)]
    pub fn start_address(&self) -> PhysAddr {
        self.0
    }

    #[inline(always)]
    pub fn phys_addr(&self) -> PhysAddr {
        self.0
    }

    #[inline(always)]
    pub fn virt_addr(&self) -> VirtAddr {
        self.0.into_virt()
    }

    pub fn iter_frames(start: Frame, end: Frame) -> FrameIter {
        debug_assert!(start.start_address() <= end.start_address());
        FrameIter { start, end }
    }

    /// Converts a frame into a pointer to data in that frame.
    /// # Safety
    /// The caller must ensure the frame holds a valid `T`.
    pub unsafe fn into_ptr<T>(self) -> FramePtr<T> {
        FramePtr(self.virt_addr().into_ptr::<T>())
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Frame")
            .field(&format_args!("{:#x}", self.start_address()))
            .finish()
    }
}

pub struct FrameIter {
    start: Frame,
    end: Frame,
}

impl Iterator for FrameIter {
    type Item = Frame;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address() < self.end.start_address() {
            let frame = self.start;
            self.start.0 += PAGE_SIZE;
            Some(frame)
        } else {
            None
        }
    }
}

/// Memory zone labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Zone {
    LowDdr = 0,
    HighDdr = 1,
    PlDdr = 2,
}

const NR_ZONES: usize = 3;

/// How many disjoint ranges one zone may be seeded with.
const MAX_ZONE_RANGES: usize = 4;

bitflags! {
    /// Which zones an allocation may come from. Order of preference when
    /// several are allowed: PL DDR, high DDR, low DDR, keeping the
    /// DMA-capable window for callers that need it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ZoneSet: u32 {
        const LOW_DDR = 1 << Zone::LowDdr as u32;
        const HIGH_DDR = 1 << Zone::HighDdr as u32;
        const PL_DDR = 1 << Zone::PlDdr as u32;
    }
}

impl ZoneSet {
    pub const DDR: ZoneSet = ZoneSet::LOW_DDR.union(ZoneSet::HIGH_DDR);
    pub const ANY: ZoneSet = ZoneSet::all();

    fn preference() -> [Zone; NR_ZONES] {
        [Zone::PlDdr, Zone::HighDdr, Zone::LowDdr]
    }
}

/// One seeded physical range. Frame `i` lives at `base + i * PAGE_SIZE`;
/// its bitmap bit is set while the frame is handed out. The bitmap words
/// occupy the pages in front of `base` and are never allocatable.
struct ZoneRange {
    base: PhysAddr,
    frames: usize,
    words: usize,
    map: *mut usize,
    /// Frame index the next scan starts from.
    hint: usize,
    used: usize,
}

impl ZoneRange {
    /// Lays a range's bitmap into its own head pages.
    ///
    /// # Safety
    /// `[start, end)` must be unused RAM covered by the linear mapping.
    unsafe fn carve(start: PhysAddr, end: PhysAddr) -> Option<Self> {
        let total_frames = (end - start) / PAGE_SIZE;

        // The bitmap steals whole pages from the front; sizing it for the
        // full range over-reserves by at most one word.
        let words = bitmap::words_for(total_frames);
        let map_pages = (words * core::mem::size_of::<usize>()).div_ceil(PAGE_SIZE);
        let frames = total_frames.checked_sub(map_pages).filter(|n| *n > 0)?;

        let map = start.into_virt().into_ptr::<usize>();
        unsafe {
            core::ptr::write_bytes(map, 0, bitmap::words_for(frames));
        }

        Some(Self {
            base: start + map_pages * PAGE_SIZE,
            frames,
            words: bitmap::words_for(frames),
            map,
            hint: 0,
            used: 0,
        })
    }

    fn bitmap(&self) -> &'static mut [usize] {
        unsafe { core::slice::from_raw_parts_mut(self.map, self.words) }
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr < self.base + self.frames * PAGE_SIZE
    }

    /// Claims `count` consecutive clear bits at or after frame `from`.
    fn claim_from(&mut self, from: usize, count: usize) -> Option<PhysAddr> {
        let map = self.bitmap();
        let mut idx = from;

        while idx + count <= self.frames {
            // The window is free iff no set bit exists inside it.
            let blocked = bitmap::find_next_bit(map, idx + count, idx);
            if blocked == idx + count {
                for bit in idx..idx + count {
                    bitmap::set_bit(map, bit);
                }
                self.used += count;
                self.hint = idx + count;
                return Some(self.base + idx * PAGE_SIZE);
            }

            // Resume just past the obstruction.
            idx = blocked + 1;
        }

        None
    }

    fn alloc_run(&mut self, count: usize) -> Option<PhysAddr> {
        debug_assert!(count > 0);

        let hint = self.hint;
        self.claim_from(hint, count)
            .or_else(|| self.claim_from(0, count))
    }

    fn free_run(&mut self, addr: PhysAddr, count: usize) {
        debug_assert!(self.contains(addr));

        let map = self.bitmap();
        let idx = (addr - self.base) / PAGE_SIZE;

        for bit in idx..idx + count {
            debug_assert!(bitmap::test_bit(map, bit), "double free of frame {bit}");
            bitmap::clear_bit(map, bit);
        }

        self.used -= count;
        self.hint = self.hint.min(idx);
    }
}

/// A zone: its seeded ranges, tried in seed order.
struct ZoneAllocator {
    ranges: heapless::Vec<ZoneRange, MAX_ZONE_RANGES>,
}

unsafe impl Send for ZoneAllocator {}

impl ZoneAllocator {
    const fn new() -> Self {
        Self {
            ranges: heapless::Vec::new(),
        }
    }

    fn alloc_run(&mut self, count: usize) -> Option<PhysAddr> {
        self.ranges.iter_mut().find_map(|range| range.alloc_run(count))
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(addr))
    }

    fn free_run(&mut self, addr: PhysAddr, count: usize) {
        let range = self
            .ranges
            .iter_mut()
            .find(|range| range.contains(addr))
            .expect("freeing a frame outside the zone");
        range.free_run(addr, count);
    }

    fn used_frames(&self) -> usize {
        self.ranges.iter().map(|range| range.used).sum()
    }
}

static ZONES: [SpinLock<ZoneAllocator>; NR_ZONES] = [
    spinlock(ZoneAllocator::new()),
    spinlock(ZoneAllocator::new()),
    spinlock(ZoneAllocator::new()),
];

static PHYS_LO: AtomicUsize = AtomicUsize::new(usize::MAX);
static PHYS_HI: AtomicUsize = AtomicUsize::new(0);

/// Hands `[start, end)` of physical memory to `zone`.
///
/// # Safety
/// The range must be unused RAM covered by the linear mapping.
pub unsafe fn seed_zone(zone: Zone, start: PhysAddr, end: PhysAddr) {
    let start = PhysAddr::from_bits(crate::memory::align_up(start.into_raw(), PAGE_SIZE));
    let end = PhysAddr::from_bits(align_down(end.into_raw(), PAGE_SIZE));

    let Some(range) = (unsafe { ZoneRange::carve(start, end) }) else {
        return;
    };

    ZONES[zone as usize]
        .lock()
        .ranges
        .push(range)
        .ok()
        .expect("too many ranges seeded into one zone");

    PHYS_LO.fetch_min(start.into_raw(), Ordering::AcqRel);
    PHYS_HI.fetch_max(end.into_raw(), Ordering::AcqRel);
}

/// The [lowest, highest) physical addresses ever seeded, if any.
pub fn phys_window() -> Option<(PhysAddr, PhysAddr)> {
    let lo = PHYS_LO.load(Ordering::Acquire);
    let hi = PHYS_HI.load(Ordering::Acquire);
    (lo < hi).then(|| (PhysAddr::from_bits(lo), PhysAddr::from_bits(hi)))
}

fn zones_of(set: ZoneSet) -> impl Iterator<Item = &'static SpinLock<ZoneAllocator>> {
    ZoneSet::preference()
        .into_iter()
        .filter(move |z| set.contains(ZoneSet::from_bits_truncate(1 << *z as u32)))
        .map(|z| &ZONES[z as usize])
}

#[inline]
pub fn allocate_frame_in(set: ZoneSet) -> Option<Frame> {
    alloc_pages(1, set).map(|phys| Frame::containing_address(phys))
}

#[inline]
pub fn allocate_frame() -> Option<Frame> {
    allocate_frame_in(ZoneSet::ANY)
}

/// `n` physically contiguous frames from any allowed zone; returns the base
/// address. This is the allocation the contiguous regions and the
/// huge-page cache lines depend on.
pub fn alloc_pages(n: usize, set: ZoneSet) -> Option<PhysAddr> {
    zones_of(set).find_map(|zone| zone.lock().alloc_run(n))
}

/// Releases a previously allocated run. `len` must match the allocation.
pub fn free_mem(phys: PhysAddr, len: usize) {
    debug_assert!(phys.is_page_aligned());
    debug_assert!(len % PAGE_SIZE == 0);

    let zone = ZONES
        .iter()
        .find(|zone| zone.lock().contains(phys))
        .expect("free_mem: address outside every zone");

    zone.lock().free_run(phys, len / PAGE_SIZE);
}

#[inline]
pub fn deallocate_frame(frame: Frame) {
    free_mem(frame.start_address(), PAGE_SIZE);
}

/// `n` pages as a kernel-virtual pointer through the linear mapping.
pub fn alloc_vmpages(n: usize, set: ZoneSet) -> Option<VirtAddr> {
    alloc_pages(n, set).map(|phys| phys.into_virt())
}

/// Total frames currently handed out across every zone.
pub fn mapped_frames() -> usize {
    ZONES.iter().map(|zone| zone.lock().used_frames()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn allocated_frames_are_distinct() {
        test_support::init();

        let mut frames = heapless::Vec::<_, 512>::new();
        for _ in 0..frames.capacity() {
            frames.push(allocate_frame().unwrap()).unwrap();
        }

        for i in 1..frames.len() {
            for j in 0..i {
                assert_ne!(frames[i].start_address(), frames[j].start_address());
            }
        }

        for frame in frames.iter() {
            deallocate_frame(*frame);
        }
    }

    #[test]
    fn contiguous_run_is_usable_as_one_span() {
        test_support::init();

        let base = alloc_pages(8, ZoneSet::ANY).expect("failed to allocate a contiguous run");
        assert!(base.is_page_aligned());

        // The run must be addressable as one span through the linear map.
        unsafe {
            core::ptr::write_bytes(base.into_virt().into_ptr::<u8>(), 0xA5, 8 * PAGE_SIZE);
        }

        free_mem(base, 8 * PAGE_SIZE);
    }

    #[test]
    fn range_scan_accounting_and_hint_rewind() {
        test_support::init();

        // A private range over borrowed backing keeps the bookkeeping
        // observable without racing the global zones.
        let backing = alloc_pages(64, ZoneSet::ANY).unwrap();
        let mut range =
            unsafe { ZoneRange::carve(backing, backing + 64 * PAGE_SIZE) }.expect("range too small");

        // One page went to the range's own bitmap.
        assert_eq!(range.frames, 63);

        let first = range.alloc_run(8).unwrap();
        let second = range.alloc_run(8).unwrap();
        assert_eq!(second, first + 8 * PAGE_SIZE);
        assert_eq!(range.used, 16);

        // A run too large for what is left must fail cleanly.
        assert!(range.alloc_run(64).is_none());

        // Freeing rewinds the scan hint, so the hole is the next thing a
        // same-sized request finds.
        range.free_run(first, 8);
        let third = range.alloc_run(8).unwrap();
        assert_eq!(third, first);
        assert_eq!(range.used, 16);

        range.free_run(second, 8);
        range.free_run(third, 8);
        assert_eq!(range.used, 0);

        free_mem(backing, 64 * PAGE_SIZE);
    }

    #[test]
    fn zone_selection_respects_mask() {
        test_support::init();

        // The test arena seeds HighDdr and PlDdr only.
        assert!(allocate_frame_in(ZoneSet::LOW_DDR).is_none());

        let frame = allocate_frame_in(ZoneSet::PL_DDR).unwrap();
        deallocate_frame(frame);
    }
}
