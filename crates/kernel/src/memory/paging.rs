//! Guest page tables.
//!
//! A 39-bit, three-level, 4 KiB-granule translation tree. The descriptor
//! format is the runtime's own software layout: the walk and every
//! bookkeeping decision lives here, portable; only installing a root and
//! shooting down TLBs touch the architecture. The arch layer re-encodes
//! leaf descriptors for the hardware walker when it installs an address
//! space.

pub const PAGE_SIZE: usize = 4096;

use core::fmt::{Debug, LowerHex};
use core::ops::{Deref, DerefMut};

use bitfield_struct::bitfield;
use bitflags::bitflags;
use thiserror::Error;

use crate::arch;

use super::{
    PhysAddr, VirtAddr, align_down,
    frame_allocator::{self, Frame, FramePtr, ZoneSet},
};

/// Bits of virtual address space a context covers.
pub const VA_BITS: usize = 39;
const LEVELS: usize = 3;
const ENTRIES: usize = 512;
const INDEX_BITS: usize = 9;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Page {
    start_address: VirtAddr,
}

impl Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:#x})", self.start_address)
    }
}

impl LowerHex for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.start_address)
    }
}

impl Page {
    pub const fn containing_address(address: VirtAddr) -> Self {
        Self {
            start_address: VirtAddr::from_bits(align_down(address.into_raw(), PAGE_SIZE)),
        }
    }

    pub const fn virt_addr(&self) -> VirtAddr {
        self.start_address
    }

    /// creates an iterator'able struct
    /// requires that start.start_address is smaller than end.start_address
    pub fn iter_pages(start: Page, end: Page) -> IterPage {
        assert!(start.start_address <= end.start_address);
        IterPage { start, end }
    }

    fn index_at(&self, level: usize) -> usize {
        let shift = 12 + INDEX_BITS * (LEVELS - 1 - level);
        (self.start_address.into_raw() >> shift) & (ENTRIES - 1)
    }
}

#[derive(Debug, Clone)]
pub struct IterPage {
    start: Page,
    end: Page,
}

impl Iterator for IterPage {
    type Item = Page;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address < self.end.start_address {
            let page = self.start;
            self.start.start_address += PAGE_SIZE;
            Some(page)
        } else {
            None
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u16 {
        const WRITE = 1;
        const USER_ACCESSIBLE = 1 << 1;
        const EXEC = 1 << 2;
        const DEVICE_UNCACHEABLE = 1 << 3;
    }
}

#[bitfield(u64)]
struct Descriptor {
    valid: bool,
    /// Points at a next-level table rather than a leaf frame.
    table: bool,
    #[bits(10)]
    flags: u16,
    #[bits(36)]
    pfn: u64,
    #[bits(16)]
    __: u16,
}

impl Descriptor {
    fn leaf(phys: PhysAddr, flags: EntryFlags) -> Self {
        Self::new()
            .with_valid(true)
            .with_table(false)
            .with_flags(flags.bits())
            .with_pfn((phys.into_raw() / PAGE_SIZE) as u64)
    }

    fn next_table(phys: PhysAddr) -> Self {
        Self::new()
            .with_valid(true)
            .with_table(true)
            .with_pfn((phys.into_raw() / PAGE_SIZE) as u64)
    }

    fn phys(&self) -> PhysAddr {
        PhysAddr::from_bits(self.pfn() as usize * PAGE_SIZE)
    }

    fn entry_flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.flags())
    }
}

#[derive(Debug, Clone, Copy, Error)]
pub enum MapToError {
    #[error("frame allocator: out of memory")]
    FrameAllocationFailed,
}

impl From<MapToError> for storpu_abi::errors::Errno {
    fn from(_: MapToError) -> Self {
        storpu_abi::errors::Errno::ENOMEM
    }
}

/// One 4 KiB table of descriptors; all three levels share the layout.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Descriptor; ENTRIES],
}

impl PageTable {
    pub fn zeroize(&mut self) {
        self.entries = [Descriptor::new(); ENTRIES];
    }

    fn next_table(&self, index: usize) -> Option<FramePtr<PageTable>> {
        let entry = self.entries[index];
        if !entry.valid() || !entry.table() {
            return None;
        }
        Some(unsafe { Frame::containing_address(entry.phys()).into_ptr() })
    }

    fn next_table_create(&mut self, index: usize) -> Result<FramePtr<PageTable>, MapToError> {
        if let Some(table) = self.next_table(index) {
            return Ok(table);
        }

        let frame = frame_allocator::allocate_frame_in(ZoneSet::DDR)
            .ok_or(MapToError::FrameAllocationFailed)?;
        let mut table: FramePtr<PageTable> = unsafe { frame.into_ptr() };
        table.zeroize();

        self.entries[index] = Descriptor::next_table(frame.start_address());
        Ok(table)
    }

    fn leaf_table(&self, page: Page) -> Option<FramePtr<PageTable>> {
        let l1 = self.next_table(page.index_at(0))?;
        l1.next_table(page.index_at(1))
    }

    fn leaf_table_create(&mut self, page: Page) -> Result<FramePtr<PageTable>, MapToError> {
        let mut l1 = self.next_table_create(page.index_at(0))?;
        l1.next_table_create(page.index_at(1))
    }

    /// Installs or replaces the translation for `page`. Replacing is the
    /// normal case when a fault re-arms a mapping with new permissions.
    pub unsafe fn map_to(
        &mut self,
        page: Page,
        frame: Frame,
        flags: EntryFlags,
    ) -> Result<(), MapToError> {
        let mut leaf = self.leaf_table_create(page)?;
        leaf.entries[page.index_at(2)] = Descriptor::leaf(frame.start_address(), flags);
        arch::mmu::flush_tlb_page(page.virt_addr());
        Ok(())
    }

    /// Maps `page_num` pages starting at `start_virt_addr` to frames
    /// starting at `start_phys_addr`.
    pub unsafe fn map_contiguous_pages(
        &mut self,
        start_virt_addr: VirtAddr,
        start_phys_addr: PhysAddr,
        page_num: usize,
        flags: EntryFlags,
    ) -> Result<(), MapToError> {
        let size = page_num * PAGE_SIZE;
        let page_iter = Page::iter_pages(
            Page::containing_address(start_virt_addr),
            Page::containing_address(start_virt_addr + size),
        );
        let frame_iter = Frame::iter_frames(
            Frame::containing_address(start_phys_addr),
            Frame::containing_address(start_phys_addr + size),
        );
        for (page, frame) in page_iter.zip(frame_iter) {
            unsafe { self.map_to(page, frame, flags)? };
        }
        Ok(())
    }

    /// Removes the translation for `page`, if any.
    pub unsafe fn unmap(&mut self, page: Page) {
        if let Some(mut leaf) = self.leaf_table(page) {
            leaf.entries[page.index_at(2)] = Descriptor::new();
            arch::mmu::flush_tlb_page(page.virt_addr());
        }
    }

    /// Removes every translation inside `[start, start + len)`.
    pub unsafe fn unmap_range(&mut self, start: VirtAddr, len: usize) {
        let iter = Page::iter_pages(
            Page::containing_address(start),
            Page::containing_address((start + len).to_next_page()),
        );
        for page in iter {
            unsafe { self.unmap(page) };
        }
    }

    pub fn get_frame(&self, page: Page) -> Option<Frame> {
        let leaf = self.leaf_table(page)?;
        let entry = leaf.entries[page.index_at(2)];
        entry
            .valid()
            .then(|| Frame::containing_address(entry.phys()))
    }

    pub fn get_flags(&self, page: Page) -> Option<EntryFlags> {
        let leaf = self.leaf_table(page)?;
        let entry = leaf.entries[page.index_at(2)];
        entry.valid().then(|| entry.entry_flags())
    }

    /// Translates `virt`, preserving the offset within the page.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let page = Page::containing_address(virt);
        let frame = self.get_frame(page)?;
        Some(frame.start_address() + (virt - page.virt_addr()))
    }

    /// Longest physically-contiguous run starting at `virt`, up to `size`
    /// bytes. Returns the base physical address and the run length; `None`
    /// if `virt` itself is unmapped.
    pub fn translate_range(&self, virt: VirtAddr, size: usize) -> Option<(PhysAddr, usize)> {
        let base = self.translate(virt)?;

        let first_chunk = (PAGE_SIZE - virt.into_raw() % PAGE_SIZE).min(size);
        let mut contiguous = first_chunk;
        let mut next_virt = virt + first_chunk;
        let mut next_phys = base + first_chunk;

        while contiguous < size {
            match self.translate(next_virt) {
                Some(phys) if phys == next_phys => {
                    let chunk = PAGE_SIZE.min(size - contiguous);
                    contiguous += chunk;
                    next_virt += chunk;
                    next_phys += chunk;
                }
                _ => break,
            }
        }

        Some((base, contiguous))
    }

    fn free_tables(&mut self) {
        for l1_entry in self.entries {
            if !l1_entry.valid() || !l1_entry.table() {
                continue;
            }
            let l1: FramePtr<PageTable> =
                unsafe { Frame::containing_address(l1_entry.phys()).into_ptr() };
            for l2_entry in l1.entries {
                if l2_entry.valid() && l2_entry.table() {
                    frame_allocator::deallocate_frame(Frame::containing_address(l2_entry.phys()));
                }
            }
            frame_allocator::deallocate_frame(l1.frame());
        }
        self.zeroize();
    }
}

/// An owned translation tree rooted in a physically allocated frame.
/// Dropping it frees every table frame; leaf frames belong to the VM's
/// page bookkeeping, never to the table.
#[derive(Debug)]
pub struct PhysPageTable {
    inner: FramePtr<PageTable>,
}

impl Deref for PhysPageTable {
    type Target = PageTable;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PhysPageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl PhysPageTable {
    pub fn create() -> Result<Self, MapToError> {
        let frame =
            frame_allocator::allocate_frame_in(ZoneSet::DDR).ok_or(MapToError::FrameAllocationFailed)?;
        let mut inner: FramePtr<PageTable> = unsafe { frame.into_ptr() };
        inner.zeroize();
        Ok(Self { inner })
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.inner.phys_addr()
    }
}

impl Drop for PhysPageTable {
    fn drop(&mut self) {
        self.inner.free_tables();
        frame_allocator::deallocate_frame(self.inner.frame());
    }
}

impl Debug for PageTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PageTable { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn map_translate_unmap() {
        test_support::init();

        let mut table = PhysPageTable::create().unwrap();
        let frame = frame_allocator::allocate_frame().unwrap();
        let page = Page::containing_address(VirtAddr::from_bits(0x40_0000));

        unsafe {
            table
                .map_to(page, frame, EntryFlags::WRITE | EntryFlags::USER_ACCESSIBLE)
                .unwrap();
        }

        assert_eq!(table.get_frame(page), Some(frame));
        assert_eq!(
            table.translate(page.virt_addr() + 0x123),
            Some(frame.start_address() + 0x123)
        );
        assert!(
            table
                .get_flags(page)
                .unwrap()
                .contains(EntryFlags::WRITE | EntryFlags::USER_ACCESSIBLE)
        );

        // Re-arming with narrower permissions replaces the descriptor.
        unsafe {
            table
                .map_to(page, frame, EntryFlags::USER_ACCESSIBLE)
                .unwrap();
        }
        assert!(!table.get_flags(page).unwrap().contains(EntryFlags::WRITE));

        unsafe { table.unmap(page) };
        assert_eq!(table.get_frame(page), None);

        frame_allocator::deallocate_frame(frame);
    }

    #[test]
    fn translate_range_requires_contiguity() {
        test_support::init();

        let mut table = PhysPageTable::create().unwrap();
        let base = VirtAddr::from_bits(0x80_0000);

        // A genuine run first: both pages over one contiguous allocation.
        let run = frame_allocator::alloc_pages(2, ZoneSet::ANY).unwrap();
        unsafe {
            table
                .map_contiguous_pages(base, run, 2, EntryFlags::WRITE)
                .unwrap();
        }
        let (phys, len) = table.translate_range(base, 2 * PAGE_SIZE).unwrap();
        assert_eq!(phys, run);
        assert_eq!(len, 2 * PAGE_SIZE);

        // Now break adjacency: alias the second page to the first frame,
        // which can never sit at `run + PAGE_SIZE`.
        unsafe {
            table
                .map_to(
                    Page::containing_address(base + PAGE_SIZE),
                    Frame::containing_address(run),
                    EntryFlags::WRITE,
                )
                .unwrap();
        }

        let (phys, len) = table.translate_range(base, 2 * PAGE_SIZE).unwrap();
        assert_eq!(phys, run);
        // The second page no longer continues the run, so it stops short.
        assert_eq!(len, PAGE_SIZE);

        unsafe { table.unmap_range(base, 2 * PAGE_SIZE) };

        frame_allocator::free_mem(run, 2 * PAGE_SIZE);
    }
}
