//! Virtual regions and the fault engine.
//!
//! A context's address space is an ordered map of non-overlapping regions,
//! each with a dense table of faulted-in page slots and a backend policy
//! (anonymous, anonymous-contiguous, file-backed) deciding how faults,
//! splits and shrinks behave.
//!
//! Accounting invariant: `vm_total` equals the summed size of every
//! occupied page slot; every slot insertion or removal goes through
//! [`VmRegion::set_pr`] / [`VmRegion::clear_pr`] with the owning address
//! space's counter. A region must be drained with [`VmRegion::release_prs`]
//! before it is dropped.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use storpu_abi::errors::Errno;

use crate::config::{VM_USER_START, VM_USER_TOP};
use crate::memory::frame_allocator::Frame;
use crate::memory::paging::{EntryFlags, PAGE_SIZE, Page};
use crate::memory::{align_down, align_up};
use crate::VirtAddr;
use crate::debug::Vm;

use super::page::{PageFrame, PhysRegion, page_refcount};
use super::{AddressSpace, VmContext, anon, anon_contig, file};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const EXEC = 0x0004;
        /// Anonymous frames are handed out without zeroing.
        const UNINITIALIZED = 0x0010;
        const MAP_SHARED = 0x0020;
        const ANON = 0x0100;
        /// Device memory: mapped uncacheable.
        const IO = 0x0400;
    }
}

impl RegionFlags {
    pub fn from_prot(prot: u32) -> Self {
        let mut flags = RegionFlags::empty();
        if prot & storpu_abi::vm::PROT_READ != 0 {
            flags |= RegionFlags::READ;
        }
        if prot & storpu_abi::vm::PROT_WRITE != 0 {
            flags |= RegionFlags::WRITE;
        }
        if prot & storpu_abi::vm::PROT_EXEC != 0 {
            flags |= RegionFlags::EXEC;
        }
        flags
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        const WRITE = 1 << 0;
        const USER = 1 << 1;
        const INSTRUCTION = 1 << 2;
        /// The faulting thread may block on backing-store I/O.
        const INTERRUPTIBLE = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapRegionFlags: u32 {
        /// Fault the whole range in at map time.
        const PREALLOC = 1 << 0;
    }
}

/// Backend policy of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionBackend {
    Anon,
    AnonContig,
    File { fd: i32, offset: u64 },
}

pub struct VmRegion {
    start: VirtAddr,
    length: usize,
    pub(super) flags: RegionFlags,
    pub(super) backend: RegionBackend,
    prs: Vec<Option<PhysRegion>>,
}

#[inline(always)]
fn slot_of(offset: usize) -> usize {
    debug_assert!(offset % PAGE_SIZE == 0);
    offset / PAGE_SIZE
}

impl VmRegion {
    pub(super) fn new(start: VirtAddr, length: usize, flags: RegionFlags, backend: RegionBackend) -> Self {
        debug_assert!(start.is_page_aligned());
        debug_assert!(length % PAGE_SIZE == 0 && length > 0);

        Self {
            start,
            length,
            flags,
            backend,
            prs: vec![None; length / PAGE_SIZE],
        }
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn end(&self) -> VirtAddr {
        self.start + self.length
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn backend(&self) -> &RegionBackend {
        &self.backend
    }

    pub(super) fn pr(&self, offset: usize) -> Option<&PhysRegion> {
        self.prs[slot_of(offset)].as_ref()
    }

    pub(super) fn set_pr(&mut self, offset: usize, pr: PhysRegion, vm_total: &mut usize) {
        let slot = slot_of(offset);
        debug_assert!(self.prs[slot].is_none());
        self.prs[slot] = Some(pr);
        *vm_total += PAGE_SIZE;
    }

    pub(super) fn clear_pr(&mut self, offset: usize, vm_total: &mut usize) -> Option<PhysRegion> {
        let pr = self.prs[slot_of(offset)].take()?;
        *vm_total -= PAGE_SIZE;
        Some(pr)
    }

    /// Swaps the page behind an occupied slot without touching accounting.
    pub(super) fn relink_pr(&mut self, offset: usize, page: alloc::sync::Arc<PageFrame>) {
        let slot = self.prs[slot_of(offset)]
            .as_mut()
            .expect("relinking an empty page slot");
        slot.page = page;
    }

    /// Drains every occupied slot, fixing the accounting. Must run before
    /// the region is dropped or truncated.
    pub(super) fn release_prs(&mut self, vm_total: &mut usize) {
        for slot in self.prs.iter_mut() {
            if slot.take().is_some() {
                *vm_total -= PAGE_SIZE;
            }
        }
    }

    fn release_pr_range(&mut self, offset: usize, len: usize, vm_total: &mut usize) {
        let mut off = offset;
        while off < offset + len {
            self.clear_pr(off, vm_total);
            off += PAGE_SIZE;
        }
    }

    /// Whether the page behind `pr` may be mapped writable right now.
    pub(super) fn pr_writable(&self, pr: &PhysRegion) -> bool {
        if !self.flags.contains(RegionFlags::WRITE) {
            return false;
        }

        match self.backend {
            RegionBackend::Anon | RegionBackend::AnonContig => {
                pr.page.phys().is_some() && page_refcount(&pr.page) == 1
            }
            RegionBackend::File { .. } => {
                self.flags.contains(RegionFlags::MAP_SHARED) && pr.page.is_dirty()
            }
        }
    }

    fn pt_prot(&self, pr: &PhysRegion) -> EntryFlags {
        let mut prot = EntryFlags::USER_ACCESSIBLE;
        if self.pr_writable(pr) {
            prot |= EntryFlags::WRITE;
        }
        if self.flags.contains(RegionFlags::EXEC) {
            prot |= EntryFlags::EXEC;
        }
        if self.flags.contains(RegionFlags::IO) {
            prot |= EntryFlags::DEVICE_UNCACHEABLE;
        }
        prot
    }

    /// Grows an anonymous region in place (brk).
    fn resize_to(&mut self, new_length: usize) {
        debug_assert!(matches!(self.backend, RegionBackend::Anon));
        debug_assert!(new_length % PAGE_SIZE == 0);
        if new_length <= self.length {
            return;
        }
        self.prs.resize(new_length / PAGE_SIZE, None);
        self.length = new_length;
    }
}

impl core::fmt::Debug for VmRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmRegion")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("flags", &self.flags)
            .field("backend", &self.backend)
            .finish()
    }
}

/// Downward first-fit placement with one-page guards on each side,
/// falling back to exact bounds when no guarded gap fits.
fn find_free_region(mm: &AddressSpace, minv: usize, maxv: usize, len: usize) -> Option<usize> {
    let maxv = if maxv == 0 { minv.checked_add(len)? } else { maxv };
    if minv.checked_add(len)? > maxv {
        return None;
    }

    let try_range = |gap_start: usize, gap_end: usize| -> Option<usize> {
        let attempts = [
            (gap_start + PAGE_SIZE, gap_end.saturating_sub(PAGE_SIZE)),
            (gap_start, gap_end),
        ];
        for (s, e) in attempts {
            let rstart = s.max(minv);
            let rend = e.min(maxv);
            if rend > rstart && rend - rstart >= len {
                return Some(rend - len);
            }
        }
        None
    };

    // Walk the gaps from the top of user space downward.
    let mut upper_bound = VM_USER_TOP;
    for (_, region) in mm.regions.iter().rev() {
        if let Some(addr) = try_range(region.end().into_raw(), upper_bound) {
            return Some(addr);
        }
        upper_bound = region.start().into_raw();
    }

    try_range(VM_USER_START, upper_bound)
}

/// Looks up the region containing `addr`; returns its map key.
pub(super) fn lookup(mm: &AddressSpace, addr: usize) -> Option<usize> {
    let (key, region) = mm.regions.range(..=addr).next_back()?;
    (addr < region.end().into_raw()).then_some(*key)
}

/// Creates and installs a region. `maxv == 0` means "exactly at `minv`".
pub(super) fn region_map(
    ctx: &VmContext,
    mm: &mut AddressSpace,
    minv: usize,
    maxv: usize,
    length: usize,
    flags: RegionFlags,
    map_flags: MapRegionFlags,
    backend: RegionBackend,
) -> Result<usize, Errno> {
    let startv = find_free_region(mm, minv, maxv, length).ok_or(Errno::ENOMEM)?;

    let mut region = VmRegion::new(VirtAddr::from_bits(startv), length, flags, backend);

    if matches!(region.backend, RegionBackend::AnonContig) {
        anon_contig::preallocate(&mut region, &mut mm.vm_total)?;
    }

    if map_flags.contains(MapRegionFlags::PREALLOC) {
        // Populate with the strongest fault the protection allows, so a
        // writable mapping comes up writable-mapped.
        let fault = if flags.contains(RegionFlags::WRITE) {
            FaultFlags::WRITE
        } else {
            FaultFlags::empty()
        };

        if let Err(err) = handle_memory(ctx, &mut region, &mut mm.vm_total, 0, length, fault) {
            region.release_prs(&mut mm.vm_total);
            return Err(err);
        }
    }

    region.flags.remove(RegionFlags::UNINITIALIZED);

    mm.regions.insert(startv, region);
    Ok(startv)
}

/// Splits `region` into `[0, len)` and `[len, length)`, re-referencing
/// each present page into the half that inherits it.
fn split_region(
    region: &mut VmRegion,
    len: usize,
    vm_total: &mut usize,
) -> Result<(VmRegion, VmRegion), Errno> {
    debug_assert!(len % PAGE_SIZE == 0);
    debug_assert!(len > 0 && len < region.length);

    let rem_len = region.length - len;

    let (first_backend, second_backend) = match &region.backend {
        // A contiguous region's frames are one allocation; it never splits.
        RegionBackend::AnonContig => return Err(Errno::EINVAL),
        RegionBackend::Anon => (RegionBackend::Anon, RegionBackend::Anon),
        RegionBackend::File { fd, offset } => (
            RegionBackend::File {
                fd: *fd,
                offset: *offset,
            },
            RegionBackend::File {
                fd: *fd,
                offset: *offset + len as u64,
            },
        ),
    };

    let mut first = VmRegion::new(region.start, len, region.flags, first_backend);
    let mut second = VmRegion::new(region.start + len, rem_len, region.flags, second_backend);

    let mut off = 0;
    while off < len {
        if let Some(pr) = region.pr(off) {
            first.set_pr(off, pr.clone(), vm_total);
        }
        off += PAGE_SIZE;
    }

    let mut off = 0;
    while off < rem_len {
        if let Some(pr) = region.pr(len + off) {
            second.set_pr(off, pr.clone(), vm_total);
        }
        off += PAGE_SIZE;
    }

    region.release_prs(vm_total);

    Ok((first, second))
}

/// Removes the translations and page slots of `[offset, offset + len)`
/// within one region, shrinking or destroying the region as needed. The
/// range is known not to straddle the region's interior (callers split
/// first).
fn region_unmap(
    ctx: &VmContext,
    mm: &mut AddressSpace,
    key: usize,
    offset: usize,
    len: usize,
) -> Result<(), Errno> {
    let AddressSpace {
        regions, vm_total, ..
    } = mm;

    enum After {
        Remove,
        ShrinkLow,
        Nothing,
    }

    let unmap_start;
    let after;
    {
        let region = regions.get_mut(&key).expect("unmapping a vanished region");
        debug_assert!(offset + len <= region.length);
        debug_assert!(len % PAGE_SIZE == 0);

        region.release_pr_range(offset, len, vm_total);

        unmap_start = region.start + offset;

        if len == region.length {
            after = After::Remove;
        } else if offset == 0 {
            match &mut region.backend {
                RegionBackend::AnonContig => return Err(Errno::EINVAL),
                RegionBackend::File { offset: foff, .. } => *foff += len as u64,
                RegionBackend::Anon => {}
            }
            after = After::ShrinkLow;
        } else if offset + len == region.length {
            region.prs.truncate(slot_of(offset));
            region.length -= len;
            after = After::Nothing;
        } else {
            unreachable!("interior unmap without a prior split");
        }
    }

    match after {
        After::Remove => {
            regions.remove(&key);
        }
        After::ShrinkLow => {
            let mut region = regions.remove(&key).unwrap();
            region.prs.drain(..slot_of(len));
            region.start += len;
            region.length -= len;
            regions.insert(region.start.into_raw(), region);
        }
        After::Nothing => {}
    }

    let mut pgd = ctx.pgd.lock();
    unsafe { pgd.unmap_range(unmap_start, len) };

    Ok(())
}

/// Unmaps `[start, start + len)` across region boundaries, splitting the
/// regions that straddle an edge.
pub(super) fn region_unmap_range(
    ctx: &VmContext,
    mm: &mut AddressSpace,
    start: usize,
    len: usize,
) -> Result<(), Errno> {
    let page_off = start % PAGE_SIZE;
    let start = start - page_off;
    let len = align_up(len + page_off, PAGE_SIZE);
    let limit = start + len;

    // The region containing `start`, plus everything starting inside the
    // window.
    // The container of `start` has a key <= start; everything else in the
    // window starts strictly above it, so the two sets are disjoint.
    let mut keys: Vec<usize> = Vec::new();
    if let Some(key) = lookup(mm, start) {
        keys.push(key);
    }
    for (key, _) in mm.regions.range(start + 1..limit) {
        keys.push(*key);
    }

    for key in keys {
        let (region_start, region_end) = {
            let Some(region) = mm.regions.get(&key) else {
                continue;
            };
            (region.start().into_raw(), region.end().into_raw())
        };

        let cur_start = start.max(region_start);
        let cur_limit = limit.min(region_end);
        if cur_start >= cur_limit {
            continue;
        }

        let mut key = key;
        if cur_start > region_start && cur_limit < region_end {
            // The window ends inside this region: split at its end, then
            // trim the tail of the first half.
            let split_len = cur_limit - region_start;

            let mut region = mm.regions.remove(&key).unwrap();
            let (first, second) = match split_region(&mut region, split_len, &mut mm.vm_total) {
                Ok(halves) => halves,
                Err(err) => {
                    mm.regions.insert(key, region);
                    return Err(err);
                }
            };

            key = first.start().into_raw();
            mm.regions.insert(first.start().into_raw(), first);
            mm.regions.insert(second.start().into_raw(), second);
        }

        region_unmap(ctx, mm, key, cur_start - region_start, cur_limit - cur_start)?;
    }

    Ok(())
}

fn backend_page_fault(
    region: &mut VmRegion,
    offset: usize,
    flags: FaultFlags,
) -> Result<(), Errno> {
    match region.backend {
        RegionBackend::Anon => anon::page_fault(region, offset, flags),
        RegionBackend::AnonContig => anon_contig::page_fault(region, offset, flags),
        RegionBackend::File { .. } => file::page_fault(region, offset, flags),
    }
}

/// Installs the translation for one resolved page slot.
pub(super) fn write_map_page(ctx: &VmContext, region: &VmRegion, offset: usize) -> Result<(), Errno> {
    let pr = region.pr(offset).expect("mapping an empty page slot");
    let phys = pr.page.phys().expect("mapping a page without storage");
    let prot = region.pt_prot(pr);

    let mut pgd = ctx.pgd.lock();
    unsafe {
        pgd.map_to(
            Page::containing_address(region.start + offset),
            Frame::containing_address(phys),
            prot,
        )
    }
    .map_err(|_| Errno::ENOMEM)
}

/// Re-installs the translations of every present slot in
/// `[start, end)`. Used after write-back to re-arm dirty detection: clean
/// pages map read-only again, so the next store faults.
pub(super) fn write_map_range(
    ctx: &VmContext,
    region: &VmRegion,
    start: usize,
    end: usize,
) -> Result<(), Errno> {
    debug_assert!(start < end && end <= region.length);
    debug_assert!(start % PAGE_SIZE == 0);

    let mut off = start;
    while off < end {
        if region.pr(off).is_some() {
            write_map_page(ctx, region, off)?;
        }
        off += PAGE_SIZE;
    }

    Ok(())
}

/// The per-page fault engine.
pub(super) fn handle_pf(
    ctx: &VmContext,
    region: &mut VmRegion,
    vm_total: &mut usize,
    offset: usize,
    flags: FaultFlags,
) -> Result<(), Errno> {
    let offset = align_down(offset, PAGE_SIZE);
    debug_assert!(offset < region.length);
    debug_assert!(
        !(flags.contains(FaultFlags::WRITE) && !region.flags.contains(RegionFlags::WRITE))
    );

    if region.pr(offset).is_none() {
        region.set_pr(
            offset,
            PhysRegion {
                page: PageFrame::new(None),
            },
            vm_total,
        );
    }

    let needs_backend = {
        let pr = region.pr(offset).expect("page slot just created");
        !flags.contains(FaultFlags::WRITE)
            || !region.pr_writable(pr)
            || pr.page.phys().is_none()
    };

    if needs_backend
        && let Err(err) = backend_page_fault(region, offset, flags)
    {
        region.clear_pr(offset, vm_total);
        return Err(err);
    }

    write_map_page(ctx, region, offset)
}

/// Faults a whole range in.
pub(super) fn handle_memory(
    ctx: &VmContext,
    region: &mut VmRegion,
    vm_total: &mut usize,
    offset: usize,
    len: usize,
    flags: FaultFlags,
) -> Result<(), Errno> {
    debug_assert!(len > 0);

    let mut off = offset;
    while off < offset + len {
        handle_pf(ctx, region, vm_total, off, flags)?;
        off += PAGE_SIZE;
    }

    Ok(())
}

/// The brk engine: extends the nearest region below `addr` up to it,
/// resizing in place when the backend allows and appending a fresh
/// anonymous region otherwise.
pub(super) fn extend_up_to(ctx: &VmContext, mm: &mut AddressSpace, addr: usize) -> Result<(), Errno> {
    let addr = align_up(addr, PAGE_SIZE);

    let mut best: Option<(usize, usize)> = None; // (key, distance)
    for (key, region) in mm.regions.iter() {
        let start = region.start().into_raw();
        let end = region.end().into_raw();

        if addr >= start && addr <= end {
            return Ok(());
        }
        if addr < start {
            continue;
        }

        let distance = addr - start;
        if best.is_none_or(|(_, best_distance)| distance < best_distance) {
            best = Some((*key, distance));
        }
    }

    let Some((key, _)) = best else {
        debug!(Vm, "brk({addr:#x}) with no extensible region");
        return Err(Errno::EINVAL);
    };

    let (limit, resizable) = {
        let region = &mm.regions[&key];
        (
            region.end().into_raw(),
            matches!(region.backend, RegionBackend::Anon),
        )
    };

    if !resizable {
        let extra = addr - limit;
        region_map(
            ctx,
            mm,
            limit,
            0,
            extra,
            RegionFlags::READ | RegionFlags::WRITE | RegionFlags::ANON,
            MapRegionFlags::empty(),
            RegionBackend::Anon,
        )?;
        return Ok(());
    }

    let region = mm.regions.get_mut(&key).expect("brk region vanished");
    let new_length = addr - region.start().into_raw();
    region.resize_to(new_length);
    Ok(())
}
