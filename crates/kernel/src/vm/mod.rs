//! Guest virtual memory: contexts, regions, the page cache and the fault
//! path.
//!
//! A context is a reference-counted address space with an id the host uses
//! to name it. The context registry holds one reference; every thread
//! running inside holds another. When both are gone the regions drain and
//! the translation tree is freed.

pub mod cache;
pub mod exec;
pub mod fault;
pub mod page;
pub mod region;

mod anon;
mod anon_contig;
mod file;

#[cfg(test)]
mod tests;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use lazy_static::lazy_static;
use slab::Slab;

use storpu_abi::errors::Errno;
use storpu_abi::vm as abi;

use crate::debug::Vm;
use crate::memory::paging::{PAGE_SIZE, PhysPageTable};
use crate::memory::{align_up, in_direct_map};
use crate::smp::CpuLocal;
use crate::utils::locks::{Mutex, SpinLock, mutex, spinlock};
use crate::{PhysAddr, VirtAddr, arch};

pub use region::{FaultFlags, MapRegionFlags, RegionBackend, RegionFlags, VmRegion};

/// Everything behind a context's mmap lock.
pub struct AddressSpace {
    pub(crate) regions: BTreeMap<usize, VmRegion>,
    /// Bytes behind faulted-in page slots; see the accounting invariant in
    /// [`region`].
    pub(crate) vm_total: usize,
    pub(crate) load_base: VirtAddr,
    pub(crate) entry: VirtAddr,
    pub(crate) text_size: usize,
    pub(crate) data_size: usize,
    pub(crate) tls: exec::TlsLayout,
}

impl AddressSpace {
    fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            vm_total: 0,
            load_base: VirtAddr::null(),
            entry: VirtAddr::null(),
            text_size: 0,
            data_size: 0,
            tls: exec::TlsLayout::default(),
        }
    }
}

pub struct VmContext {
    cid: u32,
    /// Guards the translation tree; leaf of the vm lock order.
    pub(crate) pgd: SpinLock<PhysPageTable>,
    /// The mmap lock: regions, accounting, load state.
    pub(crate) mm: Mutex<AddressSpace>,
}

impl VmContext {
    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn vm_total(&self) -> usize {
        self.mm.lock().vm_total
    }

    pub fn entry(&self) -> VirtAddr {
        self.mm.lock().entry
    }

    pub fn load_base(&self) -> VirtAddr {
        self.mm.lock().load_base
    }

    /// `mmap`: builds a region per the ABI flag rules and returns the
    /// user-visible address.
    pub fn map(
        &self,
        addr: usize,
        len: usize,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u64,
    ) -> Result<usize, Errno> {
        if len == 0 {
            return Err(Errno::EINVAL);
        }

        let share = flags & (abi::MAP_PRIVATE | abi::MAP_SHARED);
        if share == 0 || share == abi::MAP_PRIVATE | abi::MAP_SHARED {
            return Err(Errno::EINVAL);
        }

        if flags & abi::MAP_FIXED != 0 && addr % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }

        if fd == -1 || flags & abi::MAP_ANONYMOUS != 0 {
            if fd != -1 {
                return Err(Errno::EINVAL);
            }
            // A contiguous mapping only makes sense fully populated.
            if flags & (abi::MAP_CONTIG | abi::MAP_POPULATE) == abi::MAP_CONTIG {
                return Err(Errno::EINVAL);
            }

            let mut vr_flags = RegionFlags::from_prot(prot) | RegionFlags::ANON;
            if flags & abi::MAP_SHARED != 0 {
                vr_flags |= RegionFlags::MAP_SHARED;
            }

            let backend = if flags & abi::MAP_CONTIG != 0 {
                RegionBackend::AnonContig
            } else {
                RegionBackend::Anon
            };

            let len = align_up(len, PAGE_SIZE);
            let mut mm = self.mm.lock();
            return self.mmap_region(&mut mm, addr, flags, len, vr_flags, backend);
        }

        self.map_file(addr, len, prot, flags, fd, offset)
    }

    fn map_file(
        &self,
        addr: usize,
        len: usize,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: u64,
    ) -> Result<usize, Errno> {
        if flags & abi::MAP_CONTIG != 0 {
            return Err(Errno::EINVAL);
        }

        let mut vr_flags = RegionFlags::from_prot(prot);
        if flags & abi::MAP_SHARED != 0 {
            vr_flags |= RegionFlags::MAP_SHARED;
        }

        let page_off = (offset % PAGE_SIZE as u64) as usize;
        let offset = offset - page_off as u64;
        let len = align_up(len + page_off, PAGE_SIZE);

        let mut mm = self.mm.lock();
        let start = self.mmap_region(
            &mut mm,
            addr,
            flags,
            len,
            vr_flags,
            RegionBackend::File { fd, offset },
        )?;

        Ok(start + page_off)
    }

    fn mmap_region(
        &self,
        mm: &mut AddressSpace,
        addr: usize,
        mmap_flags: u32,
        len: usize,
        vr_flags: RegionFlags,
        backend: RegionBackend,
    ) -> Result<usize, Errno> {
        let mut map_flags = MapRegionFlags::empty();
        if mmap_flags & abi::MAP_POPULATE != 0 {
            map_flags |= MapRegionFlags::PREALLOC;
        }

        let fixed = mmap_flags & abi::MAP_FIXED != 0;
        let hint = crate::memory::align_down(addr, PAGE_SIZE);

        // A fixed mapping first clears whatever overlaps it.
        if hint != 0 && fixed {
            region::region_unmap_range(self, mm, hint, len)?;
        }

        if hint != 0 || fixed {
            match region::region_map(self, mm, hint, 0, len, vr_flags, map_flags, backend) {
                Ok(start) => return Ok(start),
                Err(err) if fixed => return Err(err),
                Err(_) => {}
            }
        }

        region::region_map(
            self,
            mm,
            crate::config::VM_USER_START,
            crate::config::VM_USER_TOP,
            len,
            vr_flags,
            map_flags,
            backend,
        )
    }

    /// `munmap`.
    pub fn unmap(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let len = align_up(len, PAGE_SIZE);
        let mut mm = self.mm.lock();
        region::region_unmap_range(self, &mut mm, addr, len)
    }

    /// `msync`: write dirty cached pages of every covered shared file
    /// region back, then re-arm their dirty tracking.
    pub fn msync(&self, addr: usize, len: usize, flags: u32) -> Result<(), Errno> {
        if flags & !(abi::MS_ASYNC | abi::MS_INVALIDATE | abi::MS_SYNC) != 0 {
            return Err(Errno::EINVAL);
        }
        if addr % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        if flags & abi::MS_ASYNC != 0 && flags & abi::MS_SYNC != 0 {
            return Err(Errno::EINVAL);
        }

        let len = align_up(len, PAGE_SIZE);
        let end = addr.checked_add(len).ok_or(Errno::ENOMEM)?;
        if end == addr {
            return Ok(());
        }

        let mut unmapped_gap = false;
        let mut start = addr;

        let mm = self.mm.lock();
        loop {
            let Some(key) = lookup_ceiling(&mm, start) else {
                return Err(Errno::ENOMEM);
            };
            let region = &mm.regions[&key];

            if start < region.start().into_raw() {
                // Hole in the range.
                if flags == abi::MS_ASYNC {
                    return Err(Errno::ENOMEM);
                }
                start = region.start().into_raw();
                if start >= end {
                    return Err(Errno::ENOMEM);
                }
                unmapped_gap = true;
            }

            let start_off = start - region.start().into_raw();
            let end_off = (end - region.start().into_raw()).min(region.len());

            start = region.end().into_raw();

            let syncable = flags & abi::MS_SYNC != 0
                && region.flags().contains(RegionFlags::MAP_SHARED)
                && matches!(region.backend(), RegionBackend::File { .. });

            if syncable {
                file::sync_range(region, start_off, end_off)?;
                region::write_map_range(self, region, start_off, end_off)?;
            }

            if start >= end {
                break;
            }
        }
        drop(mm);

        if unmapped_gap {
            return Err(Errno::ENOMEM);
        }
        Ok(())
    }

    /// `brk`.
    pub fn brk(&self, addr: usize) -> Result<(), Errno> {
        let mut mm = self.mm.lock();
        region::extend_up_to(self, &mut mm, addr)
    }

    /// Resolves an access fault. `required` is the region flag the access
    /// needs (write, exec, or any). `false` means the fault stands and the
    /// guest thread must be terminated.
    pub fn handle_page_fault(&self, addr: usize, flags: FaultFlags, required: RegionFlags) -> bool {
        let mut mm = self.mm.lock();

        let Some(key) = region::lookup(&mm, addr) else {
            debug!(Vm, "context {} bad address {addr:#x}", self.cid);
            return false;
        };

        let AddressSpace {
            regions, vm_total, ..
        } = &mut *mm;
        let region = regions.get_mut(&key).expect("fault region vanished");

        if !region.flags().intersects(required) {
            debug!(Vm, "context {} bad access {addr:#x}", self.cid);
            return false;
        }

        let offset = addr - region.start().into_raw();
        region::handle_pf(self, region, vm_total, offset, flags).is_ok()
    }

    /// Translates a user buffer into one physically contiguous span.
    /// Kernel linear-mapping addresses translate directly.
    pub fn vumap(&self, addr: VirtAddr, size: usize) -> Result<(PhysAddr, usize), Errno> {
        if size == 0 {
            return Err(Errno::EINVAL);
        }

        if in_direct_map(addr) {
            return Ok((addr.into_phys(), size));
        }

        let pgd = self.pgd.lock();
        pgd.translate_range(addr, size).ok_or(Errno::EFAULT)
    }
}

impl Drop for VmContext {
    fn drop(&mut self) {
        let mm = self.mm.get_mut();
        let AddressSpace {
            regions, vm_total, ..
        } = mm;

        for region in regions.values_mut() {
            region.release_prs(vm_total);
        }
        regions.clear();

        debug_assert_eq!(*vm_total, 0);
        // The translation tree frees itself when `pgd` drops.
    }
}

impl core::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmContext").field("cid", &self.cid).finish_non_exhaustive()
    }
}

/// Containing region, or the nearest region above. The msync walk needs
/// to see holes.
fn lookup_ceiling(mm: &AddressSpace, addr: usize) -> Option<usize> {
    region::lookup(mm, addr).or_else(|| mm.regions.range(addr..).next().map(|(key, _)| *key))
}

static CONTEXTS: SpinLock<Slab<Arc<VmContext>>> = spinlock(Slab::new());

lazy_static! {
    static ref CURRENT_CTX: CpuLocal<SpinLock<Option<Arc<VmContext>>>> =
        CpuLocal::from_fn(|_| spinlock(None));
}

pub fn init() {
    debug!(Vm, "context registry and page cache ready");
}

/// Creates an empty context and registers it; the returned reference is
/// the registry's plus one for the caller.
pub fn create_context() -> Result<Arc<VmContext>, Errno> {
    let pgd = PhysPageTable::create().map_err(|_| Errno::ENOMEM)?;

    let mut registry = CONTEXTS.lock();
    let entry = registry.vacant_entry();
    let cid = entry.key() as u32 + 1;

    let ctx = Arc::new(VmContext {
        cid,
        pgd: spinlock(pgd),
        mm: mutex(AddressSpace::new()),
    });
    entry.insert(ctx.clone());

    debug!(Vm, "created context {cid}");
    Ok(ctx)
}

/// Looks a context up by id, taking a reference.
pub fn find_get_context(cid: u32) -> Option<Arc<VmContext>> {
    if cid == 0 {
        return None;
    }
    CONTEXTS.lock().get(cid as usize - 1).cloned()
}

/// Drops the host's reference. The context disappears once the threads
/// using it are gone too.
pub fn delete_context(ctx: &Arc<VmContext>) {
    CONTEXTS.lock().try_remove(ctx.cid as usize - 1);
}

/// Installs `ctx` as this cpu's user address space.
pub fn switch_context(ctx: &Arc<VmContext>) {
    let slot = CURRENT_CTX.get();
    let mut current = slot.lock();

    if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, ctx)) {
        return;
    }

    arch::mmu::switch_address_space(ctx.pgd.lock().phys_addr());
    *current = Some(ctx.clone());
}

/// The context whose translations this cpu currently runs under.
pub fn current_context() -> Option<Arc<VmContext>> {
    CURRENT_CTX.get().lock().clone()
}
