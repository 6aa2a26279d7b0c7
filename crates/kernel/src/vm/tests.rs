use alloc::vec::Vec;

use storpu_abi::errors::Errno;
use storpu_abi::file::FD_SCRATCHPAD;
use storpu_abi::vm as abi;

use super::*;
use crate::memory::paging::{EntryFlags, PAGE_SIZE};
use crate::test_support;
use crate::{VirtAddr, fs};

const RW: u32 = abi::PROT_READ | abi::PROT_WRITE;

fn assert_disjoint_regions(ctx: &VmContext) {
    let mm = ctx.mm.lock();
    let mut last_end = 0usize;
    for (start, region) in mm.regions.iter() {
        assert_eq!(*start, region.start().into_raw());
        assert!(*start >= last_end, "overlapping regions at {start:#x}");
        last_end = region.end().into_raw();
    }
}

fn byte_at(ctx: &VmContext, addr: usize) -> u8 {
    let phys = ctx
        .pgd
        .lock()
        .translate(VirtAddr::from_bits(addr))
        .expect("address not mapped");
    unsafe { *phys.into_virt().into_ptr::<u8>() }
}

fn poke(ctx: &VmContext, addr: usize, value: u8) {
    let phys = ctx
        .pgd
        .lock()
        .translate(VirtAddr::from_bits(addr))
        .expect("address not mapped");
    unsafe { *phys.into_virt().into_ptr::<u8>() = value };
}

#[test]
fn populated_anonymous_mapping_is_resolved_and_zero() {
    test_support::init();
    let ctx = create_context().unwrap();

    let addr = ctx
        .map(
            0,
            2 * PAGE_SIZE,
            RW,
            abi::MAP_ANONYMOUS | abi::MAP_PRIVATE | abi::MAP_POPULATE,
            -1,
            0,
        )
        .unwrap();

    assert_eq!(ctx.vm_total(), 2 * PAGE_SIZE);
    assert_eq!(byte_at(&ctx, addr), 0);
    assert_eq!(byte_at(&ctx, addr + PAGE_SIZE), 0);
    assert_disjoint_regions(&ctx);

    delete_context(&ctx);
}

#[test]
fn unmap_forgets_the_range() {
    test_support::init();
    let ctx = create_context().unwrap();

    let base = 0x100_0000;
    ctx.map(
        base,
        2 * PAGE_SIZE,
        RW,
        abi::MAP_ANONYMOUS | abi::MAP_PRIVATE | abi::MAP_FIXED | abi::MAP_POPULATE,
        -1,
        0,
    )
    .unwrap();
    assert_eq!(ctx.vm_total(), 2 * PAGE_SIZE);

    ctx.unmap(base, 2 * PAGE_SIZE).unwrap();

    assert_eq!(ctx.vm_total(), 0);
    assert!(ctx.pgd.lock().translate(VirtAddr::from_bits(base)).is_none());
    // A fresh access has nothing to resolve against.
    assert!(!ctx.handle_page_fault(
        base,
        FaultFlags::INTERRUPTIBLE,
        RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC
    ));

    delete_context(&ctx);
}

#[test]
fn interior_unmap_splits_the_region() {
    test_support::init();
    let ctx = create_context().unwrap();

    let base = 0x200_0000;
    ctx.map(
        base,
        4 * PAGE_SIZE,
        RW,
        abi::MAP_ANONYMOUS | abi::MAP_PRIVATE | abi::MAP_FIXED | abi::MAP_POPULATE,
        -1,
        0,
    )
    .unwrap();

    ctx.unmap(base + PAGE_SIZE, 2 * PAGE_SIZE).unwrap();

    {
        let mm = ctx.mm.lock();
        assert_eq!(mm.regions.len(), 2);
        let first = &mm.regions[&base];
        let second = &mm.regions[&(base + 3 * PAGE_SIZE)];
        assert_eq!(first.len(), PAGE_SIZE);
        assert_eq!(second.len(), PAGE_SIZE);
    }

    assert_eq!(ctx.vm_total(), 2 * PAGE_SIZE);
    assert!(
        ctx.pgd
            .lock()
            .translate(VirtAddr::from_bits(base + PAGE_SIZE))
            .is_none()
    );
    assert!(
        ctx.pgd
            .lock()
            .translate(VirtAddr::from_bits(base + 3 * PAGE_SIZE))
            .is_some()
    );
    assert_disjoint_regions(&ctx);

    delete_context(&ctx);
}

#[test]
fn fixed_mapping_replaces_overlap() {
    test_support::init();
    let ctx = create_context().unwrap();

    let base = 0x300_0000;
    ctx.map(
        base,
        2 * PAGE_SIZE,
        RW,
        abi::MAP_ANONYMOUS | abi::MAP_PRIVATE | abi::MAP_FIXED | abi::MAP_POPULATE,
        -1,
        0,
    )
    .unwrap();
    poke(&ctx, base, 0x5A);

    // Same window again: the old contents must be gone.
    ctx.map(
        base,
        2 * PAGE_SIZE,
        RW,
        abi::MAP_ANONYMOUS | abi::MAP_PRIVATE | abi::MAP_FIXED | abi::MAP_POPULATE,
        -1,
        0,
    )
    .unwrap();

    assert_eq!(byte_at(&ctx, base), 0);
    assert_eq!(ctx.vm_total(), 2 * PAGE_SIZE);
    assert_disjoint_regions(&ctx);

    delete_context(&ctx);
}

#[test]
fn mmap_flag_validation() {
    test_support::init();
    let ctx = create_context().unwrap();

    // Exactly one of shared/private.
    assert_eq!(
        ctx.map(0, PAGE_SIZE, RW, abi::MAP_ANONYMOUS, -1, 0),
        Err(Errno::EINVAL)
    );
    assert_eq!(
        ctx.map(
            0,
            PAGE_SIZE,
            RW,
            abi::MAP_ANONYMOUS | abi::MAP_SHARED | abi::MAP_PRIVATE,
            -1,
            0
        ),
        Err(Errno::EINVAL)
    );
    // Contig without populate.
    assert_eq!(
        ctx.map(
            0,
            PAGE_SIZE,
            RW,
            abi::MAP_ANONYMOUS | abi::MAP_PRIVATE | abi::MAP_CONTIG,
            -1,
            0
        ),
        Err(Errno::EINVAL)
    );
    // Fixed with an unaligned hint.
    assert_eq!(
        ctx.map(
            0x123,
            PAGE_SIZE,
            RW,
            abi::MAP_ANONYMOUS | abi::MAP_PRIVATE | abi::MAP_FIXED,
            -1,
            0
        ),
        Err(Errno::EINVAL)
    );
    // Contiguous file mappings do not exist.
    assert_eq!(
        ctx.map(
            0,
            PAGE_SIZE,
            RW,
            abi::MAP_SHARED | abi::MAP_CONTIG | abi::MAP_POPULATE,
            0,
            0
        ),
        Err(Errno::EINVAL)
    );

    delete_context(&ctx);
}

#[test]
fn contiguous_mapping_is_physically_contiguous() {
    test_support::init();
    let ctx = create_context().unwrap();

    let addr = ctx
        .map(
            0,
            4 * PAGE_SIZE,
            RW,
            abi::MAP_ANONYMOUS | abi::MAP_PRIVATE | abi::MAP_CONTIG | abi::MAP_POPULATE,
            -1,
            0,
        )
        .unwrap();

    let base = ctx
        .pgd
        .lock()
        .translate(VirtAddr::from_bits(addr))
        .unwrap();
    for i in 1..4 {
        let phys = ctx
            .pgd
            .lock()
            .translate(VirtAddr::from_bits(addr + i * PAGE_SIZE))
            .unwrap();
        assert_eq!(phys, base + i * PAGE_SIZE);
    }
    assert_eq!(byte_at(&ctx, addr + 3 * PAGE_SIZE), 0);

    // A buffer there translates as one span for I/O submission.
    let (phys, len) = ctx
        .vumap(VirtAddr::from_bits(addr), 4 * PAGE_SIZE)
        .unwrap();
    assert_eq!(phys, base);
    assert_eq!(len, 4 * PAGE_SIZE);

    delete_context(&ctx);
}

#[test]
fn brk_grows_the_data_region() {
    test_support::init();
    let ctx = create_context().unwrap();

    let base = 0x400_0000;
    ctx.map(
        base,
        PAGE_SIZE,
        RW,
        abi::MAP_ANONYMOUS | abi::MAP_PRIVATE | abi::MAP_FIXED,
        -1,
        0,
    )
    .unwrap();

    ctx.brk(base + 3 * PAGE_SIZE).unwrap();

    {
        let mm = ctx.mm.lock();
        assert_eq!(mm.regions[&base].len(), 3 * PAGE_SIZE);
    }
    // Nothing faulted in yet.
    assert_eq!(ctx.vm_total(), 0);

    assert!(ctx.handle_page_fault(
        base + 2 * PAGE_SIZE,
        FaultFlags::WRITE | FaultFlags::INTERRUPTIBLE,
        RegionFlags::WRITE
    ));
    assert_eq!(ctx.vm_total(), PAGE_SIZE);

    // No region below the target at all: nothing to extend.
    assert_eq!(ctx.brk(0x10_0000), Err(Errno::EINVAL));

    delete_context(&ctx);
}

#[test]
fn write_fault_on_readonly_region_is_refused() {
    test_support::init();
    let ctx = create_context().unwrap();

    let addr = ctx
        .map(
            0,
            PAGE_SIZE,
            abi::PROT_READ,
            abi::MAP_ANONYMOUS | abi::MAP_PRIVATE,
            -1,
            0,
        )
        .unwrap();

    assert!(!ctx.handle_page_fault(
        addr,
        FaultFlags::WRITE | FaultFlags::INTERRUPTIBLE,
        RegionFlags::WRITE
    ));

    delete_context(&ctx);
}

#[test]
fn flash_mapping_faults_through_the_cache_and_writes_back() {
    let _guard = test_support::scheduler_guard();
    let state = test_support::install_mock_ftl(1 << 20);

    {
        let mut st = state.lock().unwrap();
        for (i, byte) in st.data[..crate::config::FLASH_PG_SIZE].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
    }

    let ctx = create_context().unwrap();
    let fd = 0;
    let addr = ctx
        .map(0, crate::config::FLASH_PG_SIZE, RW, abi::MAP_SHARED, fd, 0)
        .unwrap();

    // First touch promotes the whole flash page into the cache.
    assert!(ctx.handle_page_fault(
        addr,
        FaultFlags::INTERRUPTIBLE,
        RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC
    ));
    assert_eq!(cache::cached_page_count(fd), 1);
    assert_eq!(byte_at(&ctx, addr), 0);
    assert_eq!(byte_at(&ctx, addr + 100), (100 % 251) as u8);
    assert_eq!(state.lock().unwrap().reads.len(), 1);

    // A second fault in the same line hits the cache: no new read.
    assert!(ctx.handle_page_fault(
        addr + 2 * PAGE_SIZE,
        FaultFlags::INTERRUPTIBLE,
        RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC
    ));
    assert_eq!(state.lock().unwrap().reads.len(), 1);
    assert_eq!(cache::cached_page_count(fd), 1);

    // Dirtying store at offset 4096, then a synchronous write-back.
    assert!(ctx.handle_page_fault(
        addr + PAGE_SIZE,
        FaultFlags::WRITE | FaultFlags::INTERRUPTIBLE,
        RegionFlags::WRITE
    ));
    poke(&ctx, addr + PAGE_SIZE, 0xAB);

    ctx.msync(addr, crate::config::FLASH_PG_SIZE, abi::MS_SYNC).unwrap();

    {
        let st = state.lock().unwrap();
        assert_eq!(st.writes, alloc::vec![(1, 0, crate::config::FLASH_PG_SIZE as u64)]);
        assert_eq!(st.data[PAGE_SIZE], 0xAB);
    }

    // The write-back re-armed dirty detection: the page is clean and its
    // translation read-only again.
    let flags = ctx
        .pgd
        .lock()
        .get_flags(crate::memory::paging::Page::containing_address(
            VirtAddr::from_bits(addr + PAGE_SIZE),
        ))
        .unwrap();
    assert!(!flags.contains(EntryFlags::WRITE));

    // Nothing dirty, so a second sync writes nothing.
    ctx.msync(addr, crate::config::FLASH_PG_SIZE, abi::MS_SYNC).unwrap();
    assert_eq!(state.lock().unwrap().writes.len(), 1);

    delete_context(&ctx);
}

#[test]
fn copy_identity_through_write_then_read_then_map() {
    let _guard = test_support::scheduler_guard();
    let state = test_support::install_mock_ftl(1 << 20);
    let fd = 1; // untouched namespace: nothing cached for it yet

    let buf = crate::memory::frame_allocator::alloc_vmpages(
        1,
        crate::memory::frame_allocator::ZoneSet::ANY,
    )
    .unwrap();
    let pattern: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 13) as u8 ^ 0x5F).collect();
    unsafe {
        core::ptr::copy_nonoverlapping(pattern.as_ptr(), buf.into_ptr::<u8>(), PAGE_SIZE);
    }

    assert_eq!(fs::spu_write(fd, buf, PAGE_SIZE, 0), Ok(PAGE_SIZE));

    let readback = crate::memory::frame_allocator::alloc_vmpages(
        1,
        crate::memory::frame_allocator::ZoneSet::ANY,
    )
    .unwrap();
    assert_eq!(fs::spu_read(fd, readback, PAGE_SIZE, 0), Ok(PAGE_SIZE));
    let readback_slice = unsafe { core::slice::from_raw_parts(readback.into_ptr::<u8>(), PAGE_SIZE) };
    assert_eq!(readback_slice, &pattern[..]);

    // The same bytes again through a shared mapping's fault path.
    let ctx = create_context().unwrap();
    let addr = ctx
        .map(0, crate::config::FLASH_PG_SIZE, RW, abi::MAP_SHARED, fd, 0)
        .unwrap();
    assert!(ctx.handle_page_fault(
        addr,
        FaultFlags::INTERRUPTIBLE,
        RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC
    ));
    for probe in [0usize, 1, 37, PAGE_SIZE - 1] {
        assert_eq!(byte_at(&ctx, addr + probe), pattern[probe]);
    }

    drop(state);
    delete_context(&ctx);
}

#[test]
fn scratchpad_is_a_direct_copy() {
    let _guard = test_support::scheduler_guard();

    let buf = crate::memory::frame_allocator::alloc_vmpages(
        1,
        crate::memory::frame_allocator::ZoneSet::ANY,
    )
    .unwrap();
    unsafe {
        for i in 0..64 {
            *buf.into_ptr::<u8>().add(i) = i as u8 + 1;
        }
    }

    assert_eq!(fs::spu_write(FD_SCRATCHPAD, buf, 64, 16), Ok(64));

    let readback = crate::memory::frame_allocator::alloc_vmpages(
        1,
        crate::memory::frame_allocator::ZoneSet::ANY,
    )
    .unwrap();
    assert_eq!(fs::spu_read(FD_SCRATCHPAD, readback, 64, 16), Ok(64));
    unsafe {
        for i in 0..64 {
            assert_eq!(*readback.into_ptr::<u8>().add(i), i as u8 + 1);
        }
    }

    // Past the end of the on-chip buffer.
    assert_eq!(
        fs::spu_read(FD_SCRATCHPAD, readback, 16, crate::config::SCRATCHPAD_SIZE as u64 + 1),
        Err(Errno::EFAULT)
    );
}

mod elf {
    use super::*;

    fn put_u16(image: &mut [u8], offset: usize, value: u16) {
        image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(image: &mut [u8], offset: usize, value: u64) {
        image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// One PT_LOAD segment at `vaddr` carrying `payload` plus a zeroed
    /// tail up to `memsz`.
    fn build_image(vaddr: u64, entry: u64, payload: &[u8], memsz: u64) -> Vec<u8> {
        let mut image = alloc::vec![0u8; 0x1000 + payload.len()];

        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little-endian
        image[6] = 1; // EV_CURRENT

        put_u16(&mut image, 0x10, 2); // ET_EXEC
        put_u16(&mut image, 0x12, 0xB7); // EM_AARCH64
        put_u32(&mut image, 0x14, 1);
        put_u64(&mut image, 0x18, entry);
        put_u64(&mut image, 0x20, 0x40); // e_phoff
        put_u16(&mut image, 0x34, 0x40); // e_ehsize
        put_u16(&mut image, 0x36, 0x38); // e_phentsize
        put_u16(&mut image, 0x38, 1); // e_phnum

        let ph = 0x40;
        put_u32(&mut image, ph, 1); // PT_LOAD
        put_u32(&mut image, ph + 4, 0x6); // PF_R | PF_W
        put_u64(&mut image, ph + 0x08, 0x1000); // p_offset
        put_u64(&mut image, ph + 0x10, vaddr);
        put_u64(&mut image, ph + 0x20, payload.len() as u64);
        put_u64(&mut image, ph + 0x28, memsz);
        put_u64(&mut image, ph + 0x30, 0x1000); // p_align

        image[0x1000..0x1000 + payload.len()].copy_from_slice(payload);
        image
    }

    #[test]
    fn exec_loads_segments_and_zero_fills() {
        test_support::init();
        let ctx = create_context().unwrap();

        let vaddr = 0x10_0000u64;
        let payload = b"storpu guest payload";
        let image = build_image(vaddr, vaddr + 0x40, payload, 0x2000);

        exec::vm_exec(&ctx, &image).unwrap();

        assert_eq!(ctx.entry().into_raw(), vaddr as usize + 0x40);
        for (i, byte) in payload.iter().enumerate() {
            assert_eq!(byte_at(&ctx, vaddr as usize + i), *byte);
        }
        // bss tail
        assert_eq!(byte_at(&ctx, vaddr as usize + payload.len()), 0);
        assert_eq!(byte_at(&ctx, vaddr as usize + 0x1FFF), 0);

        {
            let mm = ctx.mm.lock();
            assert_eq!(mm.data_size, 0x2000);
            assert_eq!(mm.text_size, 0);
        }

        delete_context(&ctx);
    }

    #[test]
    fn exec_rejects_garbage() {
        test_support::init();
        let ctx = create_context().unwrap();

        assert_eq!(exec::vm_exec(&ctx, b"not an elf"), Err(Errno::ENOEXEC));

        delete_context(&ctx);
    }
}
