//! Loading guest ELF images into a context.
//!
//! Only what the VM needs: program headers walked, each `PT_LOAD` becomes
//! a fixed anonymous region populated with the file bytes (the zero tail
//! comes free with anonymous frames), `PT_TLS` is recorded so threads can
//! size their static TLS blocks. Symbol binding beyond the runtime's own
//! export table is the dynamic linker's business, not ours.

use alloc::sync::Arc;

use storpu_abi::errors::Errno;
use storpu_abi::vm as abi;

use crate::debug::Vm;
use crate::memory::paging::PAGE_SIZE;
use crate::memory::{align_down, align_up};
use crate::{VirtAddr, arch};

use super::VmContext;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LSB: u8 = 1;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const PT_LOAD: u32 = 1;
const PT_TLS: u32 = 7;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Where position-independent images land.
const DYN_LOAD_BASE: usize = 0x40_0000;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// Static TLS facts recorded at load time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsLayout {
    pub init_vaddr: usize,
    pub file_size: usize,
    pub mem_size: usize,
    pub align: usize,
}

fn read_struct<T: Copy>(image: &[u8], offset: usize) -> Result<T, Errno> {
    let size = core::mem::size_of::<T>();
    let bytes = image.get(offset..offset + size).ok_or(Errno::ENOEXEC)?;
    Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

fn check_header(ehdr: &Elf64Ehdr) -> Result<(), Errno> {
    if ehdr.e_ident[..4] != ELF_MAGIC
        || ehdr.e_ident[4] != ELF_CLASS_64
        || ehdr.e_ident[5] != ELF_DATA_LSB
    {
        return Err(Errno::ENOEXEC);
    }
    if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
        return Err(Errno::ENOEXEC);
    }
    Ok(())
}

/// Copies into the context's address space through its translations.
/// Every touched page must already be resolved (the loader populates).
fn copy_to_context(ctx: &VmContext, addr: usize, data: &[u8]) -> Result<(), Errno> {
    let mut copied = 0;

    while copied < data.len() {
        let virt = addr + copied;
        let chunk = (PAGE_SIZE - virt % PAGE_SIZE).min(data.len() - copied);

        let phys = ctx
            .pgd
            .lock()
            .translate(VirtAddr::from_bits(virt))
            .ok_or(Errno::EFAULT)?;

        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(copied),
                phys.into_virt().into_ptr::<u8>(),
                chunk,
            );
        }

        copied += chunk;
    }

    Ok(())
}

fn read_from_context(ctx: &VmContext, addr: usize, out: &mut [u8]) -> Result<(), Errno> {
    let mut copied = 0;

    while copied < out.len() {
        let virt = addr + copied;
        let chunk = (PAGE_SIZE - virt % PAGE_SIZE).min(out.len() - copied);

        let phys = ctx
            .pgd
            .lock()
            .translate(VirtAddr::from_bits(virt))
            .ok_or(Errno::EFAULT)?;

        unsafe {
            core::ptr::copy_nonoverlapping(
                phys.into_virt().into_ptr::<u8>(),
                out.as_mut_ptr().add(copied),
                chunk,
            );
        }

        copied += chunk;
    }

    Ok(())
}

/// Loads `image` into `ctx`: one fixed, populated, writable anonymous
/// region per `PT_LOAD`, file bytes copied in, text/data sizes and the
/// entry point recorded. The instruction cache is invalidated afterwards.
pub fn vm_exec(ctx: &Arc<VmContext>, image: &[u8]) -> Result<(), Errno> {
    let ehdr: Elf64Ehdr = read_struct(image, 0)?;
    check_header(&ehdr)?;

    let load_offset = if ehdr.e_type == ET_DYN { DYN_LOAD_BASE } else { 0 };

    let mut text_size = 0usize;
    let mut data_size = 0usize;
    let mut tls = TlsLayout::default();

    for i in 0..ehdr.e_phnum as usize {
        let phdr: Elf64Phdr =
            read_struct(image, ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize)?;

        if phdr.p_type == PT_TLS {
            tls = TlsLayout {
                init_vaddr: phdr.p_vaddr as usize + load_offset,
                file_size: phdr.p_filesz as usize,
                mem_size: phdr.p_memsz as usize,
                align: (phdr.p_align as usize).max(core::mem::align_of::<usize>()),
            };
            continue;
        }

        if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
            continue;
        }

        if phdr.p_vaddr % PAGE_SIZE as u64 != phdr.p_offset % PAGE_SIZE as u64 {
            debug!(Vm, "unaligned ELF program header {i}");
            return Err(Errno::ENOEXEC);
        }

        let vaddr = phdr.p_vaddr as usize + load_offset;
        let map_start = align_down(vaddr, PAGE_SIZE);
        let map_len = align_up(vaddr + phdr.p_memsz as usize, PAGE_SIZE) - map_start;

        let mut prot = abi::PROT_READ | abi::PROT_WRITE;
        if phdr.p_flags & PF_X != 0 {
            prot |= abi::PROT_EXEC;
        }

        ctx.map(
            map_start,
            map_len,
            prot,
            abi::MAP_PRIVATE | abi::MAP_ANONYMOUS | abi::MAP_FIXED | abi::MAP_POPULATE,
            -1,
            0,
        )?;

        let file_bytes = image
            .get(phdr.p_offset as usize..(phdr.p_offset + phdr.p_filesz) as usize)
            .ok_or(Errno::ENOEXEC)?;
        copy_to_context(ctx, vaddr, file_bytes)?;

        if phdr.p_flags & PF_X != 0 {
            text_size += map_len;
        } else if phdr.p_flags & (PF_R | PF_W) != 0 {
            data_size += map_len;
        }
    }

    {
        let mut mm = ctx.mm.lock();
        mm.entry = VirtAddr::from_bits(ehdr.e_entry as usize + load_offset);
        mm.load_base = VirtAddr::from_bits(load_offset);
        mm.text_size = text_size;
        mm.data_size = data_size;
        mm.tls = tls;
    }

    arch::mmu::flush_icache();

    debug!(
        Vm,
        "context {} loaded: entry {:#x}, text {text_size:#x}, data {data_size:#x}",
        ctx.cid(),
        ehdr.e_entry as usize + load_offset
    );

    Ok(())
}

/// Builds one thread's static TLS block inside `ctx` and returns the
/// thread-pointer value for it (zero when the image carries no TLS).
pub fn allocate_tls(ctx: &Arc<VmContext>) -> Result<usize, Errno> {
    let tls = ctx.mm.lock().tls;

    if tls.mem_size == 0 {
        return Ok(0);
    }

    let block_len = align_up(tls.mem_size, tls.align.max(16)) + 2 * core::mem::size_of::<usize>();
    let block = ctx.map(
        0,
        align_up(block_len, PAGE_SIZE),
        abi::PROT_READ | abi::PROT_WRITE,
        abi::MAP_PRIVATE | abi::MAP_ANONYMOUS | abi::MAP_POPULATE,
        -1,
        0,
    )?;

    // Copy the initialization image from the loaded segment; the rest of
    // the block is already zero.
    if tls.file_size > 0 {
        let mut init = alloc::vec![0u8; tls.file_size];
        read_from_context(ctx, tls.init_vaddr, &mut init)?;
        copy_to_context(ctx, block, &init)?;
    }

    // The thread pointer sits just past the TLS data, TCB after it.
    Ok(block + align_up(tls.mem_size, tls.align.max(16)))
}
