//! The file objects guests see.
//!
//! A descriptor is one of three things: a flash namespace (non-negative,
//! `nsid = fd + 1`), the host's DMA window, or the on-chip scratchpad.
//! Flash and host I/O become FTL tasks the calling thread blocks on; the
//! scratchpad is a direct copy. Buffers must translate to one physically
//! contiguous span, because an FTL task carries a single physical range.

use storpu_abi::errors::Errno;
use storpu_abi::file::{FD_HOST_MEM, FD_SCRATCHPAD, nsid_of};
use storpu_abi::tasks::{FtlTask, FtlTaskKind};

use crate::config::FILE_MAX;
use crate::memory::in_direct_map;
use crate::{PhysAddr, VirtAddr, arch, smp, tasks, thread};

/// What a raw descriptor names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDesc {
    Flash { nsid: u32 },
    HostMem,
    Scratchpad,
}

pub fn classify(fd: i32) -> Result<FileDesc, Errno> {
    match fd {
        FD_HOST_MEM => Ok(FileDesc::HostMem),
        FD_SCRATCHPAD => Ok(FileDesc::Scratchpad),
        fd if fd >= 0 && (fd as usize) < FILE_MAX => Ok(FileDesc::Flash { nsid: nsid_of(fd) }),
        _ => Err(Errno::EINVAL),
    }
}

/// Translates `buf` into one contiguous physical span of exactly `count`
/// bytes. Kernel linear-mapping buffers translate directly; guest buffers
/// go through the calling thread's context.
fn buf_to_phys(buf: VirtAddr, count: usize) -> Result<PhysAddr, Errno> {
    if in_direct_map(buf) {
        return Ok(buf.into_phys());
    }

    let ctx = thread::current::current()
        .vm_context()
        .ok_or(Errno::EFAULT)?;
    let (phys, len) = ctx.vumap(buf, count)?;
    if len != count {
        return Err(Errno::EFAULT);
    }
    Ok(phys)
}

fn ftl_error(retval: i32) -> Errno {
    Errno::try_from(retval).unwrap_or(Errno::EIO)
}

fn file_readwrite(
    fd: i32,
    buf: VirtAddr,
    count: usize,
    offset: u64,
    write: bool,
) -> Result<usize, Errno> {
    let desc = classify(fd)?;

    let phys = buf_to_phys(buf, count)?;

    let kind = match (desc, write) {
        (FileDesc::HostMem, false) => FtlTaskKind::HostRead,
        (FileDesc::HostMem, true) => FtlTaskKind::HostWrite,
        (FileDesc::Flash { .. }, false) => FtlTaskKind::FlashRead,
        (FileDesc::Flash { .. }, true) => FtlTaskKind::FlashWrite,
        (FileDesc::Scratchpad, _) => unreachable!("scratchpad handled by the caller"),
    };

    let mut task = FtlTask::new(kind, smp::cpu_id() as i32);
    if let FileDesc::Flash { nsid } = desc {
        task.nsid = nsid;
    }
    task.buf_phys = phys.into_raw() as u64;
    task.addr = offset;
    task.count = count as u64;

    let retval = tasks::submit_ftl_task_and_wait(&mut task);
    if retval != 0 {
        return Err(ftl_error(retval));
    }

    Ok(count)
}

/// Bounds-clamps a scratchpad access; `EFAULT` past the end.
fn map_scratchpad(offset: u64, count: usize) -> Result<(*mut u8, usize), Errno> {
    let size = crate::config::SCRATCHPAD_SIZE;
    let offset = offset as usize;

    if offset >= size {
        return Err(Errno::EFAULT);
    }

    let count = count.min(size - offset);
    Ok((unsafe { arch::scratchpad_base().add(offset) }, count))
}

fn scratchpad_copy(buf: VirtAddr, count: usize, offset: u64, write: bool) -> Result<usize, Errno> {
    let (spad, count) = map_scratchpad(offset, count)?;

    let phys = buf_to_phys(buf, count)?;
    let kernel_buf = phys.into_virt().into_ptr::<u8>();

    unsafe {
        if write {
            core::ptr::copy_nonoverlapping(kernel_buf, spad, count);
        } else {
            core::ptr::copy_nonoverlapping(spad, kernel_buf, count);
        }
    }

    Ok(count)
}

/// Reads `count` bytes at `offset` of `fd` into `buf`.
pub fn spu_read(fd: i32, buf: VirtAddr, count: usize, offset: u64) -> Result<usize, Errno> {
    if fd == FD_SCRATCHPAD {
        return scratchpad_copy(buf, count, offset, false);
    }
    file_readwrite(fd, buf, count, offset, false)
}

/// Writes `count` bytes from `buf` at `offset` of `fd`.
pub fn spu_write(fd: i32, buf: VirtAddr, count: usize, offset: u64) -> Result<usize, Errno> {
    if fd == FD_SCRATCHPAD {
        return scratchpad_copy(buf, count, offset, true);
    }
    file_readwrite(fd, buf, count, offset, true)
}

fn file_sync(fd: i32, kind: FtlTaskKind) -> Result<(), Errno> {
    if fd < 0 {
        return Err(Errno::EINVAL);
    }

    let mut task = FtlTask::new(kind, smp::cpu_id() as i32);
    task.nsid = nsid_of(fd);

    let retval = tasks::submit_ftl_task_and_wait(&mut task);
    if retval != 0 {
        return Err(ftl_error(retval));
    }
    Ok(())
}

/// Flushes a namespace, metadata included.
pub fn sys_fsync(fd: i32) -> Result<(), Errno> {
    file_sync(fd, FtlTaskKind::Flush)
}

/// Flushes a namespace's data.
pub fn sys_fdatasync(fd: i32) -> Result<(), Errno> {
    file_sync(fd, FtlTaskKind::FlushData)
}

/// Device-wide sync.
pub fn sys_sync() -> Result<(), Errno> {
    file_sync(0, FtlTaskKind::Sync)
}
