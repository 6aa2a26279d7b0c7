//! Guest memory-management entry points.

use storpu_abi::errors::Errno;

use crate::vm;

fn current_ctx() -> Result<alloc::sync::Arc<vm::VmContext>, Errno> {
    vm::current_context().ok_or(Errno::EINVAL)
}

fn errno_of(r: Result<(), Errno>) -> i32 {
    match r {
        Ok(()) => 0,
        Err(err) => err as i32,
    }
}

/// Extends (or shrinks) the data break up to `addr`.
pub extern "C" fn sys_brk(addr: usize) -> i32 {
    let ctx = match current_ctx() {
        Ok(ctx) => ctx,
        Err(err) => return err as i32,
    };
    errno_of(ctx.brk(addr))
}

pub extern "C" fn sys_mmap(
    addr: usize,
    length: usize,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: u64,
    out_addr: *mut usize,
) -> i32 {
    let ctx = match current_ctx() {
        Ok(ctx) => ctx,
        Err(err) => return err as i32,
    };

    match ctx.map(addr, length, prot, flags, fd, offset) {
        Ok(mapped) => {
            if !out_addr.is_null() {
                unsafe { *out_addr = mapped };
            }
            0
        }
        Err(err) => err as i32,
    }
}

pub extern "C" fn sys_munmap(addr: usize, length: usize) -> i32 {
    let ctx = match current_ctx() {
        Ok(ctx) => ctx,
        Err(err) => return err as i32,
    };
    errno_of(ctx.unmap(addr, length))
}

pub extern "C" fn sys_msync(addr: usize, length: usize, flags: u32) -> i32 {
    let ctx = match current_ctx() {
        Ok(ctx) => ctx,
        Err(err) => return err as i32,
    };
    errno_of(ctx.msync(addr, length, flags))
}
