//! Guest I/O entry points.

use storpu_abi::errors::errno_count;

use crate::{VirtAddr, fs, logln};

pub extern "C" fn spu_read(fd: i32, buf: *mut u8, count: usize, offset: u64) -> isize {
    errno_count(fs::spu_read(fd, VirtAddr::from_ptr(buf), count, offset))
}

pub extern "C" fn spu_write(fd: i32, buf: *const u8, count: usize, offset: u64) -> isize {
    errno_count(fs::spu_write(fd, VirtAddr::from_ptr(buf), count, offset))
}

fn errno_of(r: Result<(), storpu_abi::errors::Errno>) -> i32 {
    match r {
        Ok(()) => 0,
        Err(err) => err as i32,
    }
}

pub extern "C" fn sys_fsync(fd: i32) -> i32 {
    errno_of(fs::sys_fsync(fd))
}

pub extern "C" fn sys_fdatasync(fd: i32) -> i32 {
    errno_of(fs::sys_fdatasync(fd))
}

pub extern "C" fn sys_sync() {
    let _ = fs::sys_sync();
}

/// Guest diagnostics channel.
///
/// The C side declares this variadic; the AAPCS passes the first eight
/// scalar arguments in registers, so a fixed-arity receiver sees exactly
/// what a variadic caller with up to seven values put there. The
/// directive set is the small one guests actually use.
pub extern "C" fn spu_printf(
    fmt: *const u8,
    a0: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    a6: u64,
) -> i32 {
    if fmt.is_null() {
        return storpu_abi::errors::Errno::EINVAL as i32;
    }

    let mut out = alloc::string::String::new();
    let args = [a0, a1, a2, a3, a4, a5, a6];
    let mut next_arg = 0;
    let mut take = || {
        let value = args.get(next_arg).copied().unwrap_or(0);
        next_arg += 1;
        value
    };

    let mut i = 0;
    loop {
        let byte = unsafe { *fmt.add(i) };
        if byte == 0 {
            break;
        }
        i += 1;

        if byte != b'%' {
            out.push(byte as char);
            continue;
        }

        // Skip length modifiers; everything is a u64 in registers anyway.
        let mut spec = unsafe { *fmt.add(i) };
        while spec == b'l' || spec == b'z' {
            i += 1;
            spec = unsafe { *fmt.add(i) };
        }
        i += 1;

        match spec {
            b'd' | b'i' => {
                let value = take() as i64;
                let _ = core::fmt::write(&mut out, format_args!("{value}"));
            }
            b'u' => {
                let value = take();
                let _ = core::fmt::write(&mut out, format_args!("{value}"));
            }
            b'x' => {
                let value = take();
                let _ = core::fmt::write(&mut out, format_args!("{value:x}"));
            }
            b'p' => {
                let value = take();
                let _ = core::fmt::write(&mut out, format_args!("{value:#x}"));
            }
            b'c' => {
                out.push(take() as u8 as char);
            }
            b's' => {
                let mut ptr = take() as *const u8;
                while !ptr.is_null() {
                    let ch = unsafe { *ptr };
                    if ch == 0 {
                        break;
                    }
                    out.push(ch as char);
                    ptr = unsafe { ptr.add(1) };
                }
            }
            b'%' => out.push('%'),
            0 => break,
            other => {
                out.push('%');
                out.push(other as char);
            }
        }
    }

    logln!("[guest] {}", out.trim_end_matches('\n'));
    out.len() as i32
}
