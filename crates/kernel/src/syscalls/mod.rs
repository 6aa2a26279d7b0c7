//! The surface guest binaries link against.
//!
//! Guests are loaded into the kernel's privilege level with their own
//! translations; "syscalls" are plain calls into these `extern "C"`
//! entry points, bound by name when the dynamic linker resolves a guest
//! image against [`resolve_symbol`]. Signatures and error conventions are
//! frozen C ABI: the VM and thread calls return `0` or a positive errno,
//! the I/O calls return a byte count or a negated errno.

mod io;
mod mem;
mod thread;

pub use io::spu_printf;

use hashbrown::HashMap;
use lazy_static::lazy_static;

use storpu_abi::symbols;

lazy_static! {
    static ref SYMBOL_TABLE: HashMap<&'static str, usize> = {
        let mut table = HashMap::new();
        table.insert(symbols::SPU_PRINTF, io::spu_printf as usize);
        table.insert(symbols::SYS_BRK, mem::sys_brk as usize);
        table.insert(symbols::SYS_MMAP, mem::sys_mmap as usize);
        table.insert(symbols::SYS_MUNMAP, mem::sys_munmap as usize);
        table.insert(symbols::SYS_MSYNC, mem::sys_msync as usize);
        table.insert(symbols::SPU_THREAD_SELF, thread::spu_thread_self as usize);
        table.insert(symbols::SPU_THREAD_CREATE, thread::spu_thread_create as usize);
        table.insert(symbols::SPU_THREAD_JOIN, thread::spu_thread_join as usize);
        table.insert(symbols::SPU_THREAD_EXIT, thread::spu_thread_exit as usize);
        table.insert(
            symbols::SPU_SCHED_SETAFFINITY,
            thread::spu_sched_setaffinity as usize,
        );
        table.insert(symbols::SPU_MUTEX_INIT, thread::spu_mutex_init as usize);
        table.insert(symbols::SPU_MUTEX_TRYLOCK, thread::spu_mutex_trylock as usize);
        table.insert(symbols::SPU_MUTEX_LOCK, thread::spu_mutex_lock as usize);
        table.insert(symbols::SPU_MUTEX_UNLOCK, thread::spu_mutex_unlock as usize);
        table.insert(symbols::SPU_READ, io::spu_read as usize);
        table.insert(symbols::SPU_WRITE, io::spu_write as usize);
        table.insert(symbols::SYS_FSYNC, io::sys_fsync as usize);
        table.insert(symbols::SYS_FDATASYNC, io::sys_fdatasync as usize);
        table.insert(symbols::SYS_SYNC, io::sys_sync as usize);
        table
    };
}

/// Binds a guest import by name.
pub fn resolve_symbol(name: &str) -> Option<usize> {
    SYMBOL_TABLE.get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_abi_symbol_resolves() {
        for name in storpu_abi::symbols::ALL {
            assert!(
                resolve_symbol(name).is_some(),
                "unresolved guest symbol {name}"
            );
        }
        assert!(resolve_symbol("sys_fork").is_none());
    }
}
