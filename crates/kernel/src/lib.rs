//! The StorPU execution runtime.
//!
//! An in-device operating-system core that lets the host offload
//! computations into the storage device. Guest computations run inside
//! isolated virtual address spaces on the ARM application cores, read and
//! write the attached flash through the FTL task channels, and are
//! multiplexed by a per-core round-robin scheduler.
//!
//! The crate is linked into the device firmware; SoC bring-up hands each
//! subsystem its board facts through the `init` entry points. On the host
//! the crate builds with a portable fallback architecture so the core can
//! be unit-tested off-device.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod debug;

pub mod arch;
pub mod config;
pub mod fs;
pub mod memory;
pub mod scheduler;
pub mod smp;
pub mod sync;
pub mod syscalls;
pub mod tasks;
pub mod thread;
pub mod time;
pub mod utils;
pub mod vm;

mod panic;

#[cfg(test)]
pub(crate) mod test_support;

pub use memory::PhysAddr;
pub use memory::VirtAddr;

use debug::Runtime;

/// Brings the shared (non-per-cpu) runtime state up. Called once by the
/// boot core after `memory::init`.
pub fn init() {
    vm::init();
    thread::init();
    scheduler::stop::init();
    debug!(Runtime, "core state initialized");
}

/// Per-cpu bring-up. Every compute core calls this on its own stack after
/// `init` has completed on the boot core.
pub fn init_cpu() {
    thread::init_cpu();
    scheduler::stop::init_cpu();
    smp::set_cpu_online(smp::cpu_id(), true);
    debug!(Runtime, "cpu {} online", smp::cpu_id());
}
