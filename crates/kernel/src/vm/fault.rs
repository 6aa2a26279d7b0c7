//! Guest access-fault policy.
//!
//! The architecture's abort handler decodes the access kind and lands
//! here. A fault no region rule can satisfy terminates the offending
//! guest thread; the context and its other threads continue.

use crate::thread;
use crate::vm::{self, FaultFlags, RegionFlags};

/// Entry from the abort handler. Returns once the fault is resolved and
/// the guest can resume; a fault nothing can satisfy does not return, the
/// offending thread is terminated instead.
pub fn handle_guest_fault(addr: usize, write: bool, instruction: bool) {
    if try_resolve_fault(addr, write, instruction, true) {
        return;
    }

    crate::warn!("terminating guest thread after unhandled fault at {addr:#x}");
    thread::exit(u64::MAX);
}

/// Fault resolution shared by the abort handler and kernel-driven
/// populate paths.
pub fn try_resolve_fault(addr: usize, write: bool, instruction: bool, user: bool) -> bool {
    let mut flags = FaultFlags::INTERRUPTIBLE;
    let required;

    if instruction {
        required = RegionFlags::EXEC;
        flags |= FaultFlags::INSTRUCTION;
    } else if write {
        required = RegionFlags::WRITE;
        flags |= FaultFlags::WRITE;
    } else {
        required = RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC;
    }

    if user {
        flags |= FaultFlags::USER;
    }

    let Some(ctx) = vm::current_context() else {
        panic!("memory abort at {addr:#x} with no user context installed");
    };

    ctx.handle_page_fault(addr, flags, required)
}
