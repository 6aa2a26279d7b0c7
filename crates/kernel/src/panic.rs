//! Firmware panic path.
//!
//! A panic is a broken kernel invariant; the core prints a diagnostic and
//! halts, leaving the rest of the system to be brought down externally.
//! Host builds use the standard library's panic machinery instead.

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::logln!("\x1B[91mkernel panic on cpu {}:\x1B[0m {}", crate::smp::cpu_id(), info);
    crate::arch::halt()
}
