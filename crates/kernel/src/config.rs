//! Compile-time board facts.

use crate::memory::PhysAddr;

/// Number of compute cores the scheduler multiplexes.
pub const NR_CPUS: usize = 4;

/// Flash page size; also the huge-page cache line for flash-backed files.
pub const FLASH_PG_SIZE: usize = 16 * 1024;

/// Number of flash namespaces exposed as non-negative fds.
pub const FILE_MAX: usize = 8;

/// Size of the on-chip scratchpad buffer.
pub const SCRATCHPAD_SIZE: usize = 64 * 1024;

/// Minimum (and default) guest thread stack size.
pub const THREAD_STACK_MIN: usize = 0x2000;

/// Stack recycling pool cap per the thread module.
pub const MAX_FREE_STACKS: usize = 128;

/// DDR window reachable by the low-address DMA engines.
pub const ZONE_LOW_DDR: (PhysAddr, PhysAddr) =
    (PhysAddr::from_bits(0x0010_0000), PhysAddr::from_bits(0x2000_0000));

/// The rest of the PS-side DDR.
pub const ZONE_HIGH_DDR: (PhysAddr, PhysAddr) =
    (PhysAddr::from_bits(0x2000_0000), PhysAddr::from_bits(0x8000_0000));

/// PL-side DDR, behind the fabric.
pub const ZONE_PL_DDR: (PhysAddr, PhysAddr) = (
    PhysAddr::from_bits(0x10_0000_0000),
    PhysAddr::from_bits(0x10_8000_0000),
);

/// Bottom of guest user space.
pub const VM_USER_START: usize = 0x0000_0040_0000;

/// Ceiling below which mappings are placed, searching downward.
pub const VM_USER_TOP: usize = 0x0060_0000_0000;
