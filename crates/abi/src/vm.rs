//! Mapping flags and protection bits as guests pass them to `sys_mmap` and
//! friends. The values are part of the compiled-guest ABI and must not move.

pub const PROT_NONE: u32 = 0x00;
pub const PROT_READ: u32 = 0x01;
pub const PROT_WRITE: u32 = 0x02;
pub const PROT_EXEC: u32 = 0x04;

/// Share changes with other mappings of the same object.
pub const MAP_SHARED: u32 = 0x01;
/// Changes are private to this mapping.
pub const MAP_PRIVATE: u32 = 0x02;
pub const MAP_ANONYMOUS: u32 = 0x04;
pub const MAP_FIXED: u32 = 0x08;
/// Fault the whole range in at map time.
pub const MAP_POPULATE: u32 = 0x10;
/// Physically contiguous backing, preallocated.
pub const MAP_CONTIG: u32 = 0x20;

pub const MS_ASYNC: u32 = 1;
pub const MS_INVALIDATE: u32 = 2;
pub const MS_SYNC: u32 = 4;

/// Error indicator returned by `sys_mmap`.
pub const MAP_FAILED: usize = usize::MAX;
