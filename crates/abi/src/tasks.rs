//! Task records exchanged between the FTL core and the StorPU cores.
//!
//! Both directions use the same discipline: one-shot records threaded
//! through an intrusive lock-free singly-linked list (`llist_next` is the
//! link word), pushed with a compare-and-swap of the list head and drained
//! with an atomic swap followed by a reversal to recover FIFO order. All
//! fields are little-endian in shared memory.

use core::sync::atomic::AtomicU64;

/// FTL -> StorPU request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StorpuTaskKind {
    CreateContext = 1,
    DeleteContext = 2,
    Invoke = 3,
}

impl TryFrom<i32> for StorpuTaskKind {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, i32> {
        match value {
            1 => Ok(Self::CreateContext),
            2 => Ok(Self::DeleteContext),
            3 => Ok(Self::Invoke),
            other => Err(other),
        }
    }
}

/// StorPU -> FTL request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FtlTaskKind {
    FlashRead = 1,
    FlashWrite = 2,
    HostRead = 3,
    HostWrite = 4,
    Flush = 5,
    FlushData = 6,
    Sync = 7,
}

impl TryFrom<i32> for FtlTaskKind {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, i32> {
        match value {
            1 => Ok(Self::FlashRead),
            2 => Ok(Self::FlashWrite),
            3 => Ok(Self::HostRead),
            4 => Ok(Self::HostWrite),
            5 => Ok(Self::Flush),
            6 => Ok(Self::FlushData),
            7 => Ok(Self::Sync),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CreateContextPayload {
    /// Shared-object image address in a host-visible buffer.
    pub so_addr: u64,
    /// Filled in by the runtime: the new context id.
    pub cid: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DeleteContextPayload {
    pub cid: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InvokePayload {
    pub cid: u32,
    /// Guest virtual address of the entry function.
    pub entry: u64,
    /// Argument passed to the entry function.
    pub arg: u64,
    /// Filled in by the runtime: the entry function's return value.
    pub result: u64,
}

#[repr(C)]
pub union StorpuPayload {
    pub create_context: CreateContextPayload,
    pub delete_context: DeleteContextPayload,
    pub invoke: InvokePayload,
}

/// A context-lifecycle or invocation request from the FTL core.
///
/// The record lives in shared memory owned by the submitter; `opaque` is the
/// submitter's waiter cookie and is never interpreted by the consumer.
#[repr(C)]
pub struct StorpuTask {
    pub llist_next: AtomicU64,
    pub kind: i32,
    pub retval: i32,
    pub payload: StorpuPayload,
    pub opaque: u64,
}

impl StorpuTask {
    pub fn new_create_context(so_addr: u64) -> Self {
        Self {
            llist_next: AtomicU64::new(0),
            kind: StorpuTaskKind::CreateContext as i32,
            retval: 0,
            payload: StorpuPayload {
                create_context: CreateContextPayload { so_addr, cid: 0 },
            },
            opaque: 0,
        }
    }

    pub fn new_delete_context(cid: u32) -> Self {
        Self {
            llist_next: AtomicU64::new(0),
            kind: StorpuTaskKind::DeleteContext as i32,
            retval: 0,
            payload: StorpuPayload {
                delete_context: DeleteContextPayload { cid },
            },
            opaque: 0,
        }
    }

    pub fn new_invoke(cid: u32, entry: u64, arg: u64) -> Self {
        Self {
            llist_next: AtomicU64::new(0),
            kind: StorpuTaskKind::Invoke as i32,
            retval: 0,
            payload: StorpuPayload {
                invoke: InvokePayload {
                    cid,
                    entry,
                    arg,
                    result: 0,
                },
            },
            opaque: 0,
        }
    }

    pub fn kind(&self) -> Result<StorpuTaskKind, i32> {
        StorpuTaskKind::try_from(self.kind)
    }
}

/// A flash/host I/O or synchronization request bound for the FTL core.
#[repr(C)]
pub struct FtlTask {
    pub llist_next: AtomicU64,
    pub kind: i32,
    /// Cpu index of the submitting StorPU core.
    pub src_cpu: i32,
    pub retval: i32,
    /// Flash namespace for flash access; unused otherwise.
    pub nsid: u32,
    /// Physical address of the I/O buffer. The StorPU user address space is
    /// not mapped on the FTL core, so virtual addresses cannot cross here.
    pub buf_phys: u64,
    /// Target of the I/O: file offset, LPA or host memory address.
    pub addr: u64,
    pub count: u64,
    pub opaque: u64,
}

impl FtlTask {
    pub fn new(kind: FtlTaskKind, src_cpu: i32) -> Self {
        Self {
            llist_next: AtomicU64::new(0),
            kind: kind as i32,
            src_cpu,
            retval: 0,
            nsid: 0,
            buf_phys: 0,
            addr: 0,
            count: 0,
            opaque: 0,
        }
    }

    pub fn kind(&self) -> Result<FtlTaskKind, i32> {
        FtlTaskKind::try_from(self.kind)
    }
}
