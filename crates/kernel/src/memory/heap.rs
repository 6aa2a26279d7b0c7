//! The kernel heap.
//!
//! A first-fit free list growing in 64 KiB slabs taken from the frame
//! allocator through the linear mapping. The list is kept in address
//! order and every free fuses the block with its neighbors, so churny
//! small allocations cannot shred a slab permanently. Only the firmware
//! image carries it; host builds use the platform allocator.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use core::alloc::{GlobalAlloc, Layout};

use crate::utils::locks::{SpinLock, spinlock};

use super::{
    VirtAddr, align_up,
    frame_allocator::{self, ZoneSet},
    paging::PAGE_SIZE,
};

const GROW_PAGES: usize = 16;
const MIN_BLOCK: usize = core::mem::size_of::<FreeBlock>();

struct FreeBlock {
    size: usize,
    next: Option<*mut FreeBlock>,
}

struct Heap {
    /// Free blocks in ascending address order.
    free: Option<*mut FreeBlock>,
}

unsafe impl Send for Heap {}

impl Heap {
    const fn new() -> Self {
        Self { free: None }
    }

    /// Returns `[addr, addr + size)` to the list, fusing with the
    /// neighbor on either side when they touch.
    unsafe fn insert(&mut self, addr: VirtAddr, size: usize) {
        debug_assert!(size >= MIN_BLOCK);
        let start = addr.into_raw();

        let mut cursor: *mut Option<*mut FreeBlock> = &mut self.free;
        unsafe {
            while let Some(block) = *cursor {
                if block as usize > start {
                    break;
                }

                // The immediate predecessor ends exactly here: grow it,
                // then check whether the grown block now reaches its
                // successor too.
                if block as usize + (*block).size == start {
                    (*block).size += size;

                    if let Some(next) = (*block).next
                        && block as usize + (*block).size == next as usize
                    {
                        (*block).size += (*next).size;
                        (*block).next = (*next).next;
                    }
                    return;
                }

                cursor = &raw mut (*block).next;
            }

            // No predecessor to grow; link a fresh block here, swallowing
            // an adjacent successor.
            let next = *cursor;
            let block = addr.into_ptr::<FreeBlock>();
            (*block).size = size;
            (*block).next = next;

            if let Some(next) = next
                && start + size == next as usize
            {
                (*block).size += (*next).size;
                (*block).next = (*next).next;
            }

            *cursor = Some(block);
        }
    }

    fn grow(&mut self) -> bool {
        match frame_allocator::alloc_vmpages(GROW_PAGES, ZoneSet::DDR) {
            Some(addr) => {
                unsafe { self.insert(addr, GROW_PAGES * PAGE_SIZE) };
                true
            }
            None => false,
        }
    }

    fn allocate(&mut self, layout: Layout) -> *mut u8 {
        let size = align_up(layout.size().max(MIN_BLOCK), MIN_BLOCK);
        let align = layout.align();

        let mut cursor: *mut Option<*mut FreeBlock> = &mut self.free;
        unsafe {
            while let Some(block) = *cursor {
                let start = block as usize;
                let block_size = (*block).size;
                let aligned = align_up(start, align);
                let pad = aligned - start;

                if pad == 0 && block_size >= size {
                    *cursor = (*block).next;
                    let remainder = block_size - size;
                    if remainder >= MIN_BLOCK {
                        self.insert(VirtAddr::from_bits(start + size), remainder);
                    }
                    return start as *mut u8;
                }

                // Misaligned head: carve the aligned middle out when the
                // leading pad can stand as a block of its own.
                if pad >= MIN_BLOCK && block_size >= pad + size {
                    (*block).size = pad;
                    let remainder = block_size - pad - size;
                    if remainder >= MIN_BLOCK {
                        self.insert(VirtAddr::from_bits(aligned + size), remainder);
                    }
                    return aligned as *mut u8;
                }

                cursor = &raw mut (*block).next;
            }
        }

        core::ptr::null_mut()
    }

    unsafe fn deallocate(&mut self, ptr: *mut u8, layout: Layout) {
        let size = align_up(layout.size().max(MIN_BLOCK), MIN_BLOCK);
        unsafe { self.insert(VirtAddr::from_ptr(ptr), size) };
    }
}

pub struct KernelHeap {
    inner: SpinLock<Heap>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            inner: spinlock(Heap::new()),
        }
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.inner.lock();
        let ptr = heap.allocate(layout);
        if !ptr.is_null() {
            return ptr;
        }
        if !heap.grow() {
            return core::ptr::null_mut();
        }
        heap.allocate(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.lock().deallocate(ptr, layout) };
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[global_allocator]
static KERNEL_HEAP: KernelHeap = KernelHeap::new();
