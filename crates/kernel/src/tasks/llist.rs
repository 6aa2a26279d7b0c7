//! Intrusive lock-free singly-linked task lists.
//!
//! Producers push with a compare-and-swap of the head; the consumer swaps
//! the head to empty and reverses the chain to recover FIFO order. Nodes
//! are owned by their submitters and carry the link word themselves, so
//! the list allocates nothing and works across the shared-memory boundary
//! between cores.

use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

/// A record that carries its own link word.
pub trait LlistNode {
    fn llist_next(&self) -> &AtomicU64;
}

pub struct LlistHead<T> {
    head: AtomicU64,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for LlistHead<T> {}
unsafe impl<T> Sync for LlistHead<T> {}

impl<T: LlistNode> LlistHead<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// Pushes a node.
    ///
    /// # Safety
    /// `node` must stay valid and untouched by the submitter until a
    /// consumer hands it back; a node may sit on one list at a time.
    pub unsafe fn push(&self, node: *mut T) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*node).llist_next().store(head, Ordering::Relaxed) };

            match self.head.compare_exchange_weak(
                head,
                node as u64,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == 0
    }

    /// Takes the whole list in submission (FIFO) order.
    pub fn pop_all(&self) -> Vec<*mut T> {
        let mut node = self.head.swap(0, Ordering::Acquire) as *mut T;

        let mut items = Vec::new();
        while !node.is_null() {
            let next = unsafe { (*node).llist_next().load(Ordering::Relaxed) } as *mut T;
            items.push(node);
            node = next;
        }

        // The chain comes off the head newest-first.
        items.reverse();
        items
    }
}
