//! Fixed-slot per-cpu storage.
//!
//! One value per possible cpu, selected by [`crate::arch::cpu_id`]. The
//! remote accessor is deliberately available: cross-cpu paths (wake-ups,
//! migration) need the other cpu's slot and take whatever lock the slot
//! type carries.

use crate::config::NR_CPUS;
use crate::smp::cpu_id;

pub struct CpuLocal<T> {
    slots: [T; NR_CPUS],
}

impl<T> CpuLocal<T> {
    pub fn from_fn(mut f: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: core::array::from_fn(|i| f(i)),
        }
    }

    /// This cpu's slot.
    #[inline(always)]
    pub fn get(&self) -> &T {
        &self.slots[cpu_id()]
    }

    /// A specific cpu's slot.
    #[inline(always)]
    pub fn cpu(&self, cpu: usize) -> &T {
        &self.slots[cpu]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}
