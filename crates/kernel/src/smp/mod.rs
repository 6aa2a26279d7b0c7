//! Multi-core plumbing: cpu identification, per-cpu storage, cpu masks and
//! the IPI dispatch table.

pub mod cpulocals;
pub mod cpumask;
pub mod ipi;

pub use cpulocals::CpuLocal;
pub use cpumask::CpuMask;

pub use crate::arch::cpu_id;
pub use crate::config::NR_CPUS;

static CPU_ONLINE: CpuMask = CpuMask::empty();

/// Marks `cpu` online or offline for scheduling purposes.
pub fn set_cpu_online(cpu: usize, online: bool) {
    if online {
        CPU_ONLINE.set(cpu);
    } else {
        CPU_ONLINE.clear(cpu);
    }
}

pub fn cpu_online(cpu: usize) -> bool {
    CPU_ONLINE.test(cpu)
}

pub fn cpu_online_mask() -> &'static CpuMask {
    &CPU_ONLINE
}
