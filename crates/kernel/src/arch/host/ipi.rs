//! Doorbells on the host are recorded instead of delivered, so tests can
//! assert on exactly which cross-core notifications a path produced.

use alloc::vec::Vec;

use crate::utils::locks::{SpinLock, spinlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentIpi {
    Reschedule { cpu: usize },
    FtlCompletion,
}

static SENT: SpinLock<Vec<SentIpi>> = spinlock(Vec::new());

pub fn send_reschedule(cpu: usize) {
    SENT.lock().push(SentIpi::Reschedule { cpu });
}

pub fn send_ftl_completion() {
    SENT.lock().push(SentIpi::FtlCompletion);
}

/// Drains and returns every doorbell sent since the last call. Test hook.
pub fn take_sent() -> Vec<SentIpi> {
    core::mem::take(&mut *SENT.lock())
}
