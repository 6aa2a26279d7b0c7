//! IPI numbering and dispatch.
//!
//! The arch layer delivers doorbells here. A reschedule IPI carries no
//! payload: its whole effect is the interrupt return path falling back
//! into `schedule()`. The completion IPI drains the StorPU completion
//! queue on the FTL core.

use crate::tasks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IpiMsg {
    Reschedule = 0,
    StorpuCompletion = 1,
}

impl TryFrom<u32> for IpiMsg {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(Self::Reschedule),
            1 => Ok(Self::StorpuCompletion),
            other => Err(other),
        }
    }
}

/// Entry point for the interrupt glue.
pub fn handle(msg: IpiMsg) {
    match msg {
        IpiMsg::Reschedule => {}
        IpiMsg::StorpuCompletion => tasks::handle_storpu_completion(),
    }
}
