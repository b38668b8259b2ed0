//! Representations for responses to SCSI commands.

use crate::sli::iocb::{Iocb, IoStatus};

/// SAM-2 5.3.1, table 22: status codes returned by a device server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScsiStatus {
    Good,
    CheckCondition,
    Busy,
    ReservationConflict,
    /// `TASK SET FULL`: the logical unit has no room for another task.
    TaskSetFull,
    TaskAborted,
    Other(u8),
}

impl ScsiStatus {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => ScsiStatus::Good,
            0x02 => ScsiStatus::CheckCondition,
            0x08 => ScsiStatus::Busy,
            0x18 => ScsiStatus::ReservationConflict,
            0x28 => ScsiStatus::TaskSetFull,
            0x40 => ScsiStatus::TaskAborted,
            other => ScsiStatus::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            ScsiStatus::Good => 0x00,
            ScsiStatus::CheckCondition => 0x02,
            ScsiStatus::Busy => 0x08,
            ScsiStatus::ReservationConflict => 0x18,
            ScsiStatus::TaskSetFull => 0x28,
            ScsiStatus::TaskAborted => 0x40,
            ScsiStatus::Other(raw) => raw,
        }
    }
}

/// Final result of a SCSI command handed to its submitter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScsiCompletion {
    /// Transport level outcome.
    pub status: IoStatus,
    /// Status qualifier, only meaningful for local rejects.
    pub qualifier: u32,
    /// Bytes of the data phase that were not transferred.
    pub residual: u32,
    pub scsi_status: ScsiStatus,
}

impl ScsiCompletion {
    pub fn from_response(rsp: &Iocb) -> Self {
        let status = rsp.io_status();
        Self {
            status,
            qualifier: if status == IoStatus::Success {
                0
            } else {
                rsp.parameter
            },
            residual: rsp.residual,
            scsi_status: ScsiStatus::from_raw(rsp.scsi_status),
        }
    }

    /// A completion produced by the host without the adapter.
    pub fn local(status: IoStatus, qualifier: u32) -> Self {
        Self {
            status,
            qualifier,
            residual: 0,
            scsi_status: ScsiStatus::Good,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == IoStatus::Success && self.scsi_status == ScsiStatus::Good
    }

    /// The target reported `TASK SET FULL`.
    pub fn is_queue_full(&self) -> bool {
        self.scsi_status == ScsiStatus::TaskSetFull
    }
}
