//! SCSI commands as the scheduler carries them to a target port.
//!
//! Each command becomes one FCP initiator IOCB: the CDB rides in the IOCB
//! payload, the data direction picks the opcode, and the response IOCB is
//! folded back into a [`ScsiCompletion`]. Command layouts follow SPC-2 and
//! SBC-2; status codes follow SAM-2.

pub mod command;
mod command_descriptor;
pub mod response;

use crate::sli::iocb::Iocb;

pub use command::{CommandBlock, DataDirection};
pub use command_descriptor::OpCode;
pub use response::{ScsiCompletion, ScsiStatus};

/// A SCSI command addressed to one logical unit of one target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScsiCommand {
    pub target: u16,
    pub lun: u16,
    pub block: CommandBlock,
    /// Dispatched ahead of all normal work and not counted against any
    /// queue depth.
    pub high_priority: bool,
}

impl ScsiCommand {
    pub fn new(target: u16, lun: u16, block: CommandBlock) -> Self {
        Self {
            target,
            lun,
            block,
            high_priority: false,
        }
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    /// Builds the FCP initiator IOCB for this command. `context` is the
    /// routing tag of the remote port.
    pub fn to_iocb(&self, context: u16) -> Iocb {
        let mut iocb = Iocb::command(self.block.direction.iocb_command());
        iocb.set_payload_bytes(&self.block.get());
        iocb.target = self.target;
        iocb.lun = self.lun;
        iocb.context = context;
        iocb.data_len = self.block.data_transfer_len;
        iocb
    }
}
