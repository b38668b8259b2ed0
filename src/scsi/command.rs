//! Representations for SCSI commands.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular descriptor structs.

use super::command_descriptor::*;
use crate::sli::iocb::IocbCommand;

/// Largest CDB an FCP command carries.
pub const MAX_CDB_SIZE: usize = 16;

/// Direction of the data phase, seen from the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataDirection {
    /// Data-Out: from host to the logical unit
    DataOut,
    /// Data-In: from the logical unit to the host
    DataIn,
    /// No data phase.
    None,
}

impl DataDirection {
    /// FCP initiator IOCB that carries a command with this data phase.
    pub fn iocb_command(self) -> IocbCommand {
        match self {
            DataDirection::DataOut => IocbCommand::FcpIwriteCr,
            DataDirection::DataIn => IocbCommand::FcpIreadCr,
            DataDirection::None => IocbCommand::FcpIcmndCr,
        }
    }
}

/// A serialized command block ready to be submitted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBlock {
    command: [u8; MAX_CDB_SIZE],
    len: u8,
    pub direction: DataDirection,
    pub data_transfer_len: u32,
}

impl CommandBlock {
    fn from_descriptor<D: CommandDescriptor>(
        descriptor: &D,
        direction: DataDirection,
        data_transfer_len: u32,
    ) -> Self {
        let mut command = [0; MAX_CDB_SIZE];
        descriptor.encode(&mut command[..D::LEN]);
        Self {
            command,
            len: D::LEN as u8,
            direction,
            data_transfer_len,
        }
    }

    /// Returns the length of the underlying command block.
    ///
    /// Will never be more than 16 bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn opcode(&self) -> u8 {
        self.command[0]
    }

    /// Returns the CDB zero padded to 16 bytes, the way the FCP command
    /// payload carries it.
    pub fn get(&self) -> [u8; MAX_CDB_SIZE] {
        self.command
    }
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready.
///
/// If the logical unit is able to accept an appropriate medium access command without
/// returning CHECK CONDITION status, this command shall return a GOOD status."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> CommandBlock {
    CommandBlock::from_descriptor(
        &X6CommandDescriptor {
            operation_code: OpCode::TestUnitReady,
            logical_block_address: [0, 0, 0],
            misc_len: 0,
            control: 0,
        },
        DataDirection::None,
        0,
    )
}

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client."
///
/// Defined in SPC2 7.3.1 table 45
pub fn inquiry() -> CommandBlock {
    CommandBlock::from_descriptor(
        &X6CommandDescriptor {
            operation_code: OpCode::Inquiry,
            logical_block_address: [0, 0, 0],
            // For inquiry, is ALLOCATION LENGTH,
            // "The standard INQUIRY data shall contain at least 36 bytes"
            // (table 46)
            misc_len: 36,
            control: 0,
        },
        DataDirection::DataIn,
        36,
    )
}

/// "The `READ CAPACITY` command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// SBC-2 5.1.10
pub fn read_capacity() -> CommandBlock {
    CommandBlock::from_descriptor(
        &X10CommandDescriptor {
            operation_code: OpCode::ReadCapacity,
            service_action: 0,
            logical_block_address: [0; 4],
            group_number: 0,
            misc_len: [0; 2],
            control: 0,
        },
        DataDirection::DataIn,
        8,
    )
}

/// READ (10), SBC-2 5.1.6. `blocks` of `block_size` bytes starting at `lba`.
pub fn read10(lba: u32, blocks: u16, block_size: u32) -> CommandBlock {
    CommandBlock::from_descriptor(
        &X10CommandDescriptor {
            operation_code: OpCode::Read10,
            service_action: 0,
            logical_block_address: lba.to_be_bytes(),
            group_number: 0,
            misc_len: blocks.to_be_bytes(),
            control: 0,
        },
        DataDirection::DataIn,
        u32::from(blocks) * block_size,
    )
}

/// WRITE (10), SBC-2 5.1.21.
pub fn write10(lba: u32, blocks: u16, block_size: u32) -> CommandBlock {
    CommandBlock::from_descriptor(
        &X10CommandDescriptor {
            operation_code: OpCode::Write10,
            service_action: 0,
            logical_block_address: lba.to_be_bytes(),
            group_number: 0,
            misc_len: blocks.to_be_bytes(),
            control: 0,
        },
        DataDirection::DataOut,
        u32::from(blocks) * block_size,
    )
}

/// READ (16), SBC-2 5.1.8, for addresses past what READ (10) reaches.
pub fn read16(lba: u64, blocks: u32, block_size: u32) -> CommandBlock {
    CommandBlock::from_descriptor(
        &X16CommandDescriptor {
            operation_code: OpCode::Read16,
            misc_info: 0,
            logical_block_address: lba.to_be_bytes(),
            param: blocks.to_be_bytes(),
            group_number: 0,
            control: 0,
        },
        DataDirection::DataIn,
        blocks.saturating_mul(block_size),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_block() {
        let cb = test_unit_ready();
        assert_eq!(cb.len(), 6);
        let mut serialized_cb = cb.get().into_iter();
        assert!(serialized_cb.next() == Some(0));
        assert!(serialized_cb.all(|b| b == 0));
    }

    #[test]
    fn read10_fields_are_big_endian() {
        let cb = read10(0x0102_0304, 8, 512);
        assert_eq!(cb.len(), 10);
        assert_eq!(
            &cb.get()[..10],
            &[0x28, 0, 0x01, 0x02, 0x03, 0x04, 0, 0, 8, 0]
        );
        assert_eq!(cb.data_transfer_len, 4096);
        assert_eq!(cb.direction.iocb_command(), IocbCommand::FcpIreadCr);
    }

    #[test]
    fn read16_fills_whole_cdb() {
        let cb = read16(1 << 40, 1, 4096);
        assert_eq!(cb.len(), MAX_CDB_SIZE);
        assert_eq!(cb.opcode(), 0x88);
        assert_eq!(cb.get()[2], 0x00);
        assert_eq!(cb.get()[4], 0x01);
        assert_eq!(cb.get()[13], 1);
    }
}
