//! Byte layouts of the fixed-length CDBs.

/// CDB operation codes (SPC-2 7.1) for the commands the scheduler issues.
#[repr(u8)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x0,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SBC-2 5.1.10, table 27
    ReadCapacity = 0x25,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SBC-2 5.1.21
    Write10 = 0x2a,
    /// SBC-2 5.1.8
    Read16 = 0x88,
}

/// Fixed-length CDB layouts, SPC-2 4.3.2.
pub trait CommandDescriptor {
    /// Encoded length in bytes.
    const LEN: usize;

    /// Writes the CDB into the front of `out`.
    fn encode(&self, out: &mut [u8]);
}

/// 6-byte CDB, SPC-2 table 1.
#[derive(Clone, Debug)]
pub struct X6CommandDescriptor {
    pub operation_code: OpCode,
    /// 21-bit address, top 3 bits reserved. Unused by most 6-byte commands.
    pub logical_block_address: [u8; 3],
    /// `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`
    /// depending on the opcode.
    pub misc_len: u8,
    pub control: u8,
}

impl CommandDescriptor for X6CommandDescriptor {
    const LEN: usize = 6;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.operation_code as u8;
        out[1..4].copy_from_slice(&self.logical_block_address);
        out[4] = self.misc_len;
        out[5] = self.control;
    }
}

/// 10-byte CDB, SPC-2 table 2. Multi-byte fields are big endian.
#[derive(Clone, Debug)]
pub struct X10CommandDescriptor {
    pub operation_code: OpCode,
    /// Low 5 bits select a service action where the opcode has several.
    pub service_action: u8,
    pub logical_block_address: [u8; 4],
    /// Bits 4:0 carry the `GROUP NUMBER`.
    pub group_number: u8,
    pub misc_len: [u8; 2],
    pub control: u8,
}

impl CommandDescriptor for X10CommandDescriptor {
    const LEN: usize = 10;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.operation_code as u8;
        out[1] = self.service_action;
        out[2..6].copy_from_slice(&self.logical_block_address);
        out[6] = self.group_number;
        out[7..9].copy_from_slice(&self.misc_len);
        out[9] = self.control;
    }
}

/// 16-byte CDB, SPC-2 table 4.
#[derive(Clone, Debug)]
pub struct X16CommandDescriptor {
    pub operation_code: OpCode,
    pub misc_info: u8,
    pub logical_block_address: [u8; 8],
    pub param: [u8; 4],
    pub group_number: u8,
    pub control: u8,
}

impl CommandDescriptor for X16CommandDescriptor {
    const LEN: usize = 16;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.operation_code as u8;
        out[1] = self.misc_info;
        out[2..10].copy_from_slice(&self.logical_block_address);
        out[10..14].copy_from_slice(&self.param);
        out[14] = self.group_number;
        out[15] = self.control;
    }
}
