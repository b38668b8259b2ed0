//! Attention register bits.
//!
//! The host attention register (HA) is written by the adapter and read by the
//! host; the chip attention register (CA) is the host's doorbell. Both use four
//! bits per ring followed by the adapter-wide bits at the top.

use bitflags::bitflags;

bitflags! {
    /// Host attention register (adapter to host).
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct HostAttention: u32 {
        /// Ring 0 response ring has new entries.
        const R0RE_REQ = 0x0000_0001;
        /// Ring 0 command ring has room again (answer to `CA_R0CE_REQ`).
        const R0CE_RSP = 0x0000_0002;
        /// Any ring 0 attention.
        const R0ATT = 0x0000_0008;
        const R1RE_REQ = 0x0000_0010;
        const R1CE_RSP = 0x0000_0020;
        const R1ATT = 0x0000_0080;
        const R2RE_REQ = 0x0000_0100;
        const R2CE_RSP = 0x0000_0200;
        const R2ATT = 0x0000_0800;
        const R3RE_REQ = 0x0000_1000;
        const R3CE_RSP = 0x0000_2000;
        const R3ATT = 0x0000_8000;
        /// Link state changed.
        const LATT = 0x2000_0000;
        /// Mailbox command completed.
        const MBATT = 0x4000_0000;
        /// Unrecoverable adapter error.
        const ERATT = 0x8000_0000;
    }
}

bitflags! {
    /// Chip attention register (host to adapter doorbell).
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ChipAttention: u32 {
        /// Ask the adapter to report when ring 0 command ring has room.
        const R0CE_REQ = 0x0000_0001;
        /// Host consumed ring 0 response entries.
        const R0RE_RSP = 0x0000_0002;
        /// Ring 0 command put index moved.
        const R0ATT = 0x0000_0008;
        const R1CE_REQ = 0x0000_0010;
        const R1RE_RSP = 0x0000_0020;
        const R1ATT = 0x0000_0080;
        const R2CE_REQ = 0x0000_0100;
        const R2RE_RSP = 0x0000_0200;
        const R2ATT = 0x0000_0800;
        const R3CE_REQ = 0x0000_1000;
        const R3RE_RSP = 0x0000_2000;
        const R3ATT = 0x0000_8000;
        /// Mailbox command posted.
        const MBATT = 0x4000_0000;
    }
}

const fn ring_shift(ringno: usize) -> u32 {
    4 * ringno as u32
}

impl HostAttention {
    pub const fn response_event(ringno: usize) -> Self {
        Self::from_bits_retain(Self::R0RE_REQ.bits() << ring_shift(ringno))
    }

    pub const fn ring_available(ringno: usize) -> Self {
        Self::from_bits_retain(Self::R0CE_RSP.bits() << ring_shift(ringno))
    }

    pub const fn ring_attention(ringno: usize) -> Self {
        Self::from_bits_retain(Self::R0ATT.bits() << ring_shift(ringno))
    }

    /// All bits belonging to one ring.
    pub const fn ring_bits(ringno: usize) -> Self {
        Self::from_bits_retain(0xf << ring_shift(ringno))
    }
}

impl ChipAttention {
    pub const fn ring_available_request(ringno: usize) -> Self {
        Self::from_bits_retain(Self::R0CE_REQ.bits() << ring_shift(ringno))
    }

    pub const fn response_consumed(ringno: usize) -> Self {
        Self::from_bits_retain(Self::R0RE_RSP.bits() << ring_shift(ringno))
    }

    pub const fn command_posted(ringno: usize) -> Self {
        Self::from_bits_retain(Self::R0ATT.bits() << ring_shift(ringno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_ring_bits_shift_by_four() {
        assert_eq!(HostAttention::response_event(1), HostAttention::R1RE_REQ);
        assert_eq!(HostAttention::ring_available(3), HostAttention::R3CE_RSP);
        assert_eq!(ChipAttention::command_posted(2), ChipAttention::R2ATT);
        assert_eq!(
            ChipAttention::ring_available_request(1),
            ChipAttention::R1CE_REQ
        );
        assert!(HostAttention::ring_bits(2).contains(HostAttention::R2RE_REQ));
        assert!(!HostAttention::ring_bits(2).contains(HostAttention::R1RE_REQ));
    }
}
