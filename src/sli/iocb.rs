//! I/O control blocks (IOCBs) and the host-side command descriptor wrapping them.
//!
//! An IOCB is the fixed size unit exchanged over a ring: the host writes
//! command IOCBs into the command ring, the adapter writes response IOCBs into
//! the response ring. Every IOCB is [`IOCB_WORDS`] little endian words.
//!
//! | Word  | Contents                                                    |
//! | ----- | ----------------------------------------------------------- |
//! | 0..=3 | Command payload (the CDB for FCP commands)                  |
//! | 4     | Parameter. Abort requests: iotag to abort. Responses: qualifier |
//! | 5     | Target (31:16), LUN (15:0)                                   |
//! | 6     | Context tag (31:16), iotag (15:0)                             |
//! | 7     | Command (31:24), status (23:16), class (15:8), last entry (0) |
//! | 8     | Data length                                                 |
//! | 9     | Residual                                                    |
//! | 10    | SCSI status (7:0)                                           |
//! | 11    | R_CTL (15:8), TYPE (7:0) of unsolicited frames              |
//! | 12..  | Reserved                                                    |

use std::fmt;
use std::time::Instant;

use bitflags::bitflags;
use color_eyre::eyre::ensure;

use super::Hba;

/// Number of 32 bit words in one IOCB.
pub const IOCB_WORDS: usize = 16;

/// Size of an IOCB on the wire.
pub const IOCB_SIZE: usize = IOCB_WORDS * 4;

/// IOCB command opcodes understood by the adapter firmware.
///
/// Opcodes ending in `Cr` are issued against a context that is created for the
/// exchange (command/response), `Cx` ones reuse an existing exchange and `Cn`
/// ones need none.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum IocbCommand {
    RcvSequenceCx = 0x01,
    XmitSequenceCr = 0x02,
    XmitSequenceCx = 0x03,
    XmitBcastCn = 0x04,
    QueRingBufCn = 0x06,
    ElsRequestCr = 0x0a,
    ElsRequestCx = 0x0b,
    RcvElsReqCx = 0x0d,
    AbortXriCn = 0x0e,
    AbortXriCx = 0x0f,
    CloseXriCn = 0x10,
    CloseXriCx = 0x11,
    CreateXriCr = 0x12,
    XmitElsRspCx = 0x15,
    XriAbortedCx = 0x17,
    FcpIwriteCr = 0x18,
    FcpIwriteCx = 0x19,
    FcpIreadCr = 0x1a,
    FcpIreadCx = 0x1b,
    FcpIcmndCr = 0x1c,
    FcpIcmndCx = 0x1d,
    AdapterMsg = 0x20,
    GenRequestCr = 0x62,
}

impl IocbCommand {
    pub fn from_raw(raw: u8) -> Option<Self> {
        use IocbCommand::*;
        let cmd = match raw {
            0x01 => RcvSequenceCx,
            0x02 => XmitSequenceCr,
            0x03 => XmitSequenceCx,
            0x04 => XmitBcastCn,
            0x06 => QueRingBufCn,
            0x0a => ElsRequestCr,
            0x0b => ElsRequestCx,
            0x0d => RcvElsReqCx,
            0x0e => AbortXriCn,
            0x0f => AbortXriCx,
            0x10 => CloseXriCn,
            0x11 => CloseXriCx,
            0x12 => CreateXriCr,
            0x15 => XmitElsRspCx,
            0x17 => XriAbortedCx,
            0x18 => FcpIwriteCr,
            0x19 => FcpIwriteCx,
            0x1a => FcpIreadCr,
            0x1b => FcpIreadCx,
            0x1c => FcpIcmndCr,
            0x1d => FcpIcmndCx,
            0x20 => AdapterMsg,
            0x62 => GenRequestCr,
            _ => return None,
        };
        Some(cmd)
    }

    /// Commands that may be issued before the adapter is ready for I/O.
    pub fn is_bootstrap(self) -> bool {
        matches!(
            self,
            IocbCommand::QueRingBufCn | IocbCommand::AbortXriCn | IocbCommand::CloseXriCn
        )
    }

    pub fn is_abort(self) -> bool {
        matches!(
            self,
            IocbCommand::AbortXriCn
                | IocbCommand::AbortXriCx
                | IocbCommand::CloseXriCn
                | IocbCommand::CloseXriCx
        )
    }
}

/// How a response IOCB is routed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IocbType {
    /// Completion of a command the host issued.
    Solicited,
    /// A frame the remote side sent on its own.
    Unsolicited,
    /// Acknowledgement of an abort or close request.
    AbortAck,
    Unknown,
}

impl IocbType {
    pub fn classify(raw: u8) -> Self {
        use IocbCommand::*;
        match IocbCommand::from_raw(raw) {
            Some(RcvSequenceCx | RcvElsReqCx) => IocbType::Unsolicited,
            Some(AbortXriCn | AbortXriCx | CloseXriCn | CloseXriCx | XriAbortedCx) => {
                IocbType::AbortAck
            }
            Some(
                XmitSequenceCr | XmitSequenceCx | XmitBcastCn | QueRingBufCn | ElsRequestCr
                | ElsRequestCx | CreateXriCr | XmitElsRspCx | FcpIwriteCr | FcpIwriteCx
                | FcpIreadCr | FcpIreadCx | FcpIcmndCr | FcpIcmndCx | AdapterMsg
                | GenRequestCr,
            ) => IocbType::Solicited,
            None => IocbType::Unknown,
        }
    }
}

/// Completion status of an IOCB.
///
/// Everything up to `BaRjt` is reported by the adapter, `DriverReject` is only
/// ever produced by the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IoStatus {
    Success,
    FcpRspError,
    RemoteStop,
    LocalReject,
    NportRjt,
    FabricRjt,
    NportBsy,
    FabricBsy,
    IntermedRsp,
    LsRjt,
    BaRjt,
    DriverReject,
    Other(u8),
}

impl IoStatus {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x0 => IoStatus::Success,
            0x1 => IoStatus::FcpRspError,
            0x2 => IoStatus::RemoteStop,
            0x3 => IoStatus::LocalReject,
            0x4 => IoStatus::NportRjt,
            0x5 => IoStatus::FabricRjt,
            0x6 => IoStatus::NportBsy,
            0x7 => IoStatus::FabricBsy,
            0x8 => IoStatus::IntermedRsp,
            0x9 => IoStatus::LsRjt,
            0xa => IoStatus::BaRjt,
            0x10 => IoStatus::DriverReject,
            other => IoStatus::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            IoStatus::Success => 0x0,
            IoStatus::FcpRspError => 0x1,
            IoStatus::RemoteStop => 0x2,
            IoStatus::LocalReject => 0x3,
            IoStatus::NportRjt => 0x4,
            IoStatus::FabricRjt => 0x5,
            IoStatus::NportBsy => 0x6,
            IoStatus::FabricBsy => 0x7,
            IoStatus::IntermedRsp => 0x8,
            IoStatus::LsRjt => 0x9,
            IoStatus::BaRjt => 0xa,
            IoStatus::DriverReject => 0x10,
            IoStatus::Other(other) => other,
        }
    }
}

/// Qualifiers carried in the parameter word of `LocalReject` and
/// `DriverReject` completions.
pub mod ioerr {
    pub const NO_RESOURCES: u32 = 0x11;
    pub const ABORT_REQUESTED: u32 = 0x1a;
    /// The adapter went down underneath the command.
    pub const SLI_DOWN: u32 = 0x101;
    /// The command was flushed by a board reset.
    pub const SLI_BRESET: u32 = 0x102;
    /// The command was aborted by the host.
    pub const SLI_ABORTED: u32 = 0x103;
}

/// A single IOCB in host representation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Iocb {
    /// Command specific payload. FCP commands carry the CDB here.
    pub payload: [u32; 4],
    /// Abort requests carry the iotag to abort, responses the completion
    /// qualifier.
    pub parameter: u32,
    pub target: u16,
    pub lun: u16,
    /// Exchange context tag. For FCP commands this is the routing tag of the
    /// remote port.
    pub context: u16,
    /// Host assigned tag, echoed back in the response.
    pub iotag: u16,
    /// Raw command opcode, see [`IocbCommand`].
    pub command: u8,
    /// Raw completion status, see [`IoStatus`].
    pub status: u8,
    /// Fibre Channel class of service.
    pub class: u8,
    /// Set on the final entry of a multi-entry exchange.
    pub last_entry: bool,
    pub data_len: u32,
    pub residual: u32,
    pub scsi_status: u8,
    pub rctl: u8,
    pub fc_type: u8,
}

impl Iocb {
    /// A single-entry command IOCB.
    pub fn command(command: IocbCommand) -> Self {
        Self {
            command: command as u8,
            class: 3,
            last_entry: true,
            ..Default::default()
        }
    }

    pub fn opcode(&self) -> Option<IocbCommand> {
        IocbCommand::from_raw(self.command)
    }

    pub fn io_status(&self) -> IoStatus {
        IoStatus::from_raw(self.status)
    }

    pub fn set_io_status(&mut self, status: IoStatus, qualifier: u32) {
        self.status = status.raw();
        self.parameter = qualifier;
    }

    /// Packs `bytes` (up to 16) into the payload words.
    pub fn set_payload_bytes(&mut self, bytes: &[u8]) {
        let mut buf = [0u8; 16];
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        for (word, chunk) in self.payload.iter_mut().zip(buf.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    pub fn payload_bytes(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        for (chunk, word) in buf.chunks_exact_mut(4).zip(self.payload) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        buf
    }

    pub fn to_words(&self) -> [u32; IOCB_WORDS] {
        let mut w = [0u32; IOCB_WORDS];
        w[..4].copy_from_slice(&self.payload);
        w[4] = self.parameter;
        w[5] = (u32::from(self.target) << 16) | u32::from(self.lun);
        w[6] = (u32::from(self.context) << 16) | u32::from(self.iotag);
        w[7] = (u32::from(self.command) << 24)
            | (u32::from(self.status) << 16)
            | (u32::from(self.class) << 8)
            | u32::from(self.last_entry);
        w[8] = self.data_len;
        w[9] = self.residual;
        w[10] = u32::from(self.scsi_status);
        w[11] = (u32::from(self.rctl) << 8) | u32::from(self.fc_type);
        w
    }

    pub fn from_words(w: &[u32; IOCB_WORDS]) -> Self {
        Self {
            payload: [w[0], w[1], w[2], w[3]],
            parameter: w[4],
            target: (w[5] >> 16) as u16,
            lun: w[5] as u16,
            context: (w[6] >> 16) as u16,
            iotag: w[6] as u16,
            command: (w[7] >> 24) as u8,
            status: (w[7] >> 16) as u8,
            class: (w[7] >> 8) as u8,
            last_entry: w[7] & 1 != 0,
            data_len: w[8],
            residual: w[9],
            scsi_status: w[10] as u8,
            rctl: (w[11] >> 8) as u8,
            fc_type: w[11] as u8,
        }
    }

    /// Little endian wire image of the IOCB.
    pub fn to_bytes(&self) -> [u8; IOCB_SIZE] {
        let mut out = [0u8; IOCB_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Parses a wire image produced by [`Iocb::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> color_eyre::Result<Self> {
        ensure!(
            buf.len() == IOCB_SIZE,
            "an IOCB is exactly {IOCB_SIZE} bytes, got {}",
            buf.len()
        );
        let mut words = [0u32; IOCB_WORDS];
        for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let iocb = Self::from_words(&words);
        ensure!(
            words[7] & 0xfe == 0,
            "reserved bits of the command word are set: 0x{:08x}",
            words[7]
        );
        Ok(iocb)
    }
}

bitflags! {
    /// Driver state of a command descriptor.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct IocbFlags: u32 {
        /// A hardware abort has been issued for this descriptor.
        const ABORT_SENT = 0x1;
        /// The descriptor was completed by the host, not the adapter.
        const DRIVER_COMPLETED = 0x2;
        /// The descriptor is itself an abort request.
        const IS_ABORT = 0x4;
    }
}

/// Completion callback of a command descriptor.
///
/// Receives the adapter, the command descriptor and the response descriptor.
/// Both descriptors are returned to the pool once the callback returns.
pub type IocbCompletion = Box<dyn FnOnce(&Hba, &IocbQ, &IocbQ) + Send>;

/// Host side descriptor of one IOCB exchange.
///
/// Obtained from [`Hba::alloc_iocbq`]. A descriptor sits on at most one list
/// of one ring at a time.
pub struct IocbQ {
    pub iocb: Iocb,
    /// Additional entries of a multi-entry response, in ring order.
    pub continuation: Vec<Iocb>,
    pub retry: u8,
    /// Hardware abort requests issued for this descriptor.
    pub abort_count: u8,
    pub flags: IocbFlags,
    /// Opaque owner data, never interpreted by the SLI layer.
    pub context: u64,
    pub(crate) completion: Option<IocbCompletion>,
    pub(crate) last_abort_at: Option<Instant>,
    /// Handed out by an [`IocbPool`](super::pool::IocbPool).
    pub(crate) pooled: bool,
}

impl IocbQ {
    pub(crate) fn empty() -> Self {
        Self {
            iocb: Iocb::default(),
            continuation: Vec::new(),
            retry: 0,
            abort_count: 0,
            flags: IocbFlags::empty(),
            context: 0,
            completion: None,
            last_abort_at: None,
            pooled: false,
        }
    }

    /// A descriptor outside the pool.
    pub fn new(iocb: Iocb) -> Self {
        Self {
            iocb,
            ..Self::empty()
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.iocb.opcode().is_some_and(IocbCommand::is_bootstrap)
    }

    pub(crate) fn reset(&mut self) {
        self.iocb = Iocb::default();
        self.continuation.clear();
        self.retry = 0;
        self.abort_count = 0;
        self.flags = IocbFlags::empty();
        self.context = 0;
        self.completion = None;
        self.last_abort_at = None;
    }

    pub fn set_completion<F>(&mut self, completion: F)
    where
        F: FnOnce(&Hba, &IocbQ, &IocbQ) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
    }

    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Every entry of the exchange, the first one included.
    pub fn entries(&self) -> impl Iterator<Item = &Iocb> {
        std::iter::once(&self.iocb).chain(self.continuation.iter())
    }
}

impl fmt::Debug for IocbQ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IocbQ")
            .field("iocb", &self.iocb)
            .field("continuation", &self.continuation.len())
            .field("retry", &self.retry)
            .field("abort_count", &self.abort_count)
            .field("flags", &self.flags)
            .field("context", &self.context)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}
