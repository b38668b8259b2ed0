//! Mailbox commands: the one-at-a-time control plane to the adapter firmware.
//!
//! A mailbox command is a [`MAILBOX_WORDS`] word block written into shared
//! memory. Word 0 carries the status, the opcode and the owner bit; the
//! adapter flips the owner bit back to the host when it is done.
//!
//! Commands are issued either in [`MboxMode::Poll`], where the caller waits,
//! or in [`MboxMode::NoWait`], where completion arrives through the mailbox
//! attention interrupt. Only one command is active at a time; NOWAIT commands
//! issued while another one is active wait in a FIFO.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::event::EventId;
use crate::log_event;

use super::regs::{ChipAttention, HostAttention};
use super::ring::RingGate;
use super::{Deferred, Hba, HbaState, SliState};

/// Number of 32 bit words in a mailbox command.
pub const MAILBOX_WORDS: usize = 32;

pub const OWNER_CHIP: u32 = 0x1;

/// Mailbox opcodes.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MbxOpcode {
    LoadSm = 0x01,
    ReadNv = 0x02,
    WriteNv = 0x03,
    RunBiuDiag = 0x04,
    InitLink = 0x05,
    DownLink = 0x06,
    ConfigLink = 0x07,
    ConfigRing = 0x09,
    ResetRing = 0x0a,
    ReadConfig = 0x0b,
    ReadRconfig = 0x0c,
    ReadSparm = 0x0d,
    ReadStatus = 0x0e,
    ReadRpi = 0x0f,
    ReadXri = 0x10,
    ReadRev = 0x11,
    ReadLnkStat = 0x12,
    RegLogin = 0x13,
    UnregLogin = 0x14,
    ReadLa = 0x15,
    ClearLa = 0x16,
    DumpMemory = 0x17,
    DumpContext = 0x18,
    RunDiags = 0x19,
    Restart = 0x1a,
    UpdateCfg = 0x1b,
    DownLoad = 0x1c,
    DelLdEntry = 0x1d,
    RunProgram = 0x1e,
    SetMask = 0x20,
    SetSlim = 0x21,
    UnregDid = 0x23,
    KillBoard = 0x24,
    ConfigFarp = 0x25,
    Heartbeat = 0x31,
    ConfigPort = 0x88,
}

impl MbxOpcode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        use MbxOpcode::*;
        let op = match raw {
            0x01 => LoadSm,
            0x02 => ReadNv,
            0x03 => WriteNv,
            0x04 => RunBiuDiag,
            0x05 => InitLink,
            0x06 => DownLink,
            0x07 => ConfigLink,
            0x09 => ConfigRing,
            0x0a => ResetRing,
            0x0b => ReadConfig,
            0x0c => ReadRconfig,
            0x0d => ReadSparm,
            0x0e => ReadStatus,
            0x0f => ReadRpi,
            0x10 => ReadXri,
            0x11 => ReadRev,
            0x12 => ReadLnkStat,
            0x13 => RegLogin,
            0x14 => UnregLogin,
            0x15 => ReadLa,
            0x16 => ClearLa,
            0x17 => DumpMemory,
            0x18 => DumpContext,
            0x19 => RunDiags,
            0x1a => Restart,
            0x1b => UpdateCfg,
            0x1c => DownLoad,
            0x1d => DelLdEntry,
            0x1e => RunProgram,
            0x20 => SetMask,
            0x21 => SetSlim,
            0x23 => UnregDid,
            0x24 => KillBoard,
            0x25 => ConfigFarp,
            0x31 => Heartbeat,
            0x88 => ConfigPort,
            _ => return None,
        };
        Some(op)
    }

    /// Commands that change ring or link configuration. IOCB traffic is held
    /// back while one of them is active.
    pub fn quiesces_rings(self) -> bool {
        matches!(
            self,
            MbxOpcode::ConfigLink
                | MbxOpcode::ConfigRing
                | MbxOpcode::ResetRing
                | MbxOpcode::ConfigPort
        )
    }

    /// Commands accepted even when the adapter is in the error state.
    fn allowed_in_error(self) -> bool {
        matches!(self, MbxOpcode::KillBoard | MbxOpcode::Restart)
    }
}

/// Mailbox completion status values.
pub mod mbx_status {
    pub const SUCCESS: u16 = 0x0;
    pub const CMD_ERROR: u16 = 0x1;
    pub const NOT_SUPPORTED: u16 = 0x2;
    pub const BUSY: u16 = 0xfe;
    /// The command never completed: timed out, flushed or undeliverable.
    pub const NOT_FINISHED: u16 = 0xff;
}

/// How a mailbox command is waited for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MboxMode {
    /// Busy-wait for completion in the caller.
    Poll,
    /// Return at once; completion is delivered through the callback.
    NoWait,
}

/// Completion callback of a NOWAIT mailbox command.
pub type MboxCompletion = Box<dyn FnOnce(&Hba, MailboxCommand) + Send>;

/// A mailbox command block plus its host-side bookkeeping.
pub struct MailboxCommand {
    /// Raw opcode, see [`MbxOpcode`].
    pub command: u8,
    pub status: u16,
    /// Words 1.. of the block.
    pub payload: [u32; MAILBOX_WORDS - 1],
    pub(crate) completion: Option<MboxCompletion>,
}

impl MailboxCommand {
    pub fn new(opcode: MbxOpcode) -> Self {
        Self::from_raw(opcode as u8)
    }

    /// A command with an opcode that may not be known to the driver.
    pub fn from_raw(command: u8) -> Self {
        Self {
            command,
            status: mbx_status::SUCCESS,
            payload: [0; MAILBOX_WORDS - 1],
            completion: None,
        }
    }

    pub fn with_completion<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(&Hba, MailboxCommand) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn opcode(&self) -> Option<MbxOpcode> {
        MbxOpcode::from_raw(self.command)
    }

    pub fn is_success(&self) -> bool {
        self.status == mbx_status::SUCCESS
    }

    fn quiesces_rings(&self) -> bool {
        self.opcode().is_some_and(MbxOpcode::quiesces_rings)
    }

    /// Wire image, owned by the adapter.
    pub fn to_words(&self) -> [u32; MAILBOX_WORDS] {
        let mut words = [0u32; MAILBOX_WORDS];
        words[0] = (u32::from(self.status) << 16) | (u32::from(self.command) << 8) | OWNER_CHIP;
        words[1..].copy_from_slice(&self.payload);
        words
    }

    /// Copies status, opcode and payload back from a completed block.
    pub fn load_words(&mut self, words: &[u32; MAILBOX_WORDS]) {
        self.status = (words[0] >> 16) as u16;
        self.command = (words[0] >> 8) as u8;
        self.payload.copy_from_slice(&words[1..]);
    }
}

impl fmt::Debug for MailboxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxCommand")
            .field("command", &format_args!("0x{:02x}", self.command))
            .field("status", &self.status)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

/// Whether a block in shared memory is still owned by the adapter.
pub fn owned_by_chip(word0: u32) -> bool {
    word0 & OWNER_CHIP != 0
}

/// Result of a successful [`Hba::issue_mbox`].
#[derive(Debug)]
pub enum MboxIssued {
    /// NOWAIT command handed to the adapter.
    Issued,
    /// NOWAIT command queued behind the active one. Reported as busy.
    Queued,
    /// POLL command completed; the block holds the adapter's answer.
    Completed(MailboxCommand),
}

impl MboxIssued {
    pub fn is_busy(&self) -> bool {
        matches!(self, MboxIssued::Queued)
    }
}

#[derive(Debug, Error)]
pub enum MboxError {
    /// A POLL command found another command active. The command is handed
    /// back untouched.
    #[error("mailbox busy")]
    Busy(Box<MailboxCommand>),
    /// The command could not be delivered or did not finish in time.
    #[error("mailbox command 0x{:02x} not finished", .0.command)]
    NotFinished(Box<MailboxCommand>),
}

pub(crate) struct ActiveMbox {
    cmd: MailboxCommand,
    mode: MboxMode,
    deadline: Option<Instant>,
}

#[derive(Default)]
pub(crate) struct MboxState {
    active: Option<ActiveMbox>,
    queue: VecDeque<MailboxCommand>,
}

impl MboxState {
    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Hba {
    /// Issues a mailbox command.
    ///
    /// `Poll` fails with [`MboxError::Busy`] if any command is active and
    /// with [`MboxError::NotFinished`] if the adapter does not answer within
    /// the poll policy. Poll commands do not run their completion callback;
    /// the answered block is returned instead.
    ///
    /// `NoWait` queues behind an active command and reports
    /// [`MboxIssued::Queued`].
    #[tracing::instrument(skip(self, cmd), fields(command = cmd.command))]
    pub fn issue_mbox(
        &self,
        mut cmd: MailboxCommand,
        mode: MboxMode,
    ) -> Result<MboxIssued, MboxError> {
        {
            let mut state = self.lock();
            if let Err(reason) = self.check_mbox(&state, &cmd) {
                warn!(reason, "mailbox command refused");
                cmd.status = mbx_status::NOT_FINISHED;
                return Err(MboxError::NotFinished(Box::new(cmd)));
            }
            let busy = state.mbox.active.is_some() || !state.mbox.queue.is_empty();
            match mode {
                MboxMode::Poll if busy => {
                    debug!("poll command found the mailbox busy");
                    return Err(MboxError::Busy(Box::new(cmd)));
                }
                MboxMode::NoWait if busy => {
                    state.mbox.queue.push_back(cmd);
                    return Ok(MboxIssued::Queued);
                }
                MboxMode::NoWait => {
                    self.start_mbox(&mut state, cmd, MboxMode::NoWait);
                    return Ok(MboxIssued::Issued);
                }
                MboxMode::Poll => self.start_mbox(&mut state, cmd, MboxMode::Poll),
            }
        }
        self.poll_mbox()
    }

    fn check_mbox(&self, state: &SliState, cmd: &MailboxCommand) -> Result<(), &'static str> {
        let Some(opcode) = cmd.opcode() else {
            return Err("unknown mailbox opcode");
        };
        match state.hba_state {
            HbaState::Error | HbaState::Uninitialized if !opcode.allowed_in_error() => {
                Err("adapter not operational")
            }
            _ => Ok(()),
        }
    }

    /// Hands `cmd` to the adapter. The mailbox must be idle.
    fn start_mbox(&self, state: &mut SliState, cmd: MailboxCommand, mode: MboxMode) {
        debug_assert!(state.mbox.active.is_none());
        if cmd.quiesces_rings() {
            for ring in state.rings.iter_mut() {
                ring.control_gate = true;
            }
        }
        self.slim.write_mailbox(&cmd.to_words());
        let deadline = match mode {
            MboxMode::NoWait => Some(self.clock.now() + self.config.mailbox_timeout),
            MboxMode::Poll => None,
        };
        trace!(command = cmd.command, ?mode, "mailbox command posted");
        state.mbox.active = Some(ActiveMbox {
            cmd,
            mode,
            deadline,
        });
        self.hw.write_chip_attention(ChipAttention::MBATT);
    }

    /// Waits for the active poll command.
    fn poll_mbox(&self) -> Result<MboxIssued, MboxError> {
        let policy = &self.config.poll;
        let mut done = false;
        for attempt in 0..policy.max_attempts {
            self.clock.sleep(policy.delay(attempt));
            if !owned_by_chip(self.slim.mailbox_word0()) {
                if self.hw.read_host_attention().contains(HostAttention::MBATT) {
                    self.hw.clear_host_attention(HostAttention::MBATT);
                }
                done = true;
                break;
            }
        }

        let mut deferred = Deferred::default();
        let result = {
            let mut state = self.lock();
            let active = match state.mbox.active.take() {
                Some(active) if active.mode == MboxMode::Poll => active,
                other => {
                    state.mbox.active = other;
                    let mut lost = MailboxCommand::from_raw(0);
                    lost.status = mbx_status::NOT_FINISHED;
                    return Err(MboxError::NotFinished(Box::new(lost)));
                }
            };
            let mut cmd = active.cmd;
            if done {
                cmd.load_words(&self.slim.read_mailbox());
            } else {
                cmd.status = mbx_status::NOT_FINISHED;
                log_event!(
                    self.events,
                    EventId::MboxPollTimeout,
                    Error,
                    "mailbox command 0x{:02x} not finished after {} polls",
                    cmd.command,
                    policy.max_attempts
                );
            }
            self.settle_mbox(&mut state, &cmd, &mut deferred);
            if done {
                Ok(MboxIssued::Completed(cmd))
            } else {
                Err(MboxError::NotFinished(Box::new(cmd)))
            }
        };
        self.run_deferred(deferred);
        self.start_next_mbox();
        result
    }

    /// Lifts the ring gate a settled command had set.
    fn settle_mbox(&self, state: &mut SliState, cmd: &MailboxCommand, deferred: &mut Deferred) {
        if !cmd.quiesces_rings() {
            return;
        }
        for ringno in 0..state.rings.len() {
            state.rings[ringno].control_gate = false;
            self.resume_ring(state, ringno, deferred);
            if state.rings[ringno].gate() == RingGate::Open {
                deferred.ring_resumed(ringno);
            }
        }
    }

    /// Mailbox attention from the adapter.
    pub(crate) fn handle_mbox_event(&self) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.lock();
            let Some(active) = state.mbox.active.as_ref() else {
                log_event!(
                    self.events,
                    EventId::StrayMboxInterrupt,
                    Warning,
                    "mailbox attention with no command active"
                );
                return;
            };
            if active.mode == MboxMode::Poll {
                // The poller picks this one up.
                return;
            }
            let words = self.slim.read_mailbox();
            if owned_by_chip(words[0]) {
                debug!("mailbox attention but block still owned by adapter");
                return;
            }
            let Some(active) = state.mbox.active.take() else {
                return;
            };
            let mut cmd = active.cmd;
            cmd.load_words(&words);
            if cmd.opcode().is_none() {
                log_event!(
                    self.events,
                    EventId::UnknownMboxCommand,
                    Error,
                    "adapter completed unknown mailbox command 0x{:02x}",
                    cmd.command
                );
                cmd.status = mbx_status::NOT_FINISHED;
                deferred.fatal = Some(format!(
                    "unknown mailbox command 0x{:02x} completed",
                    cmd.command
                ));
            }
            debug!(command = cmd.command, status = cmd.status, "mailbox command completed");
            self.settle_mbox(&mut state, &cmd, &mut deferred);
            deferred.mbox_completions.push(cmd);
        }
        self.run_deferred(deferred);
        self.start_next_mbox();
    }

    /// Issues the oldest queued command if the mailbox is idle. Commands the
    /// adapter no longer accepts complete with `NOT_FINISHED`.
    fn start_next_mbox(&self) {
        loop {
            let mut deferred = Deferred::default();
            {
                let mut state = self.lock();
                if state.mbox.active.is_some() {
                    return;
                }
                let Some(mut next) = state.mbox.queue.pop_front() else {
                    return;
                };
                match self.check_mbox(&state, &next) {
                    Ok(()) => {
                        self.start_mbox(&mut state, next, MboxMode::NoWait);
                        return;
                    }
                    Err(reason) => {
                        warn!(reason, command = next.command, "queued mailbox command failed");
                        next.status = mbx_status::NOT_FINISHED;
                        deferred.mbox_completions.push(next);
                    }
                }
            }
            self.run_deferred(deferred);
        }
    }

    /// Fails the active NOWAIT command once its deadline passed, then every
    /// queued command behind it.
    pub(crate) fn check_mbox_timeout(&self) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.lock();
            let now = self.clock.now();
            let expired = state
                .mbox
                .active
                .as_ref()
                .and_then(|a| a.deadline)
                .is_some_and(|deadline| now >= deadline);
            if !expired {
                return;
            }
            let Some(active) = state.mbox.active.take() else {
                return;
            };
            let mut cmd = active.cmd;
            cmd.status = mbx_status::NOT_FINISHED;
            log_event!(
                self.events,
                EventId::MboxTimeout,
                Error,
                "mailbox command 0x{:02x} timed out, flushing {} queued",
                cmd.command,
                state.mbox.queue.len()
            );
            self.settle_mbox(&mut state, &cmd, &mut deferred);
            deferred.mbox_completions.push(cmd);
            self.flush_mbox(&mut state, &mut deferred);
        }
        self.run_deferred(deferred);
    }

    /// Fails the active command and everything queued with `NOT_FINISHED`.
    /// A poll command stays active; its poller settles it.
    pub(crate) fn flush_mbox(&self, state: &mut SliState, deferred: &mut Deferred) {
        let polling = state
            .mbox
            .active
            .as_ref()
            .is_some_and(|a| a.mode == MboxMode::Poll);
        if let Some(active) = state.mbox.active.take_if(|_| !polling) {
            let mut cmd = active.cmd;
            cmd.status = mbx_status::NOT_FINISHED;
            if cmd.quiesces_rings() {
                for ring in state.rings.iter_mut() {
                    ring.control_gate = false;
                }
            }
            deferred.mbox_completions.push(cmd);
        }
        while let Some(mut cmd) = state.mbox.queue.pop_front() {
            cmd.status = mbx_status::NOT_FINISHED;
            log_event!(
                self.events,
                EventId::MboxFlushed,
                Warning,
                "queued mailbox command 0x{:02x} flushed",
                cmd.command
            );
            deferred.mbox_completions.push(cmd);
        }
    }

    /// Whether a mailbox command is active.
    pub fn mbox_active(&self) -> bool {
        self.lock().mbox.is_active()
    }

    pub fn mbox_queued(&self) -> usize {
        self.lock().mbox.queued()
    }
}
