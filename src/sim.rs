//! A simulated adapter.
//!
//! [`SimAdapter`] implements [`Hardware`] with plain atomics and plays the
//! device side of the SLI protocol on the shared memory it is given. Nothing
//! happens on its own: tests and the demo binary pull commands off the rings
//! and push responses back explicitly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::sli::hw::Hardware;
use crate::sli::iocb::{Iocb, IocbType, IoStatus};
use crate::sli::mailbox::{self, MAILBOX_WORDS};
use crate::sli::regs::{ChipAttention, HostAttention};
use crate::sli::slim::Slim;

/// What the simulated firmware does with a mailbox command.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MailboxBehavior {
    /// Answer at once with success.
    #[default]
    Complete,
    /// Answer at once with the given status.
    CompleteWith(u16),
    /// Never answer.
    Stall,
    /// Answer with an opcode the host does not know.
    CorruptOpcode,
}

/// Opcode written back by [`MailboxBehavior::CorruptOpcode`].
pub const CORRUPT_MBOX_OPCODE: u8 = 0xee;

#[derive(Debug)]
pub struct SimAdapter {
    slim: Mutex<Option<Arc<Slim>>>,
    host_attention: AtomicU32,
    doorbells: Mutex<Vec<ChipAttention>>,
    link_up: AtomicBool,
    resets: AtomicUsize,
    attaches: AtomicUsize,
    mailbox: Mutex<MailboxBehavior>,
    /// Opcodes of every mailbox command the host posted.
    mailbox_log: Mutex<Vec<u8>>,
    /// Rings the host asked to be told about free command slots.
    ring_available_requested: AtomicU32,
    malformed: AtomicUsize,
}

impl Default for SimAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimAdapter {
    pub fn new() -> Self {
        Self {
            slim: Mutex::new(None),
            host_attention: AtomicU32::new(0),
            doorbells: Mutex::new(Vec::new()),
            link_up: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
            attaches: AtomicUsize::new(0),
            mailbox: Mutex::new(MailboxBehavior::Complete),
            mailbox_log: Mutex::new(Vec::new()),
            ring_available_requested: AtomicU32::new(0),
            malformed: AtomicUsize::new(0),
        }
    }

    fn slim(&self) -> Option<Arc<Slim>> {
        self.slim.lock().clone()
    }

    pub fn set_mailbox_behavior(&self, behavior: MailboxBehavior) {
        *self.mailbox.lock() = behavior;
    }

    /// Changes the physical link and raises link attention.
    pub fn set_link(&self, up: bool) {
        self.link_up.store(up, Ordering::Release);
        self.raise(HostAttention::LATT);
    }

    /// Sets host attention bits.
    pub fn raise(&self, bits: HostAttention) {
        self.host_attention.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub fn pending_attention(&self) -> HostAttention {
        HostAttention::from_bits_retain(self.host_attention.load(Ordering::Acquire))
    }

    /// Every chip attention write so far.
    pub fn doorbells(&self) -> Vec<ChipAttention> {
        self.doorbells.lock().clone()
    }

    pub fn clear_doorbells(&self) {
        self.doorbells.lock().clear();
    }

    /// Doorbell writes containing all of `bits`.
    pub fn doorbell_count(&self, bits: ChipAttention) -> usize {
        self.doorbells.lock().iter().filter(|d| d.contains(bits)).count()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::Acquire)
    }

    /// Command slots fetched that did not decode.
    pub fn malformed_commands(&self) -> usize {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::Acquire)
    }

    pub fn mailbox_log(&self) -> Vec<u8> {
        self.mailbox_log.lock().clone()
    }

    /// Completes the mailbox command currently posted, if any, with `status`.
    /// Used together with [`MailboxBehavior::Stall`] to answer late.
    pub fn complete_mailbox(&self, status: u16) -> bool {
        let Some(slim) = self.slim() else {
            return false;
        };
        let mut words = slim.read_mailbox();
        if !mailbox::owned_by_chip(words[0]) {
            return false;
        }
        words[0] = (words[0] & 0xff00) | (u32::from(status) << 16);
        slim.write_mailbox(&words);
        self.raise(HostAttention::MBATT);
        true
    }

    fn answer_mailbox(&self, slim: &Slim) {
        let mut words: [u32; MAILBOX_WORDS] = slim.read_mailbox();
        let command = (words[0] >> 8) as u8;
        self.mailbox_log.lock().push(command);
        let status = match *self.mailbox.lock() {
            MailboxBehavior::Stall => return,
            MailboxBehavior::Complete => mailbox::mbx_status::SUCCESS,
            MailboxBehavior::CompleteWith(status) => status,
            MailboxBehavior::CorruptOpcode => {
                words[0] = (words[0] & !0xff00) | (u32::from(CORRUPT_MBOX_OPCODE) << 8);
                mailbox::mbx_status::SUCCESS
            }
        };
        words[0] = (words[0] & 0xff00) | (u32::from(status) << 16);
        slim.write_mailbox(&words);
        self.raise(HostAttention::MBATT);
        trace!(command, status, "sim mailbox answered");
    }

    /// Pulls every command the host has published on `ringno` and advances
    /// the device get index past them.
    pub fn take_commands(&self, ringno: usize) -> Vec<Iocb> {
        let Some(slim) = self.slim() else {
            return Vec::new();
        };
        let entries = slim.cmd_entries(ringno);
        let put = slim.host_cmd_put(ringno);
        let mut get = slim.device_cmd_get(ringno);
        let mut commands = Vec::new();
        while get != put {
            match Iocb::from_bytes(&slim.read_cmd_bytes(ringno, get)) {
                Ok(iocb) => commands.push(iocb),
                Err(e) => {
                    warn!(ringno, slot = get, "dropping malformed command: {e:#}");
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                }
            }
            get = (get + 1) % entries;
        }
        slim.set_device_cmd_get(ringno, get);

        let bit = 1u32 << ringno;
        if !commands.is_empty()
            && self.ring_available_requested.fetch_and(!bit, Ordering::AcqRel) & bit != 0
        {
            self.raise(HostAttention::ring_available(ringno));
        }
        commands
    }

    /// Free response slots on `ringno`.
    pub fn response_room(&self, ringno: usize) -> u32 {
        let Some(slim) = self.slim() else {
            return 0;
        };
        let entries = slim.rsp_entries(ringno);
        let put = slim.device_rsp_put(ringno);
        let get = slim.host_rsp_get(ringno);
        (get + entries - put - 1) % entries
    }

    /// Writes `entries` into the response ring as one batch and raises the
    /// response event. Returns false, writing nothing, if they do not fit.
    pub fn post_responses(&self, ringno: usize, entries: &[Iocb]) -> bool {
        let Some(slim) = self.slim() else {
            return false;
        };
        if entries.len() as u32 > self.response_room(ringno) {
            return false;
        }
        let size = slim.rsp_entries(ringno);
        let mut put = slim.device_rsp_put(ringno);
        for entry in entries {
            slim.write_rsp_slot(ringno, put, entry);
            put = (put + 1) % size;
        }
        slim.set_device_rsp_put(ringno, put);
        self.raise(HostAttention::response_event(ringno));
        true
    }

    /// Answers a command with a response derived from it.
    pub fn respond<F>(&self, ringno: usize, cmd: &Iocb, edit: F) -> bool
    where
        F: FnOnce(&mut Iocb),
    {
        let mut rsp = Iocb {
            last_entry: true,
            ..cmd.clone()
        };
        rsp.set_io_status(IoStatus::Success, 0);
        edit(&mut rsp);
        self.post_responses(ringno, &[rsp])
    }

    pub fn complete(&self, ringno: usize, cmd: &Iocb, status: IoStatus, qualifier: u32) -> bool {
        self.respond(ringno, cmd, |rsp| rsp.set_io_status(status, qualifier))
    }

    /// Acknowledges an abort or close request. The ack keeps the tag of the
    /// aborted command in its parameter word.
    pub fn ack_abort(&self, ringno: usize, abort: &Iocb) -> bool {
        let parameter = abort.parameter;
        self.respond(ringno, abort, |rsp| {
            rsp.status = IoStatus::LocalReject.raw();
            rsp.parameter = parameter;
        })
    }

    /// Takes everything off `ringno`, completes commands successfully and
    /// acknowledges aborts. Stops when the response ring is full. Returns the
    /// number of responses posted.
    pub fn echo(&self, ringno: usize) -> usize {
        let mut posted = 0;
        for cmd in self.take_commands(ringno) {
            let ok = match IocbType::classify(cmd.command) {
                IocbType::AbortAck => self.ack_abort(ringno, &cmd),
                _ => self.complete(ringno, &cmd, IoStatus::Success, 0),
            };
            if !ok {
                break;
            }
            posted += 1;
        }
        posted
    }

    /// Overwrites the device command get index, for exercising index checks.
    pub fn force_cmd_get(&self, ringno: usize, value: u32) {
        if let Some(slim) = self.slim() {
            slim.set_device_cmd_get(ringno, value);
        }
    }

    /// Overwrites the device response put index and raises the response
    /// event.
    pub fn force_rsp_put(&self, ringno: usize, value: u32) {
        if let Some(slim) = self.slim() {
            slim.set_device_rsp_put(ringno, value);
            self.raise(HostAttention::response_event(ringno));
        }
    }
}

impl Hardware for SimAdapter {
    fn attach_memory(&self, slim: Arc<Slim>) {
        *self.slim.lock() = Some(slim);
        self.host_attention.store(0, Ordering::Release);
        self.ring_available_requested.store(0, Ordering::Release);
        self.attaches.fetch_add(1, Ordering::AcqRel);
    }

    fn write_chip_attention(&self, bits: ChipAttention) {
        self.doorbells.lock().push(bits);
        let Some(slim) = self.slim() else {
            return;
        };
        for ringno in 0..slim.ring_count() {
            if bits.contains(ChipAttention::ring_available_request(ringno)) {
                self.ring_available_requested
                    .fetch_or(1 << ringno, Ordering::AcqRel);
            }
        }
        if bits.contains(ChipAttention::MBATT) {
            self.answer_mailbox(&slim);
        }
    }

    fn read_host_attention(&self) -> HostAttention {
        self.pending_attention()
    }

    fn clear_host_attention(&self, bits: HostAttention) {
        self.host_attention.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    fn link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    fn request_reset(&self) {
        self.resets.fetch_add(1, Ordering::AcqRel);
    }
}
