//! IOCB rings.
//!
//! Each ring is a command ring the host produces into and a response ring
//! the adapter produces into, both living in [`Slim`](super::slim::Slim).
//! Descriptors that can not go out right away wait on the ring's transmit
//! queue (`txq`) and go out in submission order once the ring has room and
//! no gate is set. Descriptors on the adapter wait on the completion list
//! (`txcmplq`) until their response arrives.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use bitflags::bitflags;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{RingConfig, RingKind};
use crate::event::EventId;
use crate::log_event;

use super::iocb::{Iocb, IocbQ, IocbType, IoStatus};
use super::iotag::Lookup;
use super::regs::ChipAttention;
use super::{Deferred, Hba, SliState};

/// Handler for unsolicited frames.
pub type UnsolicitedHandler = Arc<dyn Fn(&Hba, &IocbQ) + Send + Sync>;

/// Flow control state of a ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingGate {
    Open,
    /// A mailbox command that reconfigures rings is active.
    BlockedByControlOp,
    /// The link is down and the ring carries traffic that needs it.
    BlockedByUnreachableLink,
}

bitflags! {
    /// Options of [`Hba::issue_iocb`].
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct IssueFlags: u32 {
        /// Hand the descriptor back instead of queueing it when the ring is
        /// busy.
        const RETURN_ON_BUSY = 0x1;
    }
}

#[derive(Debug, Error)]
pub enum IssueError {
    /// The ring is busy; the descriptor waits on the transmit queue and goes
    /// out without further action.
    #[error("ring {ringno} busy, iotag {iotag} queued")]
    Queued { ringno: usize, iotag: u16 },
    /// The ring is busy; the descriptor is handed back.
    #[error("ring {ringno} busy")]
    Busy { ringno: usize, iocbq: Box<IocbQ> },
    /// The adapter can not take the descriptor in its current state.
    #[error("IOCB rejected on ring {ringno}: {reason}")]
    Rejected {
        ringno: usize,
        reason: &'static str,
        iocbq: Box<IocbQ>,
    },
}

impl IssueError {
    pub fn is_busy(&self) -> bool {
        matches!(self, IssueError::Queued { .. } | IssueError::Busy { .. })
    }

    /// The descriptor, if it was handed back.
    pub fn into_iocbq(self) -> Option<IocbQ> {
        match self {
            IssueError::Queued { .. } => None,
            IssueError::Busy { iocbq, .. } | IssueError::Rejected { iocbq, .. } => Some(*iocbq),
        }
    }
}

/// Counters of one ring.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    /// IOCBs written into the command ring.
    pub iocb_cmd: u64,
    /// Response exchanges read from the response ring.
    pub iocb_rsp: u64,
    /// Times the command ring was found full.
    pub ring_full: u64,
    /// Submissions answered with busy.
    pub busy: u64,
    /// Doorbell writes for the command ring.
    pub doorbells: u64,
    pub unmatched: u64,
}

pub(crate) struct SliRing {
    pub(crate) ringno: usize,
    pub(crate) kind: RingKind,
    cmd_entries: u32,
    rsp_entries: u32,
    /// Next command slot to fill.
    cmd_put: u32,
    /// Command slots filled but not announced to the adapter.
    unpublished: usize,
    /// Next response slot to read.
    rsp_get: u32,
    pub(crate) control_gate: bool,
    pub(crate) link_gate: bool,
    ring_available_requested: bool,
    pub(crate) txq: VecDeque<IocbQ>,
    pub(crate) txcmplq: Slab<IocbQ>,
    /// Entries of a multi-entry response read so far.
    partial: Vec<Iocb>,
    unsolicited: Vec<(u8, u8, UnsolicitedHandler)>,
    default_unsolicited: Option<UnsolicitedHandler>,
    pub(crate) stats: RingStats,
}

impl SliRing {
    pub(crate) fn new(ringno: usize, config: &RingConfig) -> Self {
        Self {
            ringno,
            kind: config.kind,
            cmd_entries: config.cmd_entries,
            rsp_entries: config.rsp_entries,
            cmd_put: 0,
            unpublished: 0,
            rsp_get: 0,
            control_gate: false,
            link_gate: config.kind == RingKind::Fcp,
            ring_available_requested: false,
            txq: VecDeque::new(),
            txcmplq: Slab::new(),
            partial: Vec::new(),
            unsolicited: Vec::new(),
            default_unsolicited: None,
            stats: RingStats::default(),
        }
    }

    pub(crate) fn gate(&self) -> RingGate {
        if self.control_gate {
            RingGate::BlockedByControlOp
        } else if self.link_gate {
            RingGate::BlockedByUnreachableLink
        } else {
            RingGate::Open
        }
    }

    /// Whether `iocbq` has to wait for the gate.
    fn gated(&self, iocbq: &IocbQ) -> bool {
        match self.gate() {
            RingGate::Open => false,
            RingGate::BlockedByControlOp => true,
            // Aborts still go out; they are how work on a dead link gets
            // cleaned up.
            RingGate::BlockedByUnreachableLink => {
                !iocbq.iocb.opcode().is_some_and(|op| op.is_abort())
            }
        }
    }

    pub(crate) fn reset_indices(&mut self) {
        self.cmd_put = 0;
        self.unpublished = 0;
        self.rsp_get = 0;
        self.control_gate = false;
        self.link_gate = self.kind == RingKind::Fcp;
        self.ring_available_requested = false;
        self.partial.clear();
    }

    fn handler_for(&self, rctl: u8, fc_type: u8) -> Option<UnsolicitedHandler> {
        self.unsolicited
            .iter()
            .find(|(r, t, _)| *r == rctl && *t == fc_type)
            .map(|(_, _, h)| h.clone())
            .or_else(|| self.default_unsolicited.clone())
    }
}

/// Result of trying to put one descriptor on the hardware ring.
enum Placed {
    Ok,
    Full(IocbQ),
    Fatal(IocbQ),
}

impl Hba {
    /// Submits a descriptor on ring `ringno` and returns its iotag.
    ///
    /// Older queued descriptors go out first. When the ring is gated or full
    /// the descriptor is queued (or handed back with
    /// [`IssueFlags::RETURN_ON_BUSY`]) and the result is busy. Descriptors
    /// without a completion callback are released as soon as they are on the
    /// ring.
    pub fn issue_iocb(
        &self,
        ringno: usize,
        iocbq: IocbQ,
        flags: IssueFlags,
    ) -> Result<u16, IssueError> {
        let mut deferred = Deferred::default();
        let result = self.issue_deferred(ringno, iocbq, flags, &mut deferred);
        self.run_deferred(deferred);
        result
    }

    /// [`Hba::issue_iocb`] for callers holding their own lock: follow-up
    /// work lands in `deferred` and must be run once that lock is dropped.
    pub(crate) fn issue_deferred(
        &self,
        ringno: usize,
        iocbq: IocbQ,
        flags: IssueFlags,
        deferred: &mut Deferred,
    ) -> Result<u16, IssueError> {
        let mut state = self.lock();
        self.issue_locked(&mut state, ringno, iocbq, flags, deferred)
    }

    pub(crate) fn issue_locked(
        &self,
        state: &mut SliState,
        ringno: usize,
        mut iocbq: IocbQ,
        flags: IssueFlags,
        deferred: &mut Deferred,
    ) -> Result<u16, IssueError> {
        if ringno >= state.rings.len() {
            return Err(IssueError::Rejected {
                ringno,
                reason: "no such ring",
                iocbq: Box::new(iocbq),
            });
        }
        if !state.hba_state.admits(iocbq.is_bootstrap()) {
            debug!(ringno, state = ?state.hba_state, "IOCB rejected");
            return Err(IssueError::Rejected {
                ringno,
                reason: "adapter not ready",
                iocbq: Box::new(iocbq),
            });
        }

        if iocbq.iocb.iotag == 0 {
            let Some(tag) = state.iotags.alloc() else {
                state.rings[ringno].stats.busy += 1;
                return Err(IssueError::Busy {
                    ringno,
                    iocbq: Box::new(iocbq),
                });
            };
            iocbq.iocb.iotag = tag;
        }
        let iotag = iocbq.iocb.iotag;

        if state.rings[ringno].gated(&iocbq) {
            return Err(self.busy(state, ringno, iocbq, flags));
        }

        // Older work first. Aborts may pass work held back by the link gate.
        let held = self.drain_txq(state, ringno, deferred);
        if !held && !state.rings[ringno].txq.is_empty() {
            return Err(self.busy(state, ringno, iocbq, flags));
        }
        let result = match self.place(state, ringno, iocbq, deferred) {
            Placed::Ok => Ok(iotag),
            Placed::Full(iocbq) => {
                self.ring_full(state, ringno);
                Err(self.busy(state, ringno, iocbq, flags))
            }
            Placed::Fatal(iocbq) => {
                state.iotags.free(iotag);
                Err(IssueError::Rejected {
                    ringno,
                    reason: "ring index invalid",
                    iocbq: Box::new(iocbq),
                })
            }
        };
        self.publish(state, ringno);
        result
    }

    /// Queues or hands back a descriptor that can not go out now.
    fn busy(
        &self,
        state: &mut SliState,
        ringno: usize,
        iocbq: IocbQ,
        flags: IssueFlags,
    ) -> IssueError {
        let ring = &mut state.rings[ringno];
        ring.stats.busy += 1;
        let iotag = iocbq.iocb.iotag;
        if flags.contains(IssueFlags::RETURN_ON_BUSY) {
            state.iotags.free(iotag);
            let mut iocbq = iocbq;
            iocbq.iocb.iotag = 0;
            IssueError::Busy {
                ringno,
                iocbq: Box::new(iocbq),
            }
        } else {
            trace!(ringno, iotag, "IOCB queued");
            ring.txq.push_back(iocbq);
            IssueError::Queued { ringno, iotag }
        }
    }

    /// Moves queued descriptors onto the ring until it is empty or full.
    /// Returns true when the queue head is held back by a gate or by the
    /// adapter state.
    fn drain_txq(&self, state: &mut SliState, ringno: usize, deferred: &mut Deferred) -> bool {
        while let Some(next) = state.rings[ringno].txq.pop_front() {
            let held = state.rings[ringno].gated(&next)
                || !state.hba_state.admits(next.is_bootstrap());
            if held {
                state.rings[ringno].txq.push_front(next);
                return true;
            }
            match self.place(state, ringno, next, deferred) {
                Placed::Ok => {}
                Placed::Full(next) => {
                    state.rings[ringno].txq.push_front(next);
                    self.ring_full(state, ringno);
                    break;
                }
                Placed::Fatal(next) => {
                    state.rings[ringno].txq.push_front(next);
                    break;
                }
            }
        }
        false
    }

    /// Writes one descriptor into the next free slot.
    fn place(
        &self,
        state: &mut SliState,
        ringno: usize,
        iocbq: IocbQ,
        deferred: &mut Deferred,
    ) -> Placed {
        let device_get = self.slim.device_cmd_get(ringno);
        let ring = &mut state.rings[ringno];
        if device_get >= ring.cmd_entries {
            log_event!(
                self.events,
                EventId::RingIndexInvalid,
                Error,
                "ring {ringno} command get index {device_get} exceeds {}",
                ring.cmd_entries
            );
            deferred
                .fatal
                .get_or_insert_with(|| format!("ring {ringno} command get index invalid"));
            return Placed::Fatal(iocbq);
        }
        let next_put = (ring.cmd_put + 1) % ring.cmd_entries;
        if next_put == device_get {
            return Placed::Full(iocbq);
        }

        let slot = ring.cmd_put;
        self.slim.write_cmd_slot(ringno, slot, &iocbq.iocb);
        ring.cmd_put = next_put;
        ring.unpublished += 1;
        ring.stats.iocb_cmd += 1;
        trace!(ringno, iotag = iocbq.iocb.iotag, slot, "IOCB on ring");

        let iotag = iocbq.iocb.iotag;
        if iocbq.has_completion() {
            let key = ring.txcmplq.insert(iocbq);
            state.iotags.mark_in_flight(iotag, ringno, key);
        } else {
            state.iotags.free(iotag);
            self.pool.release(iocbq);
        }

        if state.rings[ringno].unpublished >= self.config.sync_batch {
            self.publish(state, ringno);
        }
        Placed::Ok
    }

    /// Announces filled slots: index store, then doorbell.
    fn publish(&self, state: &mut SliState, ringno: usize) {
        let ring = &mut state.rings[ringno];
        if ring.unpublished == 0 {
            return;
        }
        self.slim.publish_cmd_put(ringno, ring.cmd_put);
        ring.unpublished = 0;
        ring.stats.doorbells += 1;
        self.hw
            .write_chip_attention(ChipAttention::command_posted(ringno));
    }

    fn ring_full(&self, state: &mut SliState, ringno: usize) {
        let ring = &mut state.rings[ringno];
        ring.stats.ring_full += 1;
        if ring.ring_available_requested {
            return;
        }
        ring.ring_available_requested = true;
        log_event!(
            self.events,
            EventId::RingFull,
            Warning,
            "ring {ringno} full, {} queued",
            ring.txq.len()
        );
        self.publish(state, ringno);
        self.hw
            .write_chip_attention(ChipAttention::ring_available_request(ringno));
    }

    /// Pushes queued work to the adapter if the ring allows it.
    pub(crate) fn resume_ring(&self, state: &mut SliState, ringno: usize, deferred: &mut Deferred) {
        if state.rings[ringno].txq.is_empty() {
            return;
        }
        let before = state.rings[ringno].txq.len();
        self.drain_txq(state, ringno, deferred);
        self.publish(state, ringno);
        let sent = before - state.rings[ringno].txq.len();
        if sent > 0 {
            log_event!(
                self.events,
                EventId::RingResumed,
                Info,
                "ring {ringno} resumed, {sent} sent, {} still queued",
                state.rings[ringno].txq.len()
            );
        }
    }

    /// The adapter reported room on the command ring.
    pub(crate) fn handle_ring_available(&self, ringno: usize) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.lock();
            state.rings[ringno].ring_available_requested = false;
            self.resume_ring(&mut state, ringno, &mut deferred);
            deferred.ring_resumed(ringno);
        }
        self.run_deferred(deferred);
    }

    /// The adapter reported new response entries.
    pub(crate) fn handle_ring_event(&self, ringno: usize) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.lock();
            self.process_responses(&mut state, ringno, &mut deferred);
            if deferred.fatal.is_none() {
                self.resume_ring(&mut state, ringno, &mut deferred);
            }
        }
        self.run_deferred(deferred);
    }

    fn process_responses(&self, state: &mut SliState, ringno: usize, deferred: &mut Deferred) {
        let rsp_entries = state.rings[ringno].rsp_entries;
        let mut consumed = 0usize;
        loop {
            let device_put = self.slim.device_rsp_put(ringno);
            if device_put >= rsp_entries {
                log_event!(
                    self.events,
                    EventId::RingIndexInvalid,
                    Error,
                    "ring {ringno} response put index {device_put} exceeds {rsp_entries}"
                );
                deferred
                    .fatal
                    .get_or_insert_with(|| format!("ring {ringno} response put index invalid"));
                break;
            }
            if state.rings[ringno].rsp_get == device_put {
                break;
            }
            while state.rings[ringno].rsp_get != device_put {
                let ring = &mut state.rings[ringno];
                let entry = self.slim.read_rsp_slot(ringno, ring.rsp_get);
                ring.rsp_get = (ring.rsp_get + 1) % rsp_entries;
                self.slim.publish_rsp_get(ringno, ring.rsp_get);
                consumed += 1;

                let last = entry.last_entry;
                ring.partial.push(entry);
                if !last {
                    continue;
                }
                let mut entries = mem::take(&mut ring.partial).into_iter();
                let Some(first) = entries.next() else {
                    continue;
                };
                ring.stats.iocb_rsp += 1;
                let mut rspq = self.pool.get().unwrap_or_else(IocbQ::empty);
                rspq.iocb = first;
                rspq.continuation.extend(entries);
                self.route_response(state, ringno, rspq, deferred);
            }
        }
        if consumed > 0 {
            self.hw
                .write_chip_attention(ChipAttention::response_consumed(ringno));
        }
    }

    fn route_response(
        &self,
        state: &mut SliState,
        ringno: usize,
        rspq: IocbQ,
        deferred: &mut Deferred,
    ) {
        // The last entry of an exchange carries the tag.
        let iotag = rspq.entries().last().map_or(rspq.iocb.iotag, |e| e.iotag);
        match IocbType::classify(rspq.iocb.command) {
            IocbType::Solicited => match self.take_in_flight(state, ringno, iotag) {
                Some(cmd) => deferred.iocb_completions.push((cmd, rspq)),
                None => {
                    state.rings[ringno].stats.unmatched += 1;
                    log_event!(
                        self.events,
                        EventId::UnmatchedCompletion,
                        Warning,
                        "ring {ringno}: completion for iotag {iotag} matches no command, cmd 0x{:02x} status 0x{:x}",
                        rspq.iocb.command,
                        rspq.iocb.status
                    );
                    self.pool.release(rspq);
                }
            },
            IocbType::Unsolicited => {
                let handler = state.rings[ringno].handler_for(rspq.iocb.rctl, rspq.iocb.fc_type);
                match handler {
                    Some(handler) => deferred.unsolicited.push((handler, rspq)),
                    None => {
                        log_event!(
                            self.events,
                            EventId::UnhandledUnsolicited,
                            Warning,
                            "ring {ringno}: no handler for unsolicited frame rctl 0x{:02x} type 0x{:02x}",
                            rspq.iocb.rctl,
                            rspq.iocb.fc_type
                        );
                        self.pool.release(rspq);
                    }
                }
            }
            IocbType::AbortAck => self.handle_abort_ack(state, ringno, rspq, deferred),
            IocbType::Unknown => {
                log_event!(
                    self.events,
                    EventId::UnknownIocb,
                    Warning,
                    "ring {ringno}: unknown IOCB command 0x{:02x}, iotag {iotag}",
                    rspq.iocb.command
                );
                self.pool.release(rspq);
            }
        }
    }

    /// Removes the in-flight descriptor with `iotag` from the completion
    /// list of `ringno`.
    pub(crate) fn take_in_flight(
        &self,
        state: &mut SliState,
        ringno: usize,
        iotag: u16,
    ) -> Option<IocbQ> {
        let key = match state.iotags.locate(iotag) {
            Lookup::Found { ring, key } if ring == ringno => Some(key),
            Lookup::Found { .. } | Lookup::NotInFlight => None,
            Lookup::Scan => state.rings[ringno]
                .txcmplq
                .iter()
                .find(|(_, q)| q.iocb.iotag == iotag)
                .map(|(key, _)| key),
        }?;
        let ring = &mut state.rings[ringno];
        if ring.txcmplq.get(key).is_none_or(|q| q.iocb.iotag != iotag) {
            return None;
        }
        let iocbq = ring.txcmplq.remove(key);
        state.iotags.free(iotag);
        Some(iocbq)
    }

    /// Completes every descriptor of a ring locally, queued or in flight.
    pub(crate) fn flush_ring(
        &self,
        state: &mut SliState,
        ringno: usize,
        status: IoStatus,
        qualifier: u32,
        deferred: &mut Deferred,
    ) {
        let ring = &mut state.rings[ringno];
        let queued: Vec<IocbQ> = ring.txq.drain(..).collect();
        let in_flight: Vec<IocbQ> = ring.txcmplq.drain().collect();
        ring.ring_available_requested = false;
        ring.partial.clear();
        if !queued.is_empty() || !in_flight.is_empty() {
            debug!(
                ringno,
                queued = queued.len(),
                in_flight = in_flight.len(),
                qualifier,
                "flushing ring"
            );
        }
        for iocbq in queued.into_iter().chain(in_flight) {
            state.iotags.free(iocbq.iocb.iotag);
            self.complete_locally(iocbq, status, qualifier, deferred);
        }
    }

    /// Routes unsolicited frames with the given R_CTL and TYPE on `ringno`
    /// to `handler`.
    pub fn register_unsolicited<F>(&self, ringno: usize, rctl: u8, fc_type: u8, handler: F)
    where
        F: Fn(&Hba, &IocbQ) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        if let Some(ring) = state.rings.get_mut(ringno) {
            ring.unsolicited.retain(|(r, t, _)| !(*r == rctl && *t == fc_type));
            ring.unsolicited.push((rctl, fc_type, Arc::new(handler)));
        }
    }

    /// Handler for unsolicited frames on `ringno` no registered pair matches.
    pub fn set_default_unsolicited<F>(&self, ringno: usize, handler: F)
    where
        F: Fn(&Hba, &IocbQ) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        if let Some(ring) = state.rings.get_mut(ringno) {
            ring.default_unsolicited = Some(Arc::new(handler));
        }
    }

    pub fn ring_gate(&self, ringno: usize) -> Option<RingGate> {
        self.lock().rings.get(ringno).map(SliRing::gate)
    }

    pub fn ring_stats(&self, ringno: usize) -> Option<RingStats> {
        self.lock().rings.get(ringno).map(|r| r.stats.clone())
    }

    /// Descriptors waiting on the transmit queue of `ringno`.
    pub fn txq_len(&self, ringno: usize) -> usize {
        self.lock().rings.get(ringno).map_or(0, |r| r.txq.len())
    }

    /// Descriptors on the adapter for `ringno`.
    pub fn txcmplq_len(&self, ringno: usize) -> usize {
        self.lock().rings.get(ringno).map_or(0, |r| r.txcmplq.len())
    }

    /// Host command put index as last written to shared memory.
    pub fn host_cmd_put(&self, ringno: usize) -> Option<u32> {
        (ringno < self.config.rings.len()).then(|| self.slim.host_cmd_put(ringno))
    }
}
