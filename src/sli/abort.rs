//! Cancellation of queued and in-flight descriptors.
//!
//! Queued descriptors never reached the adapter and are completed right away.
//! In-flight descriptors get a hardware abort request and stay on the
//! completion list until the adapter answers for them, either with their own
//! completion or with the acknowledgement of the abort. A descriptor that
//! stays unanswered through two abort requests is completed locally on the
//! next one.

use tracing::debug;

use crate::event::EventId;
use crate::log_event;

use super::iocb::{Iocb, IocbCommand, IocbFlags, IocbQ, IoStatus, ioerr};
use super::iotag::Lookup;
use super::ring::{IssueError, IssueFlags};
use super::{Deferred, Hba, HbaState, RingScope, SliState};

/// Abort requests issued for one descriptor before it is completed locally.
pub const MAX_ABORT_ATTEMPTS: u8 = 2;

/// Which descriptors an abort applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortFilter {
    Iotag(u16),
    /// Exchange context tag.
    Context(u16),
    Target(u16),
    TargetLun(u16, u16),
    All,
}

impl AbortFilter {
    /// Abort requests themselves never match.
    pub fn matches(&self, iocbq: &IocbQ) -> bool {
        if iocbq.flags.contains(IocbFlags::IS_ABORT) {
            return false;
        }
        let iocb = &iocbq.iocb;
        match *self {
            AbortFilter::Iotag(tag) => iocb.iotag == tag,
            AbortFilter::Context(ctx) => iocb.context == ctx,
            AbortFilter::Target(target) => iocb.target == target,
            AbortFilter::TargetLun(target, lun) => iocb.target == target && iocb.lun == lun,
            AbortFilter::All => true,
        }
    }
}

/// What an abort call did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AbortReport {
    /// Queued descriptors completed with a driver reject.
    pub rejected: usize,
    /// Hardware abort requests issued.
    pub issued: usize,
    /// In-flight descriptors completed locally after too many attempts.
    pub escalated: usize,
}

impl AbortReport {
    pub fn total(&self) -> usize {
        self.rejected + self.issued + self.escalated
    }
}

impl Hba {
    /// Cancels every descriptor matching `filter` on the rings in `scope`.
    #[tracing::instrument(skip(self))]
    pub fn abort(&self, filter: AbortFilter, scope: RingScope) -> AbortReport {
        let mut report = AbortReport::default();
        let mut deferred = Deferred::default();
        {
            let mut state = self.lock();
            for ringno in scope.rings(state.rings.len()) {
                let ring = &mut state.rings[ringno];
                let (matched, kept) = ring.txq.drain(..).partition(|q| filter.matches(q));
                ring.txq = kept;
                for iocbq in Vec::from(matched) {
                    state.iotags.free(iocbq.iocb.iotag);
                    self.complete_locally(
                        iocbq,
                        IoStatus::DriverReject,
                        ioerr::SLI_ABORTED,
                        &mut deferred,
                    );
                    report.rejected += 1;
                }

                let keys: Vec<usize> = state.rings[ringno]
                    .txcmplq
                    .iter()
                    .filter(|(_, q)| filter.matches(q))
                    .map(|(key, _)| key)
                    .collect();
                for key in keys {
                    self.abort_in_flight(&mut state, ringno, key, &mut report, &mut deferred);
                }
            }
        }
        self.run_deferred(deferred);
        report
    }

    /// Re-requests aborts that have gone unanswered for
    /// `abort_retry_interval`. This is what eventually escalates them.
    pub(crate) fn retry_stale_aborts(&self) {
        let now = self.clock.now();
        let interval = self.config.abort_retry_interval;
        let mut report = AbortReport::default();
        let mut deferred = Deferred::default();
        {
            let mut state = self.lock();
            if state.hba_state == HbaState::Error {
                return;
            }
            for ringno in 0..state.rings.len() {
                let stale: Vec<usize> = state.rings[ringno]
                    .txcmplq
                    .iter()
                    .filter(|(_, q)| {
                        q.flags.contains(IocbFlags::ABORT_SENT)
                            && q.last_abort_at
                                .is_some_and(|at| now.saturating_duration_since(at) >= interval)
                    })
                    .map(|(key, _)| key)
                    .collect();
                for key in stale {
                    self.abort_in_flight(&mut state, ringno, key, &mut report, &mut deferred);
                }
            }
        }
        if report.total() > 0 {
            debug!(?report, "stale aborts retried");
        }
        self.run_deferred(deferred);
    }

    fn abort_in_flight(
        &self,
        state: &mut SliState,
        ringno: usize,
        key: usize,
        report: &mut AbortReport,
        deferred: &mut Deferred,
    ) {
        let Some(orig) = state.rings[ringno].txcmplq.get_mut(key) else {
            return;
        };
        if orig.abort_count >= MAX_ABORT_ATTEMPTS {
            let orig = state.rings[ringno].txcmplq.remove(key);
            state.iotags.free(orig.iocb.iotag);
            log_event!(
                self.events,
                EventId::AbortEscalated,
                Warning,
                "ring {ringno}: iotag {} unanswered after {} aborts, completing locally",
                orig.iocb.iotag,
                orig.abort_count
            );
            self.complete_locally(orig, IoStatus::LocalReject, ioerr::SLI_ABORTED, deferred);
            report.escalated += 1;
            return;
        }

        orig.abort_count += 1;
        orig.flags |= IocbFlags::ABORT_SENT;
        orig.last_abort_at = Some(self.clock.now());
        let target = orig.iocb.iotag;
        let attempt = orig.abort_count;

        // Without a link there is no one to send an ABTS to; just close the
        // exchange.
        let opcode = if state.hba_state == HbaState::LinkUp {
            IocbCommand::AbortXriCn
        } else {
            IocbCommand::CloseXriCn
        };
        let mut abort = self.pool.get().unwrap_or_else(IocbQ::empty);
        abort.iocb = Iocb {
            parameter: u32::from(target),
            target: orig.iocb.target,
            lun: orig.iocb.lun,
            context: orig.iocb.context,
            ..Iocb::command(opcode)
        };
        abort.flags |= IocbFlags::IS_ABORT;

        match self.issue_locked(state, ringno, abort, IssueFlags::empty(), deferred) {
            Ok(_) | Err(IssueError::Queued { .. }) => {
                log_event!(
                    self.events,
                    EventId::AbortIssued,
                    Info,
                    "ring {ringno}: {opcode:?} for iotag {target}, attempt {attempt}"
                );
                report.issued += 1;
            }
            Err(err) => {
                // Left to the retry sweep.
                debug!(ringno, iotag = target, %err, "abort request not issued");
                if let Some(abort) = err.into_iocbq() {
                    self.pool.release(abort);
                }
            }
        }
    }

    /// Acknowledgement of an abort or close request. The parameter word
    /// carries the iotag of the aborted descriptor.
    pub(crate) fn handle_abort_ack(
        &self,
        state: &mut SliState,
        ringno: usize,
        ack: IocbQ,
        deferred: &mut Deferred,
    ) {
        let target = ack.iocb.parameter as u16;
        let key = match state.iotags.locate(target) {
            Lookup::Found { ring, key } if ring == ringno => Some(key),
            Lookup::Found { .. } | Lookup::NotInFlight => None,
            Lookup::Scan => state.rings[ringno]
                .txcmplq
                .iter()
                .find(|(_, q)| q.iocb.iotag == target)
                .map(|(key, _)| key),
        };
        // The tag may have been reused since the abort went out; only a
        // descriptor that is waiting for this abort is completed.
        let waiting = key.filter(|&key| {
            state.rings[ringno].txcmplq.get(key).is_some_and(|q| {
                q.iocb.iotag == target
                    && q.flags.contains(IocbFlags::ABORT_SENT)
                    && q.iocb.context == ack.iocb.context
            })
        });
        match waiting {
            Some(key) => {
                let orig = state.rings[ringno].txcmplq.remove(key);
                state.iotags.free(target);
                debug!(ringno, iotag = target, "abort acknowledged");
                self.complete_locally(orig, IoStatus::LocalReject, ioerr::SLI_ABORTED, deferred);
            }
            None => {
                log_event!(
                    self.events,
                    EventId::AbortAckDiscarded,
                    Info,
                    "ring {ringno}: abort acknowledgement for iotag {target} matches no pending abort"
                );
            }
        }
        self.pool.release(ack);
    }
}
