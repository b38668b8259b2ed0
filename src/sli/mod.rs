//! Service Level Interface: the host side of the command/response protocol
//! spoken with the adapter firmware.
//!
//! An [`Hba`] owns the shared memory, the rings, the mailbox, and the lock
//! that protects them. Interrupt delivery enters through
//! [`Hba::handle_interrupt`]; periodic work (mailbox timeouts, abort retries)
//! through [`Hba::run_timers`].
//!
//! Completion callbacks are never run while the adapter lock is held. Work
//! that ends in a callback is collected in a [`Deferred`] list under the lock
//! and run after it is dropped.

pub mod abort;
pub mod hw;
pub mod iocb;
mod iotag;
pub mod mailbox;
pub mod pool;
pub mod regs;
pub mod ring;
pub mod slim;

use std::fmt;
use std::sync::Arc;

use color_eyre::Result;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{HbaConfig, RingKind};
use crate::event::{EventId, EventSink};
use crate::log_event;

use hw::Hardware;
use iocb::{IocbQ, IoStatus, ioerr};
use iotag::IotagTable;
use mailbox::{MailboxCommand, MboxState};
use pool::IocbPool;
use regs::HostAttention;
use ring::{SliRing, UnsolicitedHandler};
use slim::Slim;

/// Adapter life cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HbaState {
    /// Being reset, or never attached.
    Uninitialized,
    /// Memory attached, rings being configured. Only bootstrap IOCBs go out.
    InitStart,
    /// Ready, link down: FCP rings queue their work.
    LinkDown,
    /// Ready for I/O.
    LinkUp,
    /// Unrecoverable error. Everything is refused until [`Hba::restart`].
    Error,
}

impl HbaState {
    /// Whether an IOCB may go to the adapter in this state.
    pub(crate) fn admits(self, bootstrap: bool) -> bool {
        match self {
            HbaState::LinkDown | HbaState::LinkUp => true,
            HbaState::InitStart => bootstrap,
            HbaState::Uninitialized | HbaState::Error => false,
        }
    }
}

type FatalListener = Arc<dyn Fn(&Hba) + Send + Sync>;
type ResumeListener = Arc<dyn Fn(&Hba, usize) + Send + Sync>;

/// Everything guarded by the adapter lock.
pub(crate) struct SliState {
    pub(crate) hba_state: HbaState,
    pub(crate) rings: Vec<SliRing>,
    pub(crate) mbox: MboxState,
    pub(crate) iotags: IotagTable,
    fatal_listeners: Vec<FatalListener>,
    resume_listeners: Vec<ResumeListener>,
}

/// Callbacks and follow-up work collected under the adapter lock.
#[derive(Default)]
pub(crate) struct Deferred {
    pub(crate) iocb_completions: Vec<(IocbQ, IocbQ)>,
    pub(crate) mbox_completions: Vec<MailboxCommand>,
    pub(crate) unsolicited: Vec<(UnsolicitedHandler, IocbQ)>,
    /// Rings that can take work again.
    pub(crate) resumed: Vec<usize>,
    pub(crate) fatal: Option<String>,
}

impl Deferred {
    fn is_empty(&self) -> bool {
        self.iocb_completions.is_empty()
            && self.mbox_completions.is_empty()
            && self.unsolicited.is_empty()
            && self.resumed.is_empty()
            && self.fatal.is_none()
    }

    pub(crate) fn ring_resumed(&mut self, ringno: usize) {
        if !self.resumed.contains(&ringno) {
            self.resumed.push(ringno);
        }
    }
}

/// One attached adapter.
pub struct Hba {
    config: HbaConfig,
    hw: Arc<dyn Hardware>,
    slim: Arc<Slim>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    pool: IocbPool,
    state: Mutex<SliState>,
}

impl fmt::Debug for Hba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hba")
            .field("rings", &self.config.rings.len())
            .field("state", &self.hba_state())
            .finish()
    }
}

impl Hba {
    /// Validates `config`, lays out shared memory and hands it to the
    /// adapter. The adapter starts in [`HbaState::InitStart`].
    #[tracing::instrument(skip_all)]
    pub fn attach(
        config: HbaConfig,
        hw: Arc<dyn Hardware>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let slim = Arc::new(Slim::new(&config));
        let rings = config
            .rings
            .iter()
            .enumerate()
            .map(|(ringno, rc)| SliRing::new(ringno, rc))
            .collect();
        let state = SliState {
            hba_state: HbaState::InitStart,
            rings,
            mbox: MboxState::default(),
            iotags: IotagTable::new(config.max_iotags),
            fatal_listeners: Vec::new(),
            resume_listeners: Vec::new(),
        };
        let pool = IocbPool::new(config.iocb_pool_size);
        hw.attach_memory(slim.clone());
        info!(rings = config.rings.len(), "adapter attached");
        Ok(Arc::new(Self {
            config,
            hw,
            slim,
            clock,
            events,
            pool,
            state: Mutex::new(state),
        }))
    }

    pub fn config(&self) -> &HbaConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn slim(&self) -> &Arc<Slim> {
        &self.slim
    }

    pub fn hba_state(&self) -> HbaState {
        self.state.lock().hba_state
    }

    /// Takes a cleared descriptor from the pool.
    pub fn alloc_iocbq(&self) -> Option<IocbQ> {
        self.pool.get()
    }

    pub fn release_iocbq(&self, iocbq: IocbQ) {
        self.pool.release(iocbq);
    }

    pub fn pool(&self) -> &IocbPool {
        &self.pool
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SliState> {
        self.state.lock()
    }

    /// Registers a callback run after every adapter-wide failure, once the
    /// rings have been flushed.
    pub fn on_fatal<F>(&self, listener: F)
    where
        F: Fn(&Hba) + Send + Sync + 'static,
    {
        self.state.lock().fatal_listeners.push(Arc::new(listener));
    }

    /// Registers a callback run with the ring number whenever a ring can
    /// take work again: its gate lifted, the link came up, or the adapter
    /// reported room on it.
    pub fn on_ring_resumed<F>(&self, listener: F)
    where
        F: Fn(&Hba, usize) + Send + Sync + 'static,
    {
        self.state.lock().resume_listeners.push(Arc::new(listener));
    }

    /// Interrupt entry point. Reads and acknowledges the host attention
    /// register and services every source it reports.
    pub fn handle_interrupt(&self) -> HostAttention {
        let ha = self.hw.read_host_attention();
        if ha.is_empty() {
            return ha;
        }
        self.hw.clear_host_attention(ha);
        debug!(ha = ?ha, "interrupt");

        if ha.contains(HostAttention::ERATT) {
            self.handle_fatal("error attention raised by adapter");
            return ha;
        }
        if ha.contains(HostAttention::LATT) {
            let up = self.hw.link_up();
            log_event!(
                self.events,
                EventId::LinkAttention,
                Info,
                "link attention, link is {}",
                if up { "up" } else { "down" }
            );
            self.link_event(up);
        }
        if ha.contains(HostAttention::MBATT) {
            self.handle_mbox_event();
        }
        for ringno in 0..self.config.rings.len() {
            if ha.contains(HostAttention::response_event(ringno)) {
                self.handle_ring_event(ringno);
            }
            if ha.contains(HostAttention::ring_available(ringno)) {
                self.handle_ring_available(ringno);
            }
        }
        ha
    }

    /// Fires expired mailbox timeouts and re-sends stale aborts.
    pub fn run_timers(&self) {
        self.check_mbox_timeout();
        self.retry_stale_aborts();
    }

    /// Applies a link state change. FCP rings are gated while the link is
    /// down and resume once it comes back.
    pub fn link_event(&self, up: bool) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            match state.hba_state {
                HbaState::Uninitialized | HbaState::Error => {
                    warn!(up, state = ?state.hba_state, "link event ignored");
                    return;
                }
                _ => {}
            }
            state.hba_state = if up {
                HbaState::LinkUp
            } else {
                HbaState::LinkDown
            };
            info!(up, "link state changed");
            for ringno in 0..state.rings.len() {
                if state.rings[ringno].kind != RingKind::Fcp {
                    continue;
                }
                state.rings[ringno].link_gate = !up;
                if up {
                    self.resume_ring(&mut state, ringno, &mut deferred);
                    deferred.ring_resumed(ringno);
                }
            }
        }
        self.run_deferred(deferred);
    }

    /// Adapter-wide failure: fails every mailbox command and every
    /// descriptor with a fatal status, notifies the fatal listeners and asks
    /// for a reset. Nothing is retried.
    pub fn handle_fatal(&self, reason: &str) {
        let mut deferred = Deferred::default();
        let listeners = {
            let mut state = self.state.lock();
            if state.hba_state == HbaState::Error {
                return;
            }
            state.hba_state = HbaState::Error;
            log_event!(
                self.events,
                EventId::ErrorAttention,
                Error,
                "adapter failed: {reason}"
            );
            self.flush_mbox(&mut state, &mut deferred);
            for ringno in 0..state.rings.len() {
                self.flush_ring(
                    &mut state,
                    ringno,
                    IoStatus::LocalReject,
                    ioerr::SLI_DOWN,
                    &mut deferred,
                );
            }
            state.fatal_listeners.clone()
        };
        self.run_deferred(deferred);
        for listener in listeners {
            listener(self);
        }
        self.hw.request_reset();
    }

    /// Brings host side state back to what it was right after attach. Called
    /// once the platform has reset the adapter. Anything still outstanding is
    /// completed with a board reset status.
    #[tracing::instrument(skip(self))]
    pub fn restart(&self) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            state.hba_state = HbaState::Uninitialized;
            self.flush_mbox(&mut state, &mut deferred);
            for ringno in 0..state.rings.len() {
                self.flush_ring(
                    &mut state,
                    ringno,
                    IoStatus::LocalReject,
                    ioerr::SLI_BRESET,
                    &mut deferred,
                );
                state.rings[ringno].reset_indices();
            }
            state.iotags.clear();
            self.slim.reset();
            state.hba_state = HbaState::InitStart;
        }
        self.hw.attach_memory(self.slim.clone());
        self.run_deferred(deferred);
        info!("adapter restarted");
    }

    /// Completes a descriptor locally. The response is a copy of the command
    /// carrying `status` and `qualifier`.
    pub(crate) fn complete_locally(
        &self,
        mut cmd: IocbQ,
        status: IoStatus,
        qualifier: u32,
        deferred: &mut Deferred,
    ) {
        if !cmd.has_completion() {
            self.pool.release(cmd);
            return;
        }
        let mut rsp = self.pool.get().unwrap_or_else(IocbQ::empty);
        rsp.iocb = cmd.iocb.clone();
        rsp.iocb.set_io_status(status, qualifier);
        rsp.iocb.last_entry = true;
        rsp.flags |= iocb::IocbFlags::DRIVER_COMPLETED;
        cmd.flags |= iocb::IocbFlags::DRIVER_COMPLETED;
        deferred.iocb_completions.push((cmd, rsp));
    }

    /// Runs collected callbacks. Must be called without the adapter lock.
    pub(crate) fn run_deferred(&self, deferred: Deferred) {
        if deferred.is_empty() {
            return;
        }
        let Deferred {
            iocb_completions,
            mbox_completions,
            unsolicited,
            resumed,
            fatal,
        } = deferred;

        for mut mbox in mbox_completions {
            if let Some(completion) = mbox.completion.take() {
                completion(self, mbox);
            }
        }
        for (mut cmd, rsp) in iocb_completions {
            if let Some(completion) = cmd.completion.take() {
                completion(self, &cmd, &rsp);
            }
            self.pool.release(cmd);
            self.pool.release(rsp);
        }
        for (handler, frame) in unsolicited {
            handler(self, &frame);
            self.pool.release(frame);
        }
        if let Some(reason) = fatal {
            self.handle_fatal(&reason);
            return;
        }
        if resumed.is_empty() {
            return;
        }
        let listeners = self.state.lock().resume_listeners.clone();
        for ringno in resumed {
            for listener in &listeners {
                listener(self, ringno);
            }
        }
    }
}

/// Ring numbers covered by an operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingScope {
    Ring(usize),
    Adapter,
}

impl RingScope {
    pub(crate) fn rings(self, count: usize) -> std::ops::Range<usize> {
        match self {
            RingScope::Ring(ringno) if ringno < count => ringno..ringno + 1,
            RingScope::Ring(_) => 0..0,
            RingScope::Adapter => 0..count,
        }
    }
}
