//! Admission of SCSI commands to the adapter.
//!
//! Commands queue per logical unit. A dispatch pass walks the targets with
//! queued work round robin, and within a target its LUNs with queued work,
//! and hands one command at a time to the FCP ring until the adapter wide
//! limit is reached, the ring pushes back, or a whole round finds nothing to
//! send. Three outstanding counts bound the work on the adapter: per adapter,
//! per target and per LUN. A LUN that reports `TASK SET FULL` has its limit
//! lowered to what it is currently holding until the restore delay expires.
//!
//! High priority commands bypass the LUN queues and the limits, and go out
//! before anything else on every pass.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, info, trace};

use crate::config::{RingKind, SchedConfig};
use crate::event::EventId;
use crate::log_event;
use crate::scsi::{ScsiCommand, ScsiCompletion};
use crate::sli::abort::AbortFilter;
use crate::sli::iocb::{IoStatus, ioerr};
use crate::sli::ring::IssueFlags;
use crate::sli::{Deferred, Hba, RingScope};

/// Completion callback of a SCSI command.
pub type ScsiCallback = Box<dyn FnOnce(ScsiCompletion) + Send>;

/// Handle of a submitted command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommandId {
    key: usize,
    seq: u64,
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.seq)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CommandState {
    Queued,
    Dispatched { iotag: u16 },
}

struct Command {
    seq: u64,
    scsi: ScsiCommand,
    callback: Option<ScsiCallback>,
    target: usize,
    lun: usize,
    qfull_retries: u8,
    state: CommandState,
}

impl Command {
    fn counted(&self) -> bool {
        !self.scsi.high_priority
    }
}

struct Target {
    id: u16,
    /// Routing tag of the remote port.
    context: u16,
    outstanding: usize,
    paused: bool,
    /// LUNs with queued work; the front is the cursor.
    luns: VecDeque<usize>,
    on_ring: bool,
    by_lun: HashMap<u16, usize>,
}

struct Lun {
    target: usize,
    id: u16,
    queue: VecDeque<usize>,
    outstanding: usize,
    cap: usize,
    restore_at: Option<Instant>,
    on_ring: bool,
}

#[derive(Default)]
struct SchedState {
    commands: Slab<Command>,
    targets: Slab<Target>,
    luns: Slab<Lun>,
    by_target: HashMap<u16, usize>,
    /// Targets with queued work; the front is the cursor.
    target_ring: VecDeque<usize>,
    high_priority: VecDeque<usize>,
    outstanding: usize,
    paused: bool,
    next_seq: u64,
}

impl SchedState {
    fn target_key(&mut self, id: u16) -> usize {
        if let Some(&key) = self.by_target.get(&id) {
            return key;
        }
        let key = self.targets.insert(Target {
            id,
            context: id,
            outstanding: 0,
            paused: false,
            luns: VecDeque::new(),
            on_ring: false,
            by_lun: HashMap::new(),
        });
        self.by_target.insert(id, key);
        key
    }

    fn lun_key(&mut self, target: usize, id: u16, cap: usize) -> usize {
        if let Some(&key) = self.targets[target].by_lun.get(&id) {
            return key;
        }
        let key = self.luns.insert(Lun {
            target,
            id,
            queue: VecDeque::new(),
            outstanding: 0,
            cap,
            restore_at: None,
            on_ring: false,
        });
        self.targets[target].by_lun.insert(id, key);
        key
    }

    fn find_lun(&self, target: u16, lun: u16) -> Option<usize> {
        let tkey = *self.by_target.get(&target)?;
        self.targets[tkey].by_lun.get(&lun).copied()
    }

    /// Puts a LUN with queued work, and its target, on the rings.
    fn link(&mut self, lkey: usize) {
        let lun = &mut self.luns[lkey];
        if lun.on_ring || lun.queue.is_empty() {
            return;
        }
        lun.on_ring = true;
        let target = &mut self.targets[lun.target];
        target.luns.push_back(lkey);
        if !target.on_ring {
            target.on_ring = true;
            self.target_ring.push_back(lun.target);
        }
    }

    /// Takes a LUN without queued work off its target's ring, and the target
    /// off the adapter ring once it has no such LUN left.
    fn unlink_if_idle(&mut self, lkey: usize) {
        let lun = &mut self.luns[lkey];
        if !lun.on_ring || !lun.queue.is_empty() {
            return;
        }
        lun.on_ring = false;
        let tkey = lun.target;
        let target = &mut self.targets[tkey];
        target.luns.retain(|&k| k != lkey);
        if target.luns.is_empty() && target.on_ring {
            target.on_ring = false;
            self.target_ring.retain(|&k| k != tkey);
        }
    }

    fn enqueue(&mut self, ckey: usize, front: bool) {
        let cmd = &self.commands[ckey];
        if cmd.scsi.high_priority {
            if front {
                self.high_priority.push_front(ckey);
            } else {
                self.high_priority.push_back(ckey);
            }
            return;
        }
        let lkey = cmd.lun;
        if front {
            self.luns[lkey].queue.push_front(ckey);
        } else {
            self.luns[lkey].queue.push_back(ckey);
        }
        self.link(lkey);
    }

    /// Removes queued commands selected by `pick` from every queue.
    fn take_queued<F>(&mut self, pick: F) -> Vec<Command>
    where
        F: Fn(&Command) -> bool,
    {
        let mut taken = Vec::new();
        let mut touched = Vec::new();
        {
            let commands = &self.commands;
            let (hp_taken, hp_kept): (Vec<usize>, Vec<usize>) = self
                .high_priority
                .drain(..)
                .partition(|&k| pick(&commands[k]));
            self.high_priority = hp_kept.into();
            taken.extend(hp_taken);

            for (lkey, lun) in self.luns.iter_mut() {
                let before = lun.queue.len();
                lun.queue.retain(|&k| {
                    if pick(&commands[k]) {
                        taken.push(k);
                        false
                    } else {
                        true
                    }
                });
                if lun.queue.len() != before {
                    touched.push(lkey);
                }
            }
        }
        for lkey in touched {
            self.unlink_if_idle(lkey);
        }
        taken.into_iter().map(|k| self.commands.remove(k)).collect()
    }

    fn check_caps(&self, config: &SchedConfig) -> bool {
        let targets_ok = self
            .targets
            .iter()
            .all(|(_, t)| t.outstanding <= config.target_max_outstanding as usize);
        let luns_ok = self
            .luns
            .iter()
            .all(|(_, l)| l.outstanding <= config.lun_max_outstanding as usize);
        self.outstanding <= config.hba_max_outstanding as usize && targets_ok && luns_ok
    }
}

struct SchedInner {
    me: Weak<SchedInner>,
    hba: Arc<Hba>,
    ringno: usize,
    config: SchedConfig,
    state: Mutex<SchedState>,
}

/// Admission scheduler in front of the FCP ring of one adapter.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("ringno", &self.inner.ringno)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Scheduler {
    /// Attaches a scheduler to the FCP ring of `hba`. Queued commands fail
    /// with the adapter when it hits a fatal error, and go out again when
    /// the ring resumes after a gate or a full ring.
    pub fn new(hba: Arc<Hba>, config: SchedConfig) -> Result<Self> {
        config.validate()?;
        let ringno = hba
            .config()
            .ring_of_kind(RingKind::Fcp)
            .ok_or_else(|| eyre!("adapter has no FCP ring"))?;
        let inner = Arc::new_cyclic(|me| SchedInner {
            me: me.clone(),
            hba: hba.clone(),
            ringno,
            config,
            state: Mutex::new(SchedState::default()),
        });
        let weak = Arc::downgrade(&inner);
        hba.on_fatal(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.fail_queued(IoStatus::LocalReject, ioerr::SLI_DOWN);
            }
        });
        let weak = Arc::downgrade(&inner);
        hba.on_ring_resumed(move |_, resumed| {
            if let Some(inner) = weak.upgrade() {
                if resumed == inner.ringno {
                    inner.dispatch();
                }
            }
        });
        info!(ringno, "scheduler attached");
        Ok(Self { inner })
    }

    /// Sets the routing tag used for commands to `target`. Targets seen for
    /// the first time in [`Scheduler::submit`] use their own id.
    pub fn add_target(&self, target: u16, context: u16) {
        let mut st = self.inner.state.lock();
        let key = st.target_key(target);
        st.targets[key].context = context;
    }

    /// Queues `cmd`. `callback` runs exactly once with the final result.
    pub fn submit<F>(&self, cmd: ScsiCommand, callback: F) -> CommandId
    where
        F: FnOnce(ScsiCompletion) + Send + 'static,
    {
        self.inner.submit(cmd, Box::new(callback))
    }

    /// Restores throttled queue depths whose delay expired, then dispatches.
    pub fn run_timers(&self) {
        self.inner.restore_caps();
        self.inner.dispatch();
    }

    /// Runs a dispatch pass.
    pub fn dispatch(&self) {
        self.inner.dispatch();
    }

    pub fn pause_target(&self, target: u16) {
        self.inner.set_paused(Some(target), true);
    }

    pub fn continue_target(&self, target: u16) {
        self.inner.set_paused(Some(target), false);
    }

    pub fn pause_hba(&self) {
        self.inner.set_paused(None, true);
    }

    pub fn continue_hba(&self) {
        self.inner.set_paused(None, false);
    }

    /// Fails queued commands for one LUN and aborts the dispatched ones.
    pub fn flush_lun(&self, target: u16, lun: u16) -> usize {
        self.inner.flush(
            move |c| c.scsi.target == target && c.scsi.lun == lun,
            AbortFilter::TargetLun(target, lun),
        )
    }

    pub fn flush_target(&self, target: u16) -> usize {
        self.inner
            .flush(move |c| c.scsi.target == target, AbortFilter::Target(target))
    }

    pub fn flush_hba(&self) -> usize {
        self.inner.flush(|_| true, AbortFilter::All)
    }

    /// Cancels one command. Returns false if it already completed.
    pub fn abort_command(&self, id: CommandId) -> bool {
        self.inner.abort_command(id)
    }

    /// Commands on the adapter, high priority ones excluded.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    pub fn target_outstanding(&self, target: u16) -> usize {
        let st = self.inner.state.lock();
        st.by_target
            .get(&target)
            .map_or(0, |&k| st.targets[k].outstanding)
    }

    pub fn lun_outstanding(&self, target: u16, lun: u16) -> usize {
        let st = self.inner.state.lock();
        st.find_lun(target, lun)
            .map_or(0, |k| st.luns[k].outstanding)
    }

    /// Current queue depth limit of a LUN.
    pub fn lun_cap(&self, target: u16, lun: u16) -> usize {
        let st = self.inner.state.lock();
        st.find_lun(target, lun).map_or(
            self.inner.config.lun_max_outstanding as usize,
            |k| st.luns[k].cap,
        )
    }

    /// Commands waiting in the queue of a LUN.
    pub fn queued(&self, target: u16, lun: u16) -> usize {
        let st = self.inner.state.lock();
        st.find_lun(target, lun).map_or(0, |k| st.luns[k].queue.len())
    }

    /// Commands waiting anywhere, high priority included.
    pub fn total_queued(&self) -> usize {
        let st = self.inner.state.lock();
        st.high_priority.len() + st.luns.iter().map(|(_, l)| l.queue.len()).sum::<usize>()
    }

    /// Whether every outstanding count is within its configured limit.
    pub fn caps_hold(&self) -> bool {
        self.inner.state.lock().check_caps(&self.inner.config)
    }

    /// Targets and LUNs currently holding queued work, in ring order.
    pub fn ring_members(&self) -> Vec<(u16, Vec<u16>)> {
        let st = self.inner.state.lock();
        st.target_ring
            .iter()
            .map(|&t| {
                let target = &st.targets[t];
                let luns = target.luns.iter().map(|&l| st.luns[l].id).collect();
                (target.id, luns)
            })
            .collect()
    }
}

impl SchedInner {
    fn submit(&self, scsi: ScsiCommand, callback: ScsiCallback) -> CommandId {
        let mut deferred = Deferred::default();
        let id = {
            let mut st = self.state.lock();
            let target = st.target_key(scsi.target);
            let lun = st.lun_key(target, scsi.lun, self.config.lun_max_outstanding as usize);
            let seq = st.next_seq;
            st.next_seq += 1;
            let key = st.commands.insert(Command {
                seq,
                scsi,
                callback: Some(callback),
                target,
                lun,
                qfull_retries: 0,
                state: CommandState::Queued,
            });
            let id = CommandId { key, seq };
            trace!(%id, "command submitted");

            if self.fast_path_open(&st, key) && self.try_issue(&mut st, key, &mut deferred) {
                trace!(%id, "dispatched on the fast path");
            } else {
                st.enqueue(key, false);
            }
            self.dispatch_locked(&mut st, &mut deferred);
            id
        };
        self.hba.run_deferred(deferred);
        id
    }

    /// A normal command for an idle LUN queue goes out directly when no
    /// limit or pause stands in the way.
    fn fast_path_open(&self, st: &SchedState, key: usize) -> bool {
        let cmd = &st.commands[key];
        let target = &st.targets[cmd.target];
        let lun = &st.luns[cmd.lun];
        cmd.counted()
            && st.high_priority.is_empty()
            && lun.queue.is_empty()
            && !st.paused
            && !target.paused
            && st.outstanding < self.config.hba_max_outstanding as usize
            && target.outstanding < self.config.target_max_outstanding as usize
            && lun.outstanding < lun.cap
    }

    fn dispatch(&self) {
        let mut deferred = Deferred::default();
        {
            let mut st = self.state.lock();
            self.dispatch_locked(&mut st, &mut deferred);
        }
        self.hba.run_deferred(deferred);
    }

    fn dispatch_locked(&self, st: &mut SchedState, deferred: &mut Deferred) {
        if st.paused {
            return;
        }

        let mut i = 0;
        while i < st.high_priority.len() {
            let key = st.high_priority[i];
            if st.targets[st.commands[key].target].paused {
                i += 1;
                continue;
            }
            st.high_priority.remove(i);
            if !self.try_issue(st, key, deferred) {
                st.high_priority.insert(i, key);
                return;
            }
        }

        let hba_cap = self.config.hba_max_outstanding as usize;
        let target_cap = self.config.target_max_outstanding as usize;
        let mut idle = 0;
        while st.outstanding < hba_cap && idle < st.target_ring.len() {
            let tkey = st.target_ring[0];
            let target = &st.targets[tkey];
            let pick = if target.paused || target.outstanding >= target_cap {
                None
            } else {
                target.luns.iter().position(|&l| {
                    let lun = &st.luns[l];
                    lun.outstanding < lun.cap && !lun.queue.is_empty()
                })
            };
            let Some(pos) = pick else {
                st.target_ring.rotate_left(1);
                idle += 1;
                continue;
            };
            let lkey = st.targets[tkey].luns[pos];
            let Some(ckey) = st.luns[lkey].queue.pop_front() else {
                break;
            };
            if !self.try_issue(st, ckey, deferred) {
                st.luns[lkey].queue.push_front(ckey);
                break;
            }
            st.targets[tkey].luns.rotate_left(pos + 1);
            st.target_ring.rotate_left(1);
            st.unlink_if_idle(lkey);
            idle = 0;
        }
    }

    /// Hands one command to the ring. False when the ring pushed back.
    fn try_issue(&self, st: &mut SchedState, ckey: usize, deferred: &mut Deferred) -> bool {
        let cmd = &st.commands[ckey];
        let Some(mut iocbq) = self.hba.alloc_iocbq() else {
            trace!("descriptor pool exhausted");
            return false;
        };
        iocbq.iocb = cmd.scsi.to_iocb(st.targets[cmd.target].context);
        iocbq.context = cmd.seq;
        let seq = cmd.seq;
        let me = self.me.clone();
        iocbq.set_completion(move |_, _, rsp| {
            if let Some(inner) = me.upgrade() {
                inner.complete(ckey, seq, ScsiCompletion::from_response(&rsp.iocb));
            }
        });

        match self
            .hba
            .issue_deferred(self.ringno, iocbq, IssueFlags::RETURN_ON_BUSY, deferred)
        {
            Ok(iotag) => {
                let cmd = &mut st.commands[ckey];
                cmd.state = CommandState::Dispatched { iotag };
                if cmd.counted() {
                    let (tkey, lkey) = (cmd.target, cmd.lun);
                    st.outstanding += 1;
                    st.targets[tkey].outstanding += 1;
                    st.luns[lkey].outstanding += 1;
                }
                trace!(seq, iotag, "command dispatched");
                true
            }
            Err(err) => {
                debug!(seq, %err, "dispatch pushed back");
                if let Some(iocbq) = err.into_iocbq() {
                    self.hba.release_iocbq(iocbq);
                }
                false
            }
        }
    }

    fn complete(&self, ckey: usize, seq: u64, completion: ScsiCompletion) {
        let mut deferred = Deferred::default();
        let mut deliver = None;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let Some(cmd) = st.commands.get_mut(ckey).filter(|c| c.seq == seq) else {
                return;
            };
            if cmd.state == CommandState::Queued {
                return;
            }
            cmd.state = CommandState::Queued;
            let (tkey, lkey, counted) = (cmd.target, cmd.lun, cmd.counted());
            let retry = completion.is_queue_full() && cmd.qfull_retries < self.config.qfull_retries;
            if retry {
                cmd.qfull_retries += 1;
            }
            if counted {
                st.outstanding = st.outstanding.saturating_sub(1);
                let target = &mut st.targets[tkey];
                target.outstanding = target.outstanding.saturating_sub(1);
                let lun = &mut st.luns[lkey];
                lun.outstanding = lun.outstanding.saturating_sub(1);
            }

            if retry {
                let now = self.hba.clock().now();
                let target_id = st.targets[tkey].id;
                let lun = &mut st.luns[lkey];
                lun.cap = lun.outstanding.max(1);
                lun.restore_at = Some(now + self.config.qfull_restore_delay);
                log_event!(
                    self.hba.events(),
                    EventId::QueueFullRetry,
                    Warning,
                    "target {target_id} lun {}: queue full, depth lowered to {}, retrying",
                    lun.id,
                    lun.cap
                );
                st.enqueue(ckey, true);
            } else {
                if completion.is_queue_full() {
                    log_event!(
                        self.hba.events(),
                        EventId::QueueFullExhausted,
                        Error,
                        "target {} lun {}: queue full retries exhausted",
                        st.targets[tkey].id,
                        st.luns[lkey].id
                    );
                }
                let cmd = st.commands.remove(ckey);
                deliver = cmd.callback.map(|cb| (cb, completion));
            }
            self.dispatch_locked(st, &mut deferred);
        }
        self.hba.run_deferred(deferred);
        if let Some((callback, completion)) = deliver {
            callback(completion);
        }
    }

    fn restore_caps(&self) {
        let now = self.hba.clock().now();
        let base = self.config.lun_max_outstanding as usize;
        let mut st = self.state.lock();
        let SchedState { luns, targets, .. } = &mut *st;
        for (_, lun) in luns.iter_mut() {
            if lun.restore_at.is_some_and(|at| now >= at) {
                lun.restore_at = None;
                lun.cap = base;
                log_event!(
                    self.hba.events(),
                    EventId::QueueDepthRestored,
                    Info,
                    "target {} lun {}: queue depth restored to {base}",
                    targets[lun.target].id,
                    lun.id
                );
            }
        }
    }

    fn set_paused(&self, target: Option<u16>, paused: bool) {
        {
            let mut st = self.state.lock();
            match target {
                Some(id) => {
                    let key = st.target_key(id);
                    st.targets[key].paused = paused;
                }
                None => st.paused = paused,
            }
            debug!(?target, paused, "pause state changed");
        }
        if !paused {
            self.dispatch();
        }
    }

    /// Completes every queued command with `status`, leaving all rings empty.
    fn fail_queued(&self, status: IoStatus, qualifier: u32) {
        let failed = self.state.lock().take_queued(|_| true);
        if !failed.is_empty() {
            info!(count = failed.len(), qualifier, "queued commands failed");
        }
        deliver_local(failed, status, qualifier);
    }

    fn flush<F>(&self, pick: F, filter: AbortFilter) -> usize
    where
        F: Fn(&Command) -> bool,
    {
        let failed = self.state.lock().take_queued(pick);
        let count = failed.len();
        deliver_local(failed, IoStatus::DriverReject, ioerr::SLI_ABORTED);
        let report = self.hba.abort(filter, RingScope::Ring(self.ringno));
        debug!(queued = count, ?report, "flush");
        count + report.total()
    }

    fn abort_command(&self, id: CommandId) -> bool {
        let iotag = {
            let mut st = self.state.lock();
            let Some(cmd) = st.commands.get(id.key).filter(|c| c.seq == id.seq) else {
                return false;
            };
            let state = cmd.state;
            match state {
                CommandState::Dispatched { iotag } => iotag,
                CommandState::Queued => {
                    let taken = st.take_queued(|c| c.seq == id.seq);
                    drop(st);
                    deliver_local(taken, IoStatus::DriverReject, ioerr::SLI_ABORTED);
                    return true;
                }
            }
        };
        let report = self
            .hba
            .abort(AbortFilter::Iotag(iotag), RingScope::Ring(self.ringno));
        report.total() > 0
    }
}

fn deliver_local(commands: Vec<Command>, status: IoStatus, qualifier: u32) {
    for cmd in commands {
        if let Some(callback) = cmd.callback {
            callback(ScsiCompletion::local(status, qualifier));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::command;

    fn queue(st: &mut SchedState, target: u16, lun: u16) -> usize {
        let tkey = st.target_key(target);
        let lkey = st.lun_key(tkey, lun, 4);
        let seq = st.next_seq;
        st.next_seq += 1;
        let key = st.commands.insert(Command {
            seq,
            scsi: ScsiCommand::new(target, lun, command::test_unit_ready()),
            callback: None,
            target: tkey,
            lun: lkey,
            qfull_retries: 0,
            state: CommandState::Queued,
        });
        st.enqueue(key, false);
        key
    }

    #[test]
    fn rings_hold_only_units_with_work() {
        let mut st = SchedState::default();
        queue(&mut st, 1, 0);
        queue(&mut st, 1, 1);
        queue(&mut st, 2, 0);
        assert_eq!(st.target_ring.len(), 2);
        assert_eq!(st.targets[st.by_target[&1]].luns.len(), 2);

        let taken = st.take_queued(|c| c.scsi.target == 1 && c.scsi.lun == 0);
        assert_eq!(taken.len(), 1);
        assert_eq!(st.targets[st.by_target[&1]].luns.len(), 1);

        st.take_queued(|c| c.scsi.target == 1);
        assert_eq!(st.target_ring.len(), 1);
        assert_eq!(st.target_ring[0], st.by_target[&2]);
    }

    #[test]
    fn requeue_goes_to_the_front() {
        let mut st = SchedState::default();
        let first = queue(&mut st, 1, 0);
        let second = queue(&mut st, 1, 0);
        let lkey = st.find_lun(1, 0).unwrap();
        let popped = st.luns[lkey].queue.pop_front().unwrap();
        assert_eq!(popped, first);
        st.enqueue(popped, true);
        assert_eq!(st.luns[lkey].queue, VecDeque::from([first, second]));
        // still linked exactly once
        assert_eq!(st.targets[st.by_target[&1]].luns.len(), 1);
    }

    #[test]
    fn high_priority_skips_lun_queues() {
        let mut st = SchedState::default();
        let tkey = st.target_key(3);
        let lkey = st.lun_key(tkey, 0, 4);
        let key = st.commands.insert(Command {
            seq: 0,
            scsi: ScsiCommand::new(3, 0, command::inquiry()).high_priority(),
            callback: None,
            target: tkey,
            lun: lkey,
            qfull_retries: 0,
            state: CommandState::Queued,
        });
        st.enqueue(key, false);
        assert_eq!(st.high_priority.len(), 1);
        assert!(st.target_ring.is_empty());
        assert_eq!(st.take_queued(|_| true).len(), 1);
        assert!(st.high_priority.is_empty());
    }
}
