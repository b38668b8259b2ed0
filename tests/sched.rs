mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::{Rig, rig, rig_with};
use fchba::config::{RingConfig, RingKind};
use fchba::event::EventId;
use fchba::scsi::{ScsiCommand, ScsiCompletion, ScsiStatus, command};
use fchba::sim::MailboxBehavior;
use fchba::sli::mailbox::{MailboxCommand, MboxMode, MbxOpcode, mbx_status};
use fchba::sli::iocb::{IocbCommand, Iocb, IoStatus, ioerr};
use fchba::{HbaConfig, SchedConfig, Scheduler};

type Results = Arc<Mutex<Vec<(u32, ScsiCompletion)>>>;

struct Harness {
    r: Rig,
    sched: Scheduler,
    results: Results,
}

fn harness(config: SchedConfig) -> Harness {
    harness_with(HbaConfig::default(), config)
}

fn harness_with(hba: HbaConfig, config: SchedConfig) -> Harness {
    let r = rig_with(hba);
    r.bring_up(true);
    let sched = Scheduler::new(r.hba.clone(), config).unwrap();
    Harness {
        r,
        sched,
        results: Results::default(),
    }
}

impl Harness {
    /// Submits a READ(10) whose LBA doubles as a tag for the result list.
    fn read(&self, target: u16, lun: u16, tag: u32) -> fchba::CommandId {
        self.submit(ScsiCommand::new(target, lun, command::read10(tag, 1, 512)))
    }

    fn submit(&self, cmd: ScsiCommand) -> fchba::CommandId {
        let results = self.results.clone();
        let tag = u32::from_be_bytes(cmd.block.get()[2..6].try_into().unwrap());
        self.sched
            .submit(cmd, move |c| results.lock().push((tag, c)))
    }

    fn take(&self) -> Vec<Iocb> {
        self.r.sim.take_commands(self.r.fcp())
    }

    fn answer(&self, cmd: &Iocb, scsi_status: ScsiStatus) {
        let fcp = self.r.fcp();
        assert!(self.r.sim.respond(fcp, cmd, |rsp| {
            if scsi_status != ScsiStatus::Good {
                rsp.set_io_status(IoStatus::FcpRspError, 0);
                rsp.scsi_status = scsi_status.raw();
            }
        }));
        self.r.hba.handle_interrupt();
    }

    fn results(&self) -> Vec<(u32, ScsiCompletion)> {
        self.results.lock().clone()
    }
}

fn lba(iocb: &Iocb) -> u32 {
    u32::from_be_bytes(iocb.payload_bytes()[2..6].try_into().unwrap())
}

#[test]
fn lun_depth_limits_dispatch() {
    let h = harness(SchedConfig {
        hba_max_outstanding: 10,
        target_max_outstanding: 10,
        lun_max_outstanding: 2,
        ..SchedConfig::default()
    });
    for tag in 0..5 {
        h.read(0, 0, tag);
    }
    let first = h.take();
    assert_eq!(first.iter().map(lba).collect::<Vec<_>>(), [0, 1]);
    assert_eq!(h.sched.queued(0, 0), 3);
    assert_eq!(h.sched.lun_outstanding(0, 0), 2);

    h.answer(&first[0], ScsiStatus::Good);
    let next = h.take();
    assert_eq!(next.iter().map(lba).collect::<Vec<_>>(), [2]);
    assert_eq!(h.sched.queued(0, 0), 2);
    assert_eq!(h.results().len(), 1);
    assert!(h.results()[0].1.is_success());
}

#[test]
fn targets_take_turns() {
    let h = harness(SchedConfig {
        hba_max_outstanding: 1,
        ..SchedConfig::default()
    });
    h.read(1, 0, 10);
    h.read(1, 0, 11);
    h.read(1, 0, 12);
    h.read(2, 0, 20);

    let mut order = Vec::new();
    for _ in 0..4 {
        let cmds = h.take();
        assert_eq!(cmds.len(), 1);
        order.push(lba(&cmds[0]));
        h.answer(&cmds[0], ScsiStatus::Good);
    }
    assert_eq!(order, [10, 11, 20, 12]);
    assert!(h.sched.ring_members().is_empty());
}

#[test]
fn luns_take_turns_within_a_target() {
    let h = harness(SchedConfig {
        target_max_outstanding: 1,
        ..SchedConfig::default()
    });
    h.read(1, 0, 10);
    h.read(1, 0, 11);
    h.read(1, 0, 12);
    h.read(1, 1, 20);
    assert_eq!(h.sched.ring_members(), [(1, vec![0, 1])]);

    let mut order = Vec::new();
    for _ in 0..4 {
        let cmds = h.take();
        assert_eq!(cmds.len(), 1);
        order.push(lba(&cmds[0]));
        h.answer(&cmds[0], ScsiStatus::Good);
    }
    assert_eq!(order, [10, 11, 20, 12]);
}

#[test]
fn routing_tag_follows_the_target() {
    let h = harness(SchedConfig::default());
    h.sched.add_target(6, 0x1234);
    h.read(6, 2, 0);
    h.read(7, 0, 1);
    let cmds = h.take();
    assert_eq!(cmds[0].context, 0x1234);
    assert_eq!((cmds[0].target, cmds[0].lun), (6, 2));
    assert_eq!(cmds[0].opcode(), Some(IocbCommand::FcpIreadCr));
    assert_eq!(cmds[1].context, 7);
}

#[test]
fn queue_full_lowers_depth_and_retries() {
    let h = harness(SchedConfig {
        lun_max_outstanding: 4,
        qfull_restore_delay: Duration::from_secs(5),
        ..SchedConfig::default()
    });
    for tag in 0..5 {
        h.read(0, 0, tag);
    }
    let cmds = h.take();
    assert_eq!(cmds.len(), 4);

    h.answer(&cmds[0], ScsiStatus::TaskSetFull);
    assert_eq!(h.sched.lun_cap(0, 0), 3);
    assert_eq!(h.sched.lun_outstanding(0, 0), 3);
    assert_eq!(h.sched.queued(0, 0), 2);
    assert_eq!(h.r.events.count(EventId::QueueFullRetry), 1);
    assert!(h.take().is_empty());
    assert!(h.results().is_empty());

    // the retried command goes out ahead of newer work
    h.answer(&cmds[1], ScsiStatus::Good);
    let retry = h.take();
    assert_eq!(retry.iter().map(lba).collect::<Vec<_>>(), [0]);

    h.r.clock.advance(Duration::from_secs(5));
    h.sched.run_timers();
    assert_eq!(h.sched.lun_cap(0, 0), 4);
    assert_eq!(h.r.events.count(EventId::QueueDepthRestored), 1);
    assert_eq!(h.take().iter().map(lba).collect::<Vec<_>>(), [4]);
}

#[test]
fn queue_full_retries_run_out() {
    let h = harness(SchedConfig {
        qfull_retries: 1,
        ..SchedConfig::default()
    });
    h.read(0, 0, 0);
    let cmd = h.take();
    h.answer(&cmd[0], ScsiStatus::TaskSetFull);
    let retry = h.take();
    assert_eq!(retry.len(), 1);
    h.answer(&retry[0], ScsiStatus::TaskSetFull);

    let results = h.results();
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_queue_full());
    assert_eq!(h.r.events.count(EventId::QueueFullExhausted), 1);
    assert_eq!(h.sched.outstanding(), 0);
}

#[test]
fn lowered_depth_never_drops_to_zero() {
    let h = harness(SchedConfig::default());
    h.read(0, 0, 0);
    let cmd = h.take();
    h.answer(&cmd[0], ScsiStatus::TaskSetFull);
    assert_eq!(h.sched.lun_cap(0, 0), 1);
    assert_eq!(h.take().len(), 1);
}

#[test]
fn paused_target_holds_its_work() {
    let h = harness(SchedConfig::default());
    h.sched.pause_target(3);
    h.read(3, 0, 0);
    h.read(4, 0, 1);
    assert_eq!(h.take().iter().map(lba).collect::<Vec<_>>(), [1]);
    assert_eq!(h.sched.queued(3, 0), 1);

    h.sched.continue_target(3);
    assert_eq!(h.take().iter().map(lba).collect::<Vec<_>>(), [0]);
}

#[test]
fn paused_adapter_holds_everything() {
    let h = harness(SchedConfig::default());
    h.sched.pause_hba();
    h.read(3, 0, 0);
    h.submit(ScsiCommand::new(4, 0, command::read10(1, 1, 512)).high_priority());
    assert!(h.take().is_empty());
    assert_eq!(h.sched.total_queued(), 2);

    h.sched.continue_hba();
    let mut sent = h.take().iter().map(lba).collect::<Vec<_>>();
    sent.sort_unstable();
    assert_eq!(sent, [0, 1]);
}

#[test]
fn high_priority_ignores_depth_limits() {
    let h = harness(SchedConfig {
        lun_max_outstanding: 1,
        ..SchedConfig::default()
    });
    h.read(0, 0, 0);
    h.read(0, 0, 1);
    h.submit(ScsiCommand::new(0, 0, command::test_unit_ready()).high_priority());

    let cmds = h.take();
    assert_eq!(cmds.len(), 2);
    assert_eq!(cmds[1].opcode(), Some(IocbCommand::FcpIcmndCr));
    assert_eq!(h.sched.outstanding(), 1);
    assert_eq!(h.sched.queued(0, 0), 1);

    h.answer(&cmds[1], ScsiStatus::Good);
    assert_eq!(h.sched.outstanding(), 1);
    assert!(h.take().is_empty());
}

#[test]
fn full_ring_pushes_back_into_the_lun_queue() {
    let h = harness_with(
        HbaConfig {
            rings: vec![
                RingConfig::new(RingKind::Els, 16, 16),
                RingConfig::new(RingKind::Fcp, 4, 8),
            ],
            ..HbaConfig::default()
        },
        SchedConfig::default(),
    );
    for tag in 0..5 {
        h.read(0, 0, tag);
    }
    let fcp = h.r.fcp();
    assert_eq!(h.r.hba.txq_len(fcp), 0);
    assert_eq!(h.sched.queued(0, 0), 2);
    assert_eq!(h.sched.outstanding(), 3);

    let cmds = h.take();
    assert_eq!(cmds.len(), 3);
    h.answer(&cmds[0], ScsiStatus::Good);
    assert_eq!(h.take().iter().map(lba).collect::<Vec<_>>(), [3, 4]);
}

#[test]
fn work_waits_for_the_link() {
    let r = rig();
    r.bring_up(false);
    let sched = Scheduler::new(r.hba.clone(), SchedConfig::default()).unwrap();
    sched.submit(ScsiCommand::new(0, 0, command::test_unit_ready()), |_| {});
    assert_eq!(sched.queued(0, 0), 1);
    assert_eq!(r.hba.txq_len(r.fcp()), 0);

    r.sim.set_link(true);
    r.hba.handle_interrupt();
    assert_eq!(sched.queued(0, 0), 0);
    assert_eq!(r.sim.take_commands(r.fcp()).len(), 1);
}

#[test]
fn work_resumes_after_ring_reconfiguration() {
    let h = harness(SchedConfig::default());
    h.r.sim.set_mailbox_behavior(MailboxBehavior::Stall);
    h.r.hba
        .issue_mbox(MailboxCommand::new(MbxOpcode::ConfigRing), MboxMode::NoWait)
        .unwrap();

    h.read(0, 0, 1);
    h.read(1, 0, 2);
    assert_eq!(h.sched.total_queued(), 2);
    assert_eq!(h.sched.outstanding(), 0);
    assert_eq!(h.r.hba.txq_len(h.r.fcp()), 0);

    assert!(h.r.sim.complete_mailbox(mbx_status::SUCCESS));
    h.r.hba.handle_interrupt();
    assert_eq!(h.sched.total_queued(), 0);
    assert_eq!(h.take().iter().map(lba).collect::<Vec<_>>(), [1, 2]);
}

#[test]
fn room_on_the_ring_resumes_dispatch() {
    let h = harness_with(
        HbaConfig {
            rings: vec![
                RingConfig::new(RingKind::Els, 16, 16),
                RingConfig::new(RingKind::Fcp, 4, 8),
            ],
            ..HbaConfig::default()
        },
        SchedConfig::default(),
    );
    for tag in 0..5 {
        h.read(0, 0, tag);
    }
    assert_eq!(h.sched.queued(0, 0), 2);

    // the adapter fetches without answering yet
    assert_eq!(h.take().len(), 3);
    h.r.hba.handle_interrupt();
    assert_eq!(h.sched.queued(0, 0), 0);
    assert_eq!(h.take().iter().map(lba).collect::<Vec<_>>(), [3, 4]);
    assert!(h.results().is_empty());
}

#[test]
fn flush_lun_rejects_queued_and_aborts_dispatched() {
    let h = harness(SchedConfig {
        lun_max_outstanding: 1,
        ..SchedConfig::default()
    });
    for tag in 0..3 {
        h.read(2, 5, tag);
    }
    h.read(2, 6, 9);
    let dispatched = h.take();
    assert_eq!(dispatched.len(), 2);

    assert_eq!(h.sched.flush_lun(2, 5), 3);
    let rejected = h.results();
    assert_eq!(rejected.len(), 2);
    assert!(rejected.iter().all(|(_, c)| c.status == IoStatus::DriverReject
        && c.qualifier == ioerr::SLI_ABORTED));

    let aborts = h.take();
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0].opcode(), Some(IocbCommand::AbortXriCn));
    assert_eq!((aborts[0].target, aborts[0].lun), (2, 5));
    assert!(h.r.sim.ack_abort(h.r.fcp(), &aborts[0]));
    h.r.hba.handle_interrupt();

    let results = h.results();
    assert_eq!(results.len(), 3);
    assert_eq!(results[2].0, 0);
    assert_eq!(results[2].1.status, IoStatus::LocalReject);
    assert_eq!(h.sched.lun_outstanding(2, 5), 0);
    assert_eq!(h.sched.queued(2, 6), 0);
}

#[test]
fn abort_command_by_id() {
    let h = harness(SchedConfig {
        lun_max_outstanding: 1,
        ..SchedConfig::default()
    });
    let running = h.read(0, 0, 0);
    let waiting = h.read(0, 0, 1);
    h.take();

    assert!(h.sched.abort_command(waiting));
    assert_eq!(h.results().len(), 1);
    assert_eq!(h.results()[0].0, 1);
    assert_eq!(h.results()[0].1.status, IoStatus::DriverReject);
    assert!(!h.sched.abort_command(waiting));

    assert!(h.sched.abort_command(running));
    let abort = h.take();
    assert_eq!(abort.len(), 1);
    h.r.sim.ack_abort(h.r.fcp(), &abort[0]);
    h.r.hba.handle_interrupt();
    assert_eq!(h.results().len(), 2);
    assert!(!h.sched.abort_command(running));
}
