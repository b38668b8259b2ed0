mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Rig, rig, rig_with};
use fchba::{HbaConfig, HbaState};
use fchba::config::{RingConfig, RingKind};
use fchba::event::EventId;
use fchba::sli::iocb::{Iocb, IocbCommand, IoStatus};
use fchba::sli::regs::ChipAttention;
use fchba::sli::ring::{IssueError, IssueFlags, RingGate};

fn small_fcp_ring() -> HbaConfig {
    HbaConfig {
        rings: vec![
            RingConfig::new(RingKind::Els, 16, 16),
            RingConfig::new(RingKind::Fcp, 4, 8),
        ],
        ..HbaConfig::default()
    }
}

#[test]
fn command_round_trip() {
    let r = rig();
    r.bring_up(true);
    let fcp = r.fcp();

    let iotag = r.issue(fcp, r.fcp_read(3, 1, 77));
    assert_ne!(iotag, 0);
    assert_eq!(r.hba.txcmplq_len(fcp), 1);
    assert_eq!(r.sim.doorbell_count(ChipAttention::command_posted(fcp)), 1);

    let cmds = r.sim.take_commands(fcp);
    assert_eq!(cmds.len(), 1);
    let cmd = &cmds[0];
    assert_eq!(cmd.opcode(), Some(IocbCommand::FcpIreadCr));
    assert_eq!((cmd.target, cmd.lun, cmd.context, cmd.iotag), (3, 1, 0x43, iotag));

    assert!(r.sim.complete(fcp, cmd, IoStatus::Success, 0));
    r.hba.handle_interrupt();

    let done = r.done();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].iotag, iotag);
    assert_eq!(done[0].context, 77);
    assert_eq!(done[0].status, IoStatus::Success);
    assert_eq!(r.hba.txcmplq_len(fcp), 0);
    assert_eq!(r.sim.doorbell_count(ChipAttention::response_consumed(fcp)), 1);
    assert_eq!(r.hba.pool().outstanding(), 0);
    assert_eq!(r.sim.malformed_commands(), 0);
}

#[test]
fn round_trip_without_iotag_table() {
    let r = rig_with(HbaConfig {
        max_iotags: None,
        ..HbaConfig::default()
    });
    r.bring_up(true);
    let fcp = r.fcp();

    let first = r.issue(fcp, r.fcp_read(0, 0, 1));
    let second = r.issue(fcp, r.fcp_read(0, 0, 2));
    assert_ne!(first, second);
    let cmds = r.sim.take_commands(fcp);
    // answer out of order
    r.sim.complete(fcp, &cmds[1], IoStatus::Success, 0);
    r.sim.complete(fcp, &cmds[0], IoStatus::Success, 0);
    r.hba.handle_interrupt();

    let contexts: Vec<u64> = r.done().iter().map(|d| d.context).collect();
    assert_eq!(contexts, [2, 1]);
}

#[test]
fn full_ring_queues_and_resumes() {
    let r = rig_with(small_fcp_ring());
    r.bring_up(true);
    let fcp = r.fcp();

    // One slot always stays empty.
    for n in 0..3 {
        r.issue(fcp, r.fcp_read(0, 0, n));
    }
    let err = r
        .hba
        .issue_iocb(fcp, r.fcp_read(0, 0, 3), IssueFlags::empty())
        .expect_err("a full ring must report busy");
    assert!(matches!(err, IssueError::Queued { .. }));
    assert!(err.is_busy());
    assert_eq!(r.hba.txq_len(fcp), 1);
    assert_eq!(
        r.sim
            .doorbell_count(ChipAttention::ring_available_request(fcp)),
        1
    );
    assert_eq!(r.events.count(EventId::RingFull), 1);

    let first = r.sim.take_commands(fcp);
    assert_eq!(first.len(), 3);
    r.hba.handle_interrupt();

    assert_eq!(r.hba.txq_len(fcp), 0);
    let rest = r.sim.take_commands(fcp);
    assert_eq!(rest.len(), 1);
    assert_eq!(r.events.count(EventId::RingResumed), 1);

    for cmd in first.iter().chain(&rest) {
        r.sim.complete(fcp, cmd, IoStatus::Success, 0);
    }
    r.hba.handle_interrupt();
    let mut contexts: Vec<u64> = r.done().iter().map(|d| d.context).collect();
    contexts.sort_unstable();
    assert_eq!(contexts, [0, 1, 2, 3]);
}

#[test]
fn return_on_busy_hands_the_descriptor_back() {
    let r = rig_with(small_fcp_ring());
    r.bring_up(true);
    let fcp = r.fcp();
    for n in 0..3 {
        r.issue(fcp, r.fcp_read(0, 0, n));
    }

    let err = r
        .hba
        .issue_iocb(fcp, r.fcp_read(0, 0, 9), IssueFlags::RETURN_ON_BUSY)
        .expect_err("a full ring must report busy");
    assert!(err.is_busy());
    let back = err.into_iocbq().expect("descriptor handed back");
    assert_eq!(back.context, 9);
    assert_eq!(back.iocb.iotag, 0);
    assert_eq!(r.hba.txq_len(fcp), 0);
    r.hba.release_iocbq(back);
}

#[test]
fn host_put_never_overtakes_device_get() {
    let r = rig_with(small_fcp_ring());
    r.bring_up(true);
    let fcp = r.fcp();
    let entries = 4;

    for round in 0..5u64 {
        for n in 0..4 {
            let _ = r
                .hba
                .issue_iocb(fcp, r.fcp_read(0, 0, round * 10 + n), IssueFlags::empty());
            let put = r.hba.host_cmd_put(fcp).unwrap();
            assert!(put < entries);
        }
        let taken = r.complete_all(fcp);
        assert!(taken.len() < entries as usize);
    }
    // drain what is still queued
    while r.done().len() < 20 {
        if r.complete_all(fcp).is_empty() {
            break;
        }
    }
    assert_eq!(r.done().len(), 20);
}

#[test]
fn link_down_holds_fcp_but_not_els() {
    let r = rig();
    r.bring_up(false);
    let (els, fcp) = (r.els(), r.fcp());
    assert_eq!(r.hba.ring_gate(fcp), Some(RingGate::BlockedByUnreachableLink));
    assert_eq!(r.hba.ring_gate(els), Some(RingGate::Open));

    let err = r
        .hba
        .issue_iocb(fcp, r.fcp_read(1, 0, 1), IssueFlags::empty())
        .expect_err("FCP must wait for the link");
    assert!(matches!(err, IssueError::Queued { .. }));
    r.issue(els, r.els_request(2));
    assert_eq!(r.sim.take_commands(els).len(), 1);
    assert!(r.sim.take_commands(fcp).is_empty());

    r.sim.set_link(true);
    r.hba.handle_interrupt();
    assert_eq!(r.hba.hba_state(), HbaState::LinkUp);
    assert_eq!(r.hba.ring_gate(fcp), Some(RingGate::Open));
    assert_eq!(r.hba.txq_len(fcp), 0);
    assert_eq!(r.sim.take_commands(fcp).len(), 1);
}

#[test]
fn drained_queue_rings_doorbell_per_batch() {
    let r = rig_with(HbaConfig {
        sync_batch: 2,
        ..HbaConfig::default()
    });
    r.bring_up(false);
    let fcp = r.fcp();
    for n in 0..5 {
        let _ = r
            .hba
            .issue_iocb(fcp, r.fcp_read(0, 0, n), IssueFlags::empty());
    }
    assert_eq!(r.hba.txq_len(fcp), 5);
    r.sim.clear_doorbells();

    r.sim.set_link(true);
    r.hba.handle_interrupt();
    assert_eq!(r.sim.doorbell_count(ChipAttention::command_posted(fcp)), 3);
    let cmds = r.sim.take_commands(fcp);
    let order: Vec<u16> = cmds.iter().map(|c| c.iotag).collect();
    let mut sorted = order.clone();
    sorted.sort_unstable();
    assert_eq!(order, sorted, "queued work goes out in submission order");
}

#[test]
fn only_bootstrap_commands_before_ready() {
    let r = rig();
    let (els, fcp) = (r.els(), r.fcp());

    let err = r
        .hba
        .issue_iocb(fcp, r.fcp_read(0, 0, 1), IssueFlags::empty())
        .expect_err("adapter is still initializing");
    assert!(matches!(err, IssueError::Rejected { .. }));
    assert!(!err.is_busy());
    if let Some(iocbq) = err.into_iocbq() {
        r.hba.release_iocbq(iocbq);
    }

    let post = r.tracked(Iocb::command(IocbCommand::QueRingBufCn), 2);
    r.issue(els, post);
    assert_eq!(r.sim.take_commands(els).len(), 1);
}

#[test]
fn multi_entry_response_is_delivered_whole() {
    let r = rig();
    r.bring_up(true);
    let els = r.els();
    let iotag = r.issue(els, r.els_request(5));
    r.sim.take_commands(els);

    let first = Iocb {
        last_entry: false,
        ..Iocb::command(IocbCommand::ElsRequestCr)
    };
    let last = Iocb {
        iotag,
        ..Iocb::command(IocbCommand::ElsRequestCr)
    };
    assert!(r.sim.post_responses(els, &[first.clone(), first, last]));
    r.hba.handle_interrupt();

    let done = r.done();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].iotag, iotag);
    assert_eq!(done[0].entries, 3);
    assert_eq!(r.hba.ring_stats(els).unwrap().iocb_rsp, 1);
}

#[test]
fn partial_response_waits_for_its_last_entry() {
    let r = rig();
    r.bring_up(true);
    let els = r.els();
    let iotag = r.issue(els, r.els_request(5));
    r.sim.take_commands(els);

    let head = Iocb {
        last_entry: false,
        ..Iocb::command(IocbCommand::ElsRequestCr)
    };
    r.sim.post_responses(els, &[head]);
    r.hba.handle_interrupt();
    assert!(r.done().is_empty());

    let tail = Iocb {
        iotag,
        ..Iocb::command(IocbCommand::ElsRequestCr)
    };
    r.sim.post_responses(els, &[tail]);
    r.hba.handle_interrupt();
    assert_eq!(r.done().len(), 1);
    assert_eq!(r.done()[0].entries, 2);
}

fn unsolicited(rctl: u8, fc_type: u8) -> Iocb {
    Iocb {
        rctl,
        fc_type,
        ..Iocb::command(IocbCommand::RcvElsReqCx)
    }
}

#[test]
fn unsolicited_frames_go_to_their_handler() {
    let r = rig();
    r.bring_up(true);
    let els = r.els();
    let plogi = Arc::new(AtomicUsize::new(0));
    let fallback = Arc::new(AtomicUsize::new(0));
    {
        let plogi = plogi.clone();
        r.hba.register_unsolicited(els, 0x22, 0x01, move |_, frame| {
            assert_eq!(frame.iocb.rctl, 0x22);
            plogi.fetch_add(1, Ordering::SeqCst);
        });
    }

    r.sim.post_responses(els, &[unsolicited(0x22, 0x01)]);
    r.hba.handle_interrupt();
    assert_eq!(plogi.load(Ordering::SeqCst), 1);

    r.sim.post_responses(els, &[unsolicited(0x32, 0x01)]);
    r.hba.handle_interrupt();
    assert_eq!(r.events.count(EventId::UnhandledUnsolicited), 1);

    {
        let fallback = fallback.clone();
        r.hba.set_default_unsolicited(els, move |_, _| {
            fallback.fetch_add(1, Ordering::SeqCst);
        });
    }
    r.sim.post_responses(els, &[unsolicited(0x32, 0x01)]);
    r.hba.handle_interrupt();
    assert_eq!(fallback.load(Ordering::SeqCst), 1);
    assert_eq!(plogi.load(Ordering::SeqCst), 1);
    assert_eq!(r.hba.pool().outstanding(), 0);
}

#[test]
fn stray_and_unknown_responses_are_logged() {
    let r = rig();
    r.bring_up(true);
    let fcp = r.fcp();

    let stray = Iocb {
        iotag: 999,
        ..Iocb::command(IocbCommand::FcpIreadCr)
    };
    r.sim.post_responses(fcp, &[stray]);
    r.hba.handle_interrupt();
    assert_eq!(r.events.count(EventId::UnmatchedCompletion), 1);
    assert_eq!(r.hba.ring_stats(fcp).unwrap().unmatched, 1);

    let unknown = Iocb {
        command: 0x7f,
        last_entry: true,
        ..Iocb::default()
    };
    r.sim.post_responses(fcp, &[unknown]);
    r.hba.handle_interrupt();
    assert_eq!(r.events.count(EventId::UnknownIocb), 1);
    assert_eq!(r.hba.hba_state(), HbaState::LinkUp);
}

fn assert_failed(r: &Rig) {
    assert_eq!(r.hba.hba_state(), HbaState::Error);
    assert_eq!(r.events.count(EventId::RingIndexInvalid), 1);
    assert_eq!(r.sim.reset_count(), 1);
}

#[test]
fn invalid_response_index_is_fatal() {
    let r = rig();
    r.bring_up(true);
    let fcp = r.fcp();
    r.issue(fcp, r.fcp_read(0, 0, 1));

    r.sim.force_rsp_put(fcp, 1000);
    r.hba.handle_interrupt();

    assert_failed(&r);
    let done = r.done();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, IoStatus::LocalReject);
}

#[test]
fn invalid_command_index_is_fatal() {
    let r = rig();
    r.bring_up(true);
    let fcp = r.fcp();
    r.sim.force_cmd_get(fcp, 64);

    let err = r
        .hba
        .issue_iocb(fcp, r.fcp_read(0, 0, 1), IssueFlags::empty())
        .expect_err("an index outside the ring must fail the issue");
    assert!(matches!(err, IssueError::Rejected { .. }));
    assert_failed(&r);
}

#[test]
fn unknown_ring_numbers_read_as_absent() {
    let r = rig();
    let ringno = r.hba.config().rings.len();
    assert_eq!(r.hba.host_cmd_put(ringno), None);
    assert_eq!(r.hba.ring_gate(ringno), None);
    assert_eq!(r.hba.ring_stats(ringno), None);
    assert_eq!(r.hba.txq_len(ringno), 0);
    assert_eq!(r.hba.host_cmd_put(r.els()), Some(0));
}
