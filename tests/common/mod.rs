#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use fchba::clock::ManualClock;
use fchba::config::{HbaConfig, RingKind};
use fchba::event::RecordingSink;
use fchba::sim::SimAdapter;
use fchba::sli::iocb::{Iocb, IocbCommand, IocbQ, IoStatus};
use fchba::sli::mailbox::{MailboxCommand, MboxIssued, MboxMode, MbxOpcode};
use fchba::sli::ring::IssueFlags;
use fchba::{Hba, HbaState};

/// One finished IOCB as seen by its completion callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Done {
    pub iotag: u16,
    pub context: u64,
    pub status: IoStatus,
    pub qualifier: u32,
    pub entries: usize,
}

pub type Completions = Arc<Mutex<Vec<Done>>>;

pub struct Rig {
    pub sim: Arc<SimAdapter>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingSink>,
    pub hba: Arc<Hba>,
    pub done: Completions,
}

pub fn rig() -> Rig {
    rig_with(HbaConfig::default())
}

pub fn rig_with(config: HbaConfig) -> Rig {
    fchba::testing::init_tracing();
    let sim = Arc::new(SimAdapter::new());
    let clock = Arc::new(ManualClock::new());
    let events = Arc::new(RecordingSink::new());
    let hba = Hba::attach(config, sim.clone(), clock.clone(), events.clone())
        .expect("attach failed");
    Rig {
        sim,
        clock,
        events,
        hba,
        done: Arc::default(),
    }
}

impl Rig {
    pub fn els(&self) -> usize {
        self.hba.config().ring_of_kind(RingKind::Els).unwrap()
    }

    pub fn fcp(&self) -> usize {
        self.hba.config().ring_of_kind(RingKind::Fcp).unwrap()
    }

    /// Configures the port and reports the given link state.
    pub fn bring_up(&self, link_up: bool) {
        let issued = self
            .hba
            .issue_mbox(MailboxCommand::new(MbxOpcode::ConfigPort), MboxMode::Poll)
            .expect("CONFIG_PORT failed");
        assert!(matches!(issued, MboxIssued::Completed(ref cmd) if cmd.is_success()));
        self.sim.set_link(link_up);
        self.hba.handle_interrupt();
        let expected = if link_up {
            HbaState::LinkUp
        } else {
            HbaState::LinkDown
        };
        assert_eq!(self.hba.hba_state(), expected);
    }

    /// A descriptor whose completion lands in `self.done`.
    pub fn tracked(&self, iocb: Iocb, context: u64) -> IocbQ {
        let mut iocbq = self.hba.alloc_iocbq().expect("pool exhausted");
        iocbq.iocb = iocb;
        iocbq.context = context;
        let done = self.done.clone();
        iocbq.set_completion(move |_, cmd, rsp| {
            done.lock().push(Done {
                iotag: cmd.iocb.iotag,
                context: cmd.context,
                status: rsp.iocb.io_status(),
                qualifier: rsp.iocb.parameter,
                entries: rsp.entries().count(),
            });
        });
        iocbq
    }

    pub fn fcp_read(&self, target: u16, lun: u16, context: u64) -> IocbQ {
        let iocb = Iocb {
            target,
            lun,
            context: 0x40 + target,
            ..Iocb::command(IocbCommand::FcpIreadCr)
        };
        self.tracked(iocb, context)
    }

    pub fn els_request(&self, context: u64) -> IocbQ {
        self.tracked(Iocb::command(IocbCommand::ElsRequestCr), context)
    }

    pub fn issue(&self, ringno: usize, iocbq: IocbQ) -> u16 {
        self.hba
            .issue_iocb(ringno, iocbq, IssueFlags::empty())
            .expect("issue failed")
    }

    /// Pulls everything off a ring and answers each command with success.
    pub fn complete_all(&self, ringno: usize) -> Vec<Iocb> {
        let cmds = self.sim.take_commands(ringno);
        for cmd in &cmds {
            assert!(self.sim.complete(ringno, cmd, IoStatus::Success, 0));
        }
        self.hba.handle_interrupt();
        cmds
    }

    pub fn done(&self) -> Vec<Done> {
        self.done.lock().clone()
    }
}
