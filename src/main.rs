use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use tokio::sync::mpsc;
use tracing::metadata::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

use fchba::clock::SystemClock;
use fchba::config::RingKind;
use fchba::event::TracingSink;
use fchba::scsi::{ScsiCommand, ScsiStatus, command};
use fchba::sim::SimAdapter;
use fchba::sli::iocb::{IoStatus, IocbType};
use fchba::sli::mailbox::{MailboxCommand, MboxMode, MbxOpcode};
use fchba::{Hba, HbaConfig, SchedConfig, Scheduler};

const TARGETS: u16 = 4;
const LUNS: u16 = 2;
const COMMANDS: usize = 400;
/// Every n-th command the simulated targets answer with `TASK SET FULL`.
const QUEUE_FULL_EVERY: usize = 17;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let targets = match std::env::var("RUST_LOG") {
        Ok(var) => var.parse().wrap_err("invalid RUST_LOG")?,
        Err(_) => Targets::new().with_default(LevelFilter::INFO),
    };
    tracing_subscriber::fmt().finish().with(targets).init();

    let sim = Arc::new(SimAdapter::new());
    let config = HbaConfig::default();
    let fcp = config
        .ring_of_kind(RingKind::Fcp)
        .ok_or_else(|| eyre!("default configuration has no FCP ring"))?;
    let hba = Hba::attach(
        config,
        sim.clone(),
        Arc::new(SystemClock),
        Arc::new(TracingSink),
    )?;

    // Ring setup polls the mailbox, which sleeps between attempts.
    let setup = hba.clone();
    tokio::task::spawn_blocking(move || {
        setup
            .issue_mbox(MailboxCommand::new(MbxOpcode::ConfigPort), MboxMode::Poll)
            .map_err(|e| eyre!("CONFIG_PORT failed: {e}"))
    })
    .await??;
    sim.set_link(true);
    hba.handle_interrupt();
    info!(state = ?hba.hba_state(), "adapter ready");

    let sched = Scheduler::new(
        hba.clone(),
        SchedConfig {
            target_max_outstanding: 12,
            lun_max_outstanding: 4,
            qfull_restore_delay: Duration::from_millis(200),
            ..SchedConfig::default()
        },
    )?;
    for target in 0..TARGETS {
        sched.add_target(target, 0x100 + target);
    }

    let device = {
        let (sim, hba) = (sim.clone(), hba.clone());
        tokio::spawn(async move {
            let mut seen = 0usize;
            let mut backlog = Vec::new();
            let mut tick = tokio::time::interval(Duration::from_millis(1));
            loop {
                tick.tick().await;
                backlog.extend(sim.take_commands(fcp));
                let mut unanswered = Vec::new();
                for cmd in backlog.drain(..) {
                    let posted = match IocbType::classify(cmd.command) {
                        IocbType::AbortAck => sim.ack_abort(fcp, &cmd),
                        _ => {
                            let queue_full = (seen + 1) % QUEUE_FULL_EVERY == 0;
                            sim.respond(fcp, &cmd, |rsp| {
                                if queue_full {
                                    rsp.set_io_status(IoStatus::FcpRspError, 0);
                                    rsp.scsi_status = ScsiStatus::TaskSetFull.raw();
                                }
                            })
                        }
                    };
                    if posted {
                        seen += 1;
                    } else {
                        unanswered.push(cmd);
                    }
                }
                backlog = unanswered;
                hba.handle_interrupt();
            }
        })
    };

    let timers = {
        let (hba, sched) = (hba.clone(), sched.clone());
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(50));
            loop {
                tick.tick().await;
                hba.run_timers();
                sched.run_timers();
            }
        })
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    for n in 0..COMMANDS {
        let target = (n % TARGETS as usize) as u16;
        let lun = ((n / TARGETS as usize) % LUNS as usize) as u16;
        let block = if n % 3 == 0 {
            command::write10(n as u32 * 8, 8, 512)
        } else {
            command::read10(n as u32 * 8, 8, 512)
        };
        let tx = tx.clone();
        sched.submit(ScsiCommand::new(target, lun, block), move |completion| {
            let _ = tx.send(completion);
        });
    }
    drop(tx);

    let mut ok = 0usize;
    let mut failed = 0usize;
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(completion) = rx.recv().await {
            if completion.is_success() {
                ok += 1;
            } else {
                failed += 1;
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            ok,
            failed,
            queued = sched.total_queued(),
            "timed out waiting for completions"
        );
    }

    device.abort();
    timers.abort();
    info!(
        ok,
        failed,
        stats = ?hba.ring_stats(fcp),
        pool_outstanding = hba.pool().outstanding(),
        "done"
    );
    Ok(())
}
