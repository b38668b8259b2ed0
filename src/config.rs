//! Adapter and scheduler configuration.
//!
//! A configuration is created at attach time and handed to [`crate::sli::Hba::attach`]
//! and [`crate::sched::Scheduler::new`]; nothing here is process-global.

use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::ensure;

use crate::sli::iocb::IOCB_WORDS;

/// Largest ring the SLIM layout supports.
pub const MAX_RING_ENTRIES: u32 = 1024;

/// Maximum number of rings an adapter exposes.
pub const MAX_RINGS: usize = 4;

/// What traffic a ring carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingKind {
    /// Extended link services (discovery, logins). Stays usable while the link
    /// is down.
    Els,
    /// SCSI I/O. Gated while the link is unreachable.
    Fcp,
    /// Anything else (IP, CT passthrough).
    Extra,
}

/// Geometry of one command/response ring pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingConfig {
    pub kind: RingKind,
    pub cmd_entries: u32,
    pub rsp_entries: u32,
}

impl RingConfig {
    pub fn new(kind: RingKind, cmd_entries: u32, rsp_entries: u32) -> Self {
        Self {
            kind,
            cmd_entries,
            rsp_entries,
        }
    }
}

/// How long a poll mode mailbox command is waited for.
///
/// The first `fast_attempts` checks are spaced by `fast_delay`, later ones by
/// `slow_delay`. After `max_attempts` checks the command is given up on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub fast_attempts: u32,
    pub fast_delay: Duration,
    pub slow_delay: Duration,
}

impl PollPolicy {
    /// Delay to wait before check number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt < self.fast_attempts {
            self.fast_delay
        } else {
            self.slow_delay
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        // 10 x 1ms then 50ms steps, roughly 30 seconds in total.
        Self {
            max_attempts: 610,
            fast_attempts: 10,
            fast_delay: Duration::from_millis(1),
            slow_delay: Duration::from_millis(50),
        }
    }
}

/// Configuration of the SLI layer of one adapter.
#[derive(Clone, Debug)]
pub struct HbaConfig {
    pub rings: Vec<RingConfig>,
    /// Timeout armed for every NOWAIT mailbox command.
    pub mailbox_timeout: Duration,
    pub poll: PollPolicy,
    /// Size of the iotag lookup table. `None` disables the table and every
    /// completion is matched with a linear scan.
    pub max_iotags: Option<u16>,
    /// Number of slots written between two doorbell writes while draining.
    pub sync_batch: usize,
    /// Age after which an unanswered abort is requested again.
    pub abort_retry_interval: Duration,
    /// Upper bound of descriptors alive at once.
    pub iocb_pool_size: usize,
}

impl Default for HbaConfig {
    fn default() -> Self {
        Self {
            rings: vec![
                RingConfig::new(RingKind::Els, 16, 16),
                RingConfig::new(RingKind::Fcp, 64, 64),
                RingConfig::new(RingKind::Extra, 8, 8),
            ],
            mailbox_timeout: Duration::from_secs(30),
            poll: PollPolicy::default(),
            max_iotags: Some(1024),
            sync_batch: 8,
            abort_retry_interval: Duration::from_secs(2),
            iocb_pool_size: 2048,
        }
    }
}

impl HbaConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.rings.is_empty(), "at least one ring is required");
        ensure!(
            self.rings.len() <= MAX_RINGS,
            "an adapter exposes at most {MAX_RINGS} rings, {} configured",
            self.rings.len()
        );
        for (ringno, ring) in self.rings.iter().enumerate() {
            ensure!(
                (2..=MAX_RING_ENTRIES).contains(&ring.cmd_entries),
                "ring {ringno}: command entries must be in 2..={MAX_RING_ENTRIES}, was {}",
                ring.cmd_entries
            );
            ensure!(
                (2..=MAX_RING_ENTRIES).contains(&ring.rsp_entries),
                "ring {ringno}: response entries must be in 2..={MAX_RING_ENTRIES}, was {}",
                ring.rsp_entries
            );
        }
        if let Some(max) = self.max_iotags {
            ensure!(max > 0, "iotag table must not be empty");
        }
        ensure!(self.sync_batch > 0, "sync batch must be at least one entry");
        ensure!(
            self.poll.max_attempts > 0,
            "poll policy needs at least one attempt"
        );
        ensure!(
            self.iocb_pool_size >= self.rings.len(),
            "descriptor pool of {} is too small for {} rings",
            self.iocb_pool_size,
            self.rings.len()
        );
        Ok(())
    }

    /// Number of the first ring of the given kind.
    pub fn ring_of_kind(&self, kind: RingKind) -> Option<usize> {
        self.rings.iter().position(|r| r.kind == kind)
    }

    /// Total number of 32 bit words of ring memory needed in SLIM.
    pub(crate) fn ring_words(&self) -> usize {
        self.rings
            .iter()
            .map(|r| (r.cmd_entries + r.rsp_entries) as usize * IOCB_WORDS)
            .sum()
    }
}

/// Configuration of the admission scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedConfig {
    pub hba_max_outstanding: u32,
    pub target_max_outstanding: u32,
    pub lun_max_outstanding: u32,
    /// How many times a command is retried after a queue full status.
    pub qfull_retries: u8,
    /// How long a throttled LUN keeps its lowered queue depth.
    pub qfull_restore_delay: Duration,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            hba_max_outstanding: 1024,
            target_max_outstanding: 256,
            lun_max_outstanding: 30,
            qfull_retries: 5,
            qfull_restore_delay: Duration::from_secs(5),
        }
    }
}

impl SchedConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.hba_max_outstanding > 0, "HBA queue depth must be non-zero");
        ensure!(
            self.target_max_outstanding > 0,
            "target queue depth must be non-zero"
        );
        ensure!(self.lun_max_outstanding > 0, "LUN queue depth must be non-zero");
        Ok(())
    }
}
