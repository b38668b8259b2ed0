//! Host side of the SLI ring protocol spoken with Fibre Channel host bus
//! adapters, and the admission scheduler that feeds SCSI commands to it.
//!
//! - [`sli`]: shared memory rings, the mailbox, aborts and the fatal path.
//! - [`sched`]: per adapter, target and LUN queue depth management.
//! - [`scsi`]: the commands and statuses carried over FCP.
//! - [`sim`]: a simulated adapter for tests and the demo binary.

pub mod clock;
pub mod config;
pub mod event;
pub mod sched;
pub mod scsi;
pub mod sim;
pub mod sli;
#[doc(hidden)]
pub mod testing;

pub use config::{HbaConfig, SchedConfig};
pub use sched::{CommandId, Scheduler};
pub use sli::{Hba, HbaState};
