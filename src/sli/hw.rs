//! The register level seam between the SLI layer and an adapter.

use std::sync::Arc;

use super::regs::{ChipAttention, HostAttention};
use super::slim::Slim;

/// Register access to one adapter.
///
/// Ring and mailbox contents travel through [`Slim`]; this trait only covers
/// the registers and the out-of-band requests.
pub trait Hardware: Send + Sync {
    /// Tells the adapter where the shared memory lives. Called once at attach
    /// and again after every restart.
    fn attach_memory(&self, slim: Arc<Slim>);

    /// Doorbell write.
    fn write_chip_attention(&self, bits: ChipAttention);

    fn read_host_attention(&self) -> HostAttention;

    /// Acknowledges the given host attention bits (write one to clear).
    fn clear_host_attention(&self, bits: HostAttention);

    /// Current state of the physical link.
    fn link_up(&self) -> bool;

    /// Asks the platform to reset the adapter. The reset itself and the
    /// following reinitialization happen outside the SLI layer.
    fn request_reset(&self);
}
