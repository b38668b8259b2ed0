//! Helpers shared by unit and integration tests.

use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Initializes `tracing` for tests, once per process. `RUST_LOG` takes
/// target filters; the default is everything at debug.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse().ok())
            .unwrap_or_else(|| Targets::new().with_default(LevelFilter::DEBUG));
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .with_thread_ids(true)
            .finish()
            .with(targets)
            .try_init();
    });
}
