//! Structured logging setup
//!
//! The crate only emits `tracing` events; installing a subscriber is left to
//! the application. `init` is a convenience for binaries and demos.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Install a global fmt subscriber
///
/// `RUST_LOG` wins when set; otherwise `default_filter` (for example
/// `"upstream_guard=debug"`) is used. Returns false if a global subscriber
/// was already installed.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
