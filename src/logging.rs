//! Structured logging setup using `tracing-subscriber`.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the binary.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Initialise console logging for the `capsule` binary.
///
/// Emits human-readable output to stderr, keeping stdout free for the
/// values the CLI prints. Controlled by `RUST_LOG` (default: `info`).
/// A second call is a no-op.
pub fn init_cli() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
