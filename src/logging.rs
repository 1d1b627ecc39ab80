//! `tracing` subscriber setup for binaries, demos and tests.

use tracing_subscriber::EnvFilter;

/// Fallback directive when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Install a formatting subscriber. `RUST_LOG` wins over `default_filter`.
/// Returns `false` if a global subscriber was already installed.
pub fn init(default_filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

pub fn init_default() -> bool {
    init(DEFAULT_FILTER)
}
