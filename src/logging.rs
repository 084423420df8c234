//! Tracing subscriber setup for binaries and demos.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed, which
/// leaves the existing one in place.
pub fn init_logging() -> bool {
    init_logging_with("info")
}

/// Same as [`init_logging`] with a caller-chosen default directive.
pub fn init_logging_with(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .is_ok()
}
