//! Operator-facing diagnostics.
//!
//! Everything emitted through `tracing` goes to stderr and is filtered by
//! `RUST_LOG`. The conversion record lives elsewhere: each unit keeps
//! `<stage>.log` (engine output) and `<stage>+hook.log` next to its markers,
//! and every batch leaves `<work_root>/reports/batch-<start>.json`. Those files are
//! written at any log level.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber; call once from `main`.
///
/// Without `RUST_LOG` the filter is `info`, which shows one line per stage
/// attempt and per merged artifact. `RUST_LOG=converter=debug` adds every
/// engine line and the countdown near expiry.
pub fn init() {
    // Unparsable directives are dropped rather than failing the batch.
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}
