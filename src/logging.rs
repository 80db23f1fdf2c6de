//! Ready-made `tracing` subscriber, enabled by the `logging` feature.
//!
//! Log lines go to stderr through the progress bar layer so they never tear
//! the bars drawn by the [`Executor`](crate::Executor). The level comes from
//! `RUST_LOG` and defaults to `info`, which is where proxies created with
//! `verbose` report their calls.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber, fails if one is already set.
pub fn init() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()
}
