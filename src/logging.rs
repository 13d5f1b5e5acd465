//! Ready-made subscriber for binaries that don't set one up themselves.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a global subscriber that prints events to stderr and renders
/// the progress bars of minification passes.
///
/// The filter is read from `RUST_LOG`, falling back to `level`, and to
/// `info` when `level` isn't a valid directive either.
pub fn init(level: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}
