//! Tracing setup for front ends
//!
//! The library only emits `tracing` events; binaries call [`init_tracing`]
//! once. `RUST_LOG` wins over the level passed in.

use crate::{Result, RunError};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a stderr `fmt` subscriber filtered at `level`
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| RunError::Configuration(format!("cannot initialise tracing: {}", e)))?;

    debug!("Tracing initialized with level: {}", level);
    Ok(())
}
