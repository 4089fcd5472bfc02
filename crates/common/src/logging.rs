//! Logging setup and the daemon's decision log

use crate::error::StartupError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` wins over `default_level`. Records go to stderr, one per line,
/// where journald picks them up.
pub fn setup_logging(default_level: &str) -> Result<(), StartupError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| StartupError::Logging(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| StartupError::Logging(e.to_string()))?;

    Ok(())
}

/// Severity of a decision record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Sink for the daemon's decision records
///
/// Every decision point of the daemon (startup summary, per-event match result,
/// per-VM outcome, shutdown reason) produces exactly one record here.
pub trait DaemonLog {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Decision log that forwards to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl DaemonLog for TracingLog {
    fn info(&self, message: &str) {
        tracing::info!(target: "vusbpb::daemon", "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "vusbpb::daemon", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "vusbpb::daemon", "{}", message);
    }
}
