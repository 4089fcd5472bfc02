//! Error taxonomy
//!
//! Startup failures, per-action failures and loop-level failures are kept in
//! separate types so each catch boundary in the daemon handles exactly one kind.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::VmId;

/// Failure to read, parse or write the persisted mapping
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {} does not exist", path.display())]
    Missing { path: PathBuf },

    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("cannot write config to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("VM {0} is already configured")]
    DuplicateVm(VmId),

    #[error("mapping for VM {0} needs a USB port or a USB device id")]
    NoTrigger(VmId),

    #[error("invalid USB device id '{0}', expected VID:PID in hex (e.g. 1234:abcd)")]
    InvalidDeviceId(String),
}

/// Fatal conditions while entering the listening state
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("USB hotplug notifications unavailable: {0}")]
    EventSourceUnavailable(String),

    #[error("cannot load mapping: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot set up logging: {0}")]
    Logging(String),
}

/// Failure of one control-plane call for one VM
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("cannot run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("no status line in `qm status` output")]
    MissingStatus,

    #[error("unrecognized VM status '{0}'")]
    UnrecognizedStatus(String),
}

/// Unrecoverable failure of the listening loop
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("USB event stream ended unexpectedly")]
    EventStreamClosed,

    #[error("event handler panicked: {0}")]
    HandlerPanicked(String),
}
