//! Error types for the manager
//!
//! `Error` covers everything that can go wrong before components start
//! (configuration, logging, binding). Process lifecycle failures have their
//! own `LaunchError`, which never leaves a launcher: it is logged and turned
//! into a `Failed` status signal.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Setup errors surfaced to the caller
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read configuration file {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("log level not recognized: {0}")]
    InvalidLogLevel(String),

    #[error("failed to open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("launcher role {0} is listed in a stage but has no configuration")]
    RoleNotConfigured(&'static str),

    #[error("unsupported network type: {0}")]
    UnsupportedNetwork(String),

    #[error("failed to bind {network}/{address}: {source}")]
    Bind {
        network: String,
        address: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of one launch attempt
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("process exited unsuccessfully: {0}")]
    ExitStatus(std::process::ExitStatus),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to kill process: {0}")]
    Kill(#[source] io::Error),

    #[error("process monitor went away without reporting")]
    MonitorLost,

    #[error("health check request failed: {0}")]
    Probe(#[from] hyper::Error),

    #[error("invalid health check address {address}: {reason}")]
    ProbeAddress { address: String, reason: String },

    #[error("health check got no response within {0:?}")]
    ProbeTimeout(std::time::Duration),

    #[error("unexpected health check response: {0}")]
    ProbeStatus(hyper::StatusCode),

    #[error("stop command failed: {0}")]
    StopCommand(String),
}
