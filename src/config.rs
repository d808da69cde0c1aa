//! Manager configuration
//!
//! The manager reads a single JSON document (`config.json` by default) with
//! three sections: the launchers, the log sink and the SOCKS listeners.
//! All durations in the file are milliseconds.

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, Role};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "launcher", default)]
    pub launcher: LauncherConfig,

    #[serde(rename = "logs", default)]
    pub logs: LogConfig,

    #[serde(rename = "listeners", default)]
    pub listeners: Vec<ListenerConfig>,
}

impl Config {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a configuration document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every staged role can be turned into a command line and
    /// that the log level is known
    pub fn validate(&self) -> Result<()> {
        self.logs.level()?;
        for role in self.launcher.stages.iter().flatten() {
            ProcessConfig::for_role(*role, &self.launcher)?;
        }
        Ok(())
    }
}

/// Paths and arguments for every launcher role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Tor Browser start script
    #[serde(rename = "tbb_exec_path", default)]
    pub tbb_path: Option<PathBuf>,

    #[serde(rename = "tor_exec_path", default)]
    pub tor_path: Option<PathBuf>,

    #[serde(rename = "torrc_path", default)]
    pub torrc_path: Option<PathBuf>,

    #[serde(rename = "cclient", default)]
    pub cover_client: Option<CoverClientConfig>,

    #[serde(default)]
    pub nginx: Option<NginxConfig>,

    #[serde(default)]
    pub gunicorn: Option<GunicornConfig>,

    /// Launch stages, in order. Every role of a stage must report `Started`
    /// before the next stage is launched.
    #[serde(default = "default_stages")]
    pub stages: Vec<Vec<Role>>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            tbb_path: None,
            tor_path: None,
            torrc_path: None,
            cover_client: None,
            nginx: None,
            gunicorn: None,
            stages: default_stages(),
        }
    }
}

fn default_stages() -> Vec<Vec<Role>> {
    vec![vec![Role::Browser]]
}

/// Cover traffic client, a python script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverClientConfig {
    #[serde(rename = "python_exec_path")]
    pub python_path: PathBuf,

    #[serde(rename = "cclient_exec_path")]
    pub script_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NginxConfig {
    pub exec_path: PathBuf,

    /// URL polled by the health check (e.g. the stub_status page)
    pub status_address: String,

    /// Health check period in milliseconds
    pub check_period: u64,
}

impl NginxConfig {
    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GunicornConfig {
    pub exec_path: PathBuf,
    pub bind_address: String,
    pub log_file: PathBuf,
    pub app_path: PathBuf,
}

/// Log sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Empty means stderr
    #[serde(default)]
    pub log_file: PathBuf,

    /// Truncate the log file on start instead of appending
    #[serde(default)]
    pub truncate_file: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::new(),
            truncate_file: false,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "Info".to_string()
}

impl LogConfig {
    /// Parse the configured level (`Debug`, `Info`, `Warn`, `Error`)
    pub fn level(&self) -> Result<Level> {
        match self.log_level.to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            _ => Err(Error::InvalidLogLevel(self.log_level.clone())),
        }
    }
}

/// One SOCKS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// `tcp`, `tcp4` or `tcp6`
    pub network: String,
    pub address: String,
    pub port: String,

    /// Relay idle timeout in milliseconds
    pub handler_timeout: u64,
}

impl ListenerConfig {
    /// `address:port`, bracketing IPv6 literals; an empty address is the wildcard
    pub fn bind_address(&self) -> String {
        if self.address.is_empty() {
            // An empty host listens on every interface of the family.
            let any = if self.network == "tcp6" { "[::]" } else { "0.0.0.0" };
            return format!("{}:{}", any, self.port);
        }
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout)
    }
}
