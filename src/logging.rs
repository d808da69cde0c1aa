//! Log sink setup
//!
//! Installs the `tracing` subscriber for the whole run from the `logs`
//! section of the configuration. `RUST_LOG` overrides the configured level.

use crate::config::LogConfig;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Open the log file, truncating or appending as configured
pub fn open_log_file(path: &Path, truncate: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).mode(0o600);
    if truncate {
        options.truncate(true);
    } else {
        options.append(true);
    }

    options.open(path).map_err(|source| Error::LogFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Filter from `RUST_LOG`, or the configured level
pub fn filter(config: &LogConfig) -> Result<EnvFilter> {
    let level = config.level()?;
    Ok(EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase())))
}

/// Install the global subscriber
///
/// Writes to the configured file, or to stderr when no file is set.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = filter(config)?;

    if config.log_file.as_os_str().is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        let file = open_log_file(&config.log_file, config.truncate_file)?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .init();
    }

    Ok(())
}
