//! rendezmix - local process manager for the rendezmix client
//!
//! This library provides the two halves of the manager:
//! - SOCKS relay listeners that forward negotiated connections to their
//!   targets, with per-leg inactivity timeouts
//! - Launchers that start and supervise the client's helper processes
//!   (Tor, gunicorn, nginx, the cover client, the browser) and report their
//!   status to a staged supervisor

pub mod config;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod process;
pub mod relay;
pub mod supervisor;

pub use config::Config;
pub use error::{Error, LaunchError, Result};
pub use launcher::{HealthCheck, Launcher, LauncherHandle, StatusSignal};
pub use process::{ProcessConfig, Role};
pub use supervisor::{RunSummary, Supervisor};
