//! rendezmix-manager - runs the client's SOCKS relays and helper processes
//!
//! The complete flow:
//! 1. Read the JSON configuration and set up the log sink
//! 2. Bind one SOCKS listener per configured entry (failures are skipped)
//! 3. Launch the helper processes stage by stage
//! 4. On SIGTERM/SIGINT/SIGHUP, or when a launcher fails, broadcast shutdown
//! 5. Wait for every launcher and listener to terminate

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use rendezmix::config::{Config, ListenerConfig, DEFAULT_CONFIG_FILE};
use rendezmix::relay::{Listener, ListenerStats};
use rendezmix::{logging, Supervisor};

/// rendezmix-manager - local process manager for the rendezmix client
///
/// Starts the SOCKS relay listeners and supervises Tor, the web stack, the
/// cover client and the browser until one of them fails or the manager is
/// signalled to stop.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

/// Cancel `shutdown` on the first termination signal
fn watch_signals(shutdown: CancellationToken) -> Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?;
    let mut int = signal(SignalKind::interrupt()).context("Failed to watch SIGINT")?;
    let mut hup = signal(SignalKind::hangup()).context("Failed to watch SIGHUP")?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
            _ = hup.recv() => "SIGHUP",
            _ = shutdown.cancelled() => return,
        };
        info!("{} received, terminating", name);
        shutdown.cancel();
    }))
}

/// Bind and start one listener; bind failures are logged and skipped
async fn deploy_listener(
    n: usize,
    config: &ListenerConfig,
    shutdown: &CancellationToken,
) -> Option<JoinHandle<ListenerStats>> {
    info!("creating socks listener on {}", config.bind_address());

    let id = n.to_string();
    match Listener::bind(id.clone(), config, shutdown).await {
        Ok(listener) => {
            debug!("created listener {}", id);
            Some(tokio::spawn(listener.listen()))
        }
        Err(e) => {
            error!("error creating listener {}: {}", id, e);
            None
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signals = watch_signals(shutdown.clone())?;

    let mut listeners = Vec::new();
    for (i, listener_config) in config.listeners.iter().enumerate() {
        if let Some(task) = deploy_listener(i + 1, listener_config, &shutdown).await {
            listeners.push((i + 1, task));
        }
    }

    let summary = Supervisor::new(config.launcher, shutdown.clone()).run().await;

    // The supervisor has broadcast shutdown, so every listener is closing.
    for (n, task) in listeners {
        match task.await {
            Ok(stats) => info!("listener {} terminated after {} connections", n, stats.accepted),
            Err(e) => error!("listener {} task failed: {}", n, e),
        }
    }
    let _ = signals.await;

    if !summary.is_success() {
        bail!("failed launchers: {}", summary.failed.join(", "));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Nothing is logged before the sink exists, so early failures go to stderr.
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Fatal error reading configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = logging::init(&config.logs) {
        eprintln!("Fatal error setting up the log: {}", e);
        std::process::exit(1);
    }

    info!("manager started");
    let result = run(config).await;
    info!("manager terminated");

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_config_path() {
        let cli = Cli::parse_from(["rendezmix-manager"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));

        let cli = Cli::parse_from(["rendezmix-manager", "--config", "/etc/rendezmix.json"]);
        assert_eq!(cli.config, PathBuf::from("/etc/rendezmix.json"));
    }
}
