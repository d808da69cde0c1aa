//! Staged startup and status aggregation for the managed processes
//!
//! Roles are launched stage by stage. Every role in a stage must report
//! `Started` before the next stage is launched. Once all stages are up, the
//! supervisor waits for terminal signals: any `Failed` broadcasts shutdown,
//! and the run ends when every launcher is done.

use crate::config::LauncherConfig;
use crate::error::{Error, Result};
use crate::launcher::{HealthCheck, Launcher, LauncherHandle, StatusSignal};
use crate::process::{ProcessConfig, Role};
use futures::future::{join_all, select_all};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Label of the launcher that probes nginx
pub const NGINX_HEALTH_LABEL: &str = "NGINX_HEALTH";

/// Terminal status of every launcher started during a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Launchers that ended with `StoppedClean`
    pub stopped: Vec<String>,
    /// Launchers that ended with `Failed`, or could not be built
    pub failed: Vec<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, label: &str, signal: StatusSignal) {
        match signal {
            StatusSignal::StoppedClean => self.stopped.push(label.to_string()),
            StatusSignal::Failed => self.failed.push(label.to_string()),
            StatusSignal::Started => {}
        }
    }
}

/// Runs the configured launch stages
pub struct Supervisor {
    config: LauncherConfig,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(config: LauncherConfig, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// Launch every stage, then wait until all launchers are done
    ///
    /// Shutdown is always broadcast before this returns.
    pub async fn run(self) -> RunSummary {
        let span = tracing::info_span!("supervisor");
        self.run_stages().instrument(span).await
    }

    async fn run_stages(self) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut running = Vec::new();

        for (n, stage) in self.config.stages.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                info!("shutdown requested, not launching stage {}", n + 1);
                break;
            }

            debug!("launching stage {}: {:?}", n + 1, stage);
            if !self.start_stage(stage, &mut running, &mut summary).await {
                error!("stage {} failed to start, shutting down", n + 1);
                self.shutdown.cancel();
                break;
            }
            info!("stage {} running", n + 1);
        }

        self.aggregate(running, &mut summary).await;

        self.shutdown.cancel();
        summary
    }

    /// Start every role of one stage and wait for each first signal
    ///
    /// Returns true when every role reported `Started`.
    async fn start_stage(
        &self,
        stage: &[Role],
        running: &mut Vec<LauncherHandle>,
        summary: &mut RunSummary,
    ) -> bool {
        let mut all_started = true;
        let mut launched = Vec::new();

        for &role in stage {
            match ProcessConfig::for_role(role, &self.config) {
                Ok(process) => launched.push((
                    role,
                    Launcher::spawn(process, role.service(), self.shutdown.clone()),
                )),
                Err(e) => {
                    error!("cannot launch {}: {}", role, e);
                    summary.failed.push(role.label().to_string());
                    all_started = false;
                }
            }
        }

        let firsts = join_all(launched.iter_mut().map(|(_, handle)| handle.recv())).await;

        for ((role, handle), first) in launched.into_iter().zip(firsts) {
            if !self.admit(handle, first, running, summary).await {
                all_started = false;
                continue;
            }

            if role == Role::Nginx {
                match self.health_check() {
                    Ok(mut check) => {
                        let first = check.recv().await;
                        if !self.admit(check, first, running, summary).await {
                            all_started = false;
                        }
                    }
                    Err(e) => {
                        error!("cannot start nginx health check: {}", e);
                        summary.failed.push(NGINX_HEALTH_LABEL.to_string());
                        all_started = false;
                    }
                }
            }
        }

        all_started
    }

    /// Keep a launcher whose first signal was `Started`, or retire it
    async fn admit(
        &self,
        handle: LauncherHandle,
        first: Option<StatusSignal>,
        running: &mut Vec<LauncherHandle>,
        summary: &mut RunSummary,
    ) -> bool {
        match first {
            Some(StatusSignal::Started) => {
                info!("{} STATUS: {}", handle.label(), StatusSignal::Started.code());
                running.push(handle);
                true
            }
            Some(signal) => {
                info!("{} STATUS: {}", handle.label(), signal.code());
                summary.record(handle.label(), signal);
                handle.join().await;
                signal != StatusSignal::Failed
            }
            None => {
                error!("{} ended without reporting a status", handle.label());
                summary.failed.push(handle.label().to_string());
                handle.join().await;
                false
            }
        }
    }

    fn health_check(&self) -> Result<LauncherHandle> {
        let nginx = self
            .config
            .nginx
            .as_ref()
            .ok_or(Error::RoleNotConfigured(Role::Nginx.label()))?;
        let stop = ProcessConfig::nginx_stop(&self.config)?;

        Ok(HealthCheck::spawn(
            NGINX_HEALTH_LABEL,
            nginx.status_address.clone(),
            nginx.check_period(),
            stop,
            self.shutdown.clone(),
        ))
    }

    /// Collect terminal signals until no launcher is left
    async fn aggregate(&self, mut running: Vec<LauncherHandle>, summary: &mut RunSummary) {
        if running.is_empty() && summary.is_success() && !self.shutdown.is_cancelled() {
            info!("nothing to supervise, waiting for shutdown");
            self.shutdown.cancelled().await;
        }

        while !running.is_empty() {
            let (signal, index, _) =
                select_all(running.iter_mut().map(|handle| Box::pin(handle.recv()))).await;

            let handle = running.swap_remove(index);
            let label = handle.label().to_string();

            match signal {
                Some(StatusSignal::Started) => {
                    warn!("{} reported started twice", label);
                    running.push(handle);
                    continue;
                }
                Some(signal) => {
                    info!("{} STATUS: {}", label, signal.code());
                    summary.record(&label, signal);
                    if signal == StatusSignal::Failed && !self.shutdown.is_cancelled() {
                        error!("{} failed, shutting down", label);
                        self.shutdown.cancel();
                    }
                }
                None => {
                    error!("{} ended without a terminal status", label);
                    summary.failed.push(label);
                    self.shutdown.cancel();
                }
            }

            handle.join().await;
            debug!("{} launcher(s) still running", running.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoverClientConfig, NginxConfig};
    use std::path::PathBuf;
    use std::time::Duration;

    fn config_with(stages: Vec<Vec<Role>>) -> LauncherConfig {
        LauncherConfig {
            stages,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_clean_exit_ends_run() {
        let mut config = config_with(vec![vec![Role::Browser]]);
        config.tbb_path = Some(PathBuf::from("true"));

        let shutdown = CancellationToken::new();
        let summary = Supervisor::new(config, shutdown.clone()).run().await;

        assert!(summary.is_success());
        assert_eq!(summary.stopped, vec!["BROWSER".to_string()]);
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_missing_role_config_fails_stage() {
        let config = config_with(vec![vec![Role::Tor], vec![Role::Browser]]);

        let summary = Supervisor::new(config, CancellationToken::new()).run().await;

        assert_eq!(summary.failed, vec!["TOR".to_string()]);
        assert!(summary.stopped.is_empty());
    }

    #[tokio::test]
    async fn test_failure_stops_running_roles() {
        let mut config = config_with(vec![vec![Role::CoverClient], vec![Role::Tor]]);
        config.cover_client = Some(CoverClientConfig {
            python_path: PathBuf::from("sleep"),
            script_path: PathBuf::from("30"),
        });
        config.tor_path = Some(PathBuf::from("/nonexistent/tor"));
        config.torrc_path = Some(PathBuf::from("torrc"));

        let summary = tokio::time::timeout(
            Duration::from_secs(10),
            Supervisor::new(config, CancellationToken::new()).run(),
        )
        .await
        .unwrap();

        assert!(summary.failed.contains(&"TOR".to_string()));
        // Killed on shutdown, so the cover client also ends as failed.
        assert!(summary.failed.contains(&"COVER_CLIENT".to_string()));
    }

    #[tokio::test]
    async fn test_health_check_requires_nginx_section() {
        let config = config_with(vec![]);
        let supervisor = Supervisor::new(config, CancellationToken::new());
        assert!(supervisor.health_check().is_err());

        let mut config = config_with(vec![]);
        config.nginx = Some(NginxConfig {
            exec_path: PathBuf::from("nginx"),
            status_address: "http://127.0.0.1:1/status".to_string(),
            check_period: 50,
        });
        let shutdown = CancellationToken::new();
        let supervisor = Supervisor::new(config, shutdown.clone());
        let mut check = supervisor.health_check().unwrap();
        assert_eq!(check.recv().await, Some(StatusSignal::Started));
        // Nothing listens on port 1, so the first probe fails.
        assert_eq!(check.recv().await, Some(StatusSignal::Failed));
    }

    #[tokio::test]
    async fn test_empty_stages_wait_for_shutdown() {
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(Supervisor::new(config_with(vec![]), shutdown.clone()).run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!run.is_finished());

        shutdown.cancel();
        let summary = run.await.unwrap();
        assert!(summary.is_success());
    }
}
