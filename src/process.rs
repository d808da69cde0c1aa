//! Command lines for the managed processes
//!
//! Each launcher role (Tor, the gunicorn/nginx pair, the cover client and the
//! Tor Browser) maps to one external executable. This module turns the
//! launcher configuration into the argument list for a role and spawns it.

use crate::config::LauncherConfig;
use crate::error::{Error, LaunchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// A supervised process role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Tor,
    Gunicorn,
    Nginx,
    CoverClient,
    Browser,
}

impl Role {
    /// Label used in logs and configuration
    pub fn label(&self) -> &'static str {
        match self {
            Role::Tor => "TOR",
            Role::Gunicorn => "GUNICORN",
            Role::Nginx => "NGINX",
            Role::CoverClient => "COVER_CLIENT",
            Role::Browser => "BROWSER",
        }
    }

    /// Human readable service name
    pub fn service(&self) -> &'static str {
        match self {
            Role::Tor => "Tor",
            Role::Gunicorn => "Gunicorn",
            Role::Nginx => "Nginx",
            Role::CoverClient => "Cover Client",
            Role::Browser => "Tor Browser",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything needed to start one external process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Role label, for diagnostics
    pub label: String,

    /// Executable to run
    pub command: PathBuf,

    /// Arguments to pass to the command
    pub args: Vec<String>,
}

impl ProcessConfig {
    /// Create a configuration for an arbitrary command
    pub fn new(label: impl Into<String>, command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            args,
        }
    }

    /// Build the command line of a role from the launcher configuration
    pub fn for_role(role: Role, config: &LauncherConfig) -> Result<Self> {
        let missing = || Error::RoleNotConfigured(role.label());

        let process = match role {
            Role::Tor => {
                let tor = config.tor_path.as_ref().ok_or_else(missing)?;
                let torrc = config.torrc_path.as_ref().ok_or_else(missing)?;
                Self::new(
                    role.label(),
                    tor,
                    vec!["-f".to_string(), torrc.display().to_string()],
                )
            }
            Role::Gunicorn => {
                let gunicorn = config.gunicorn.as_ref().ok_or_else(missing)?;
                let log_file = gunicorn.log_file.display().to_string();
                Self::new(
                    role.label(),
                    &gunicorn.exec_path,
                    vec![
                        "-b".to_string(),
                        gunicorn.bind_address.clone(),
                        "--log-file".to_string(),
                        log_file.clone(),
                        "--access-logfile".to_string(),
                        log_file,
                        "--chdir".to_string(),
                        gunicorn.app_path.display().to_string(),
                        "app:app".to_string(),
                    ],
                )
            }
            Role::Nginx => {
                let nginx = config.nginx.as_ref().ok_or_else(missing)?;
                Self::new(role.label(), &nginx.exec_path, Vec::new())
            }
            Role::CoverClient => {
                let cclient = config.cover_client.as_ref().ok_or_else(missing)?;
                Self::new(
                    role.label(),
                    &cclient.python_path,
                    vec![cclient.script_path.display().to_string()],
                )
            }
            Role::Browser => {
                let tbb = config.tbb_path.as_ref().ok_or_else(missing)?;
                Self::new(role.label(), tbb, Vec::new())
            }
        };

        Ok(process)
    }

    /// Graceful stop command for nginx (`nginx -s stop`)
    pub fn nginx_stop(config: &LauncherConfig) -> Result<Self> {
        let nginx = config
            .nginx
            .as_ref()
            .ok_or(Error::RoleNotConfigured(Role::Nginx.label()))?;
        Ok(Self::new(
            "NGINX_STOP",
            &nginx.exec_path,
            vec!["-s".to_string(), "stop".to_string()],
        ))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit());
        cmd
    }

    /// Start the process without waiting for it
    pub fn spawn(&self) -> std::result::Result<Child, LaunchError> {
        debug!("  Command: {:?}", self.command);
        debug!("  Args: {:?}", self.args);

        let child = self.command().spawn().map_err(|source| LaunchError::Spawn {
            command: self.command.display().to_string(),
            source,
        })?;

        info!(
            "{} process spawned with PID: {}",
            self.label,
            child.id().unwrap_or_default()
        );
        Ok(child)
    }

    /// Run the process to completion, failing on a non-success exit
    pub async fn run(&self) -> std::result::Result<(), LaunchError> {
        let status = self
            .command()
            .status()
            .await
            .map_err(|source| LaunchError::Spawn {
                command: self.command.display().to_string(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(LaunchError::ExitStatus(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoverClientConfig, GunicornConfig, NginxConfig};

    fn launcher_config() -> LauncherConfig {
        LauncherConfig {
            tbb_path: Some(PathBuf::from("/opt/tbb/start-tor-browser")),
            tor_path: Some(PathBuf::from("/usr/bin/tor")),
            torrc_path: Some(PathBuf::from("/etc/tor/torrc")),
            cover_client: Some(CoverClientConfig {
                python_path: PathBuf::from("/usr/bin/python3"),
                script_path: PathBuf::from("/opt/cc/client.py"),
            }),
            nginx: Some(NginxConfig {
                exec_path: PathBuf::from("/usr/sbin/nginx"),
                status_address: "http://127.0.0.1:8080/status".to_string(),
                check_period: 1000,
            }),
            gunicorn: Some(GunicornConfig {
                exec_path: PathBuf::from("/usr/bin/gunicorn"),
                bind_address: "127.0.0.1:8000".to_string(),
                log_file: PathBuf::from("/tmp/gunicorn.log"),
                app_path: PathBuf::from("/opt/os"),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_tor_command_line() {
        let process = ProcessConfig::for_role(Role::Tor, &launcher_config()).unwrap();

        assert_eq!(process.command, PathBuf::from("/usr/bin/tor"));
        assert_eq!(process.args, vec!["-f", "/etc/tor/torrc"]);
        assert_eq!(process.label, "TOR");
    }

    #[test]
    fn test_gunicorn_command_line() {
        let process = ProcessConfig::for_role(Role::Gunicorn, &launcher_config()).unwrap();

        assert_eq!(process.command, PathBuf::from("/usr/bin/gunicorn"));
        assert_eq!(
            process.args,
            vec![
                "-b",
                "127.0.0.1:8000",
                "--log-file",
                "/tmp/gunicorn.log",
                "--access-logfile",
                "/tmp/gunicorn.log",
                "--chdir",
                "/opt/os",
                "app:app",
            ]
        );
    }

    #[test]
    fn test_cover_client_and_browser() {
        let config = launcher_config();

        let cc = ProcessConfig::for_role(Role::CoverClient, &config).unwrap();
        assert_eq!(cc.command, PathBuf::from("/usr/bin/python3"));
        assert_eq!(cc.args, vec!["/opt/cc/client.py"]);

        let browser = ProcessConfig::for_role(Role::Browser, &config).unwrap();
        assert!(browser.args.is_empty());
    }

    #[test]
    fn test_nginx_stop_command() {
        let stop = ProcessConfig::nginx_stop(&launcher_config()).unwrap();
        assert_eq!(stop.args, vec!["-s", "stop"]);
    }

    #[test]
    fn test_missing_role_config() {
        let config = LauncherConfig::default();
        for role in [Role::Tor, Role::Gunicorn, Role::Nginx, Role::CoverClient, Role::Browser] {
            assert!(ProcessConfig::for_role(role, &config).is_err());
        }
    }

    #[test]
    fn test_role_labels_round_trip_through_json() {
        let role: Role = serde_json::from_str("\"COVER_CLIENT\"").unwrap();
        assert_eq!(role, Role::CoverClient);
        assert_eq!(role.to_string(), "COVER_CLIENT");
    }

    #[tokio::test]
    async fn test_run_reports_exit_status() {
        assert!(ProcessConfig::new("T", "true", vec![]).run().await.is_ok());
        assert!(matches!(
            ProcessConfig::new("F", "false", vec![]).run().await,
            Err(LaunchError::ExitStatus(_))
        ));
    }
}
