//! Supervision of external processes
//!
//! A launcher starts one process, reports `Started`, then waits for whichever
//! comes first: the run-wide shutdown, a stop request from its owner, or the
//! process exiting by itself. It always ends with exactly one terminal status
//! (`StoppedClean` or `Failed`).
//!
//! Status flows out on one channel and stop requests flow in on another; the
//! owner holds both ends in a [`LauncherHandle`].

use crate::error::LaunchError;
use crate::process::ProcessConfig;
use hyper::client::HttpConnector;
use hyper::{Client, Uri};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

/// At most two signals are sent per launch: `Started` and a terminal one
const STATUS_CHANNEL_CAPACITY: usize = 2;

/// Lifecycle status reported by a launcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    Started,
    StoppedClean,
    Failed,
}

impl StatusSignal {
    /// Numeric code: 1 started, 0 stopped cleanly, -1 failed
    pub fn code(self) -> i8 {
        match self {
            StatusSignal::Started => 1,
            StatusSignal::StoppedClean => 0,
            StatusSignal::Failed => -1,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, StatusSignal::Started)
    }
}

impl fmt::Display for StatusSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusSignal::Started => f.write_str("started"),
            StatusSignal::StoppedClean => f.write_str("stopped"),
            StatusSignal::Failed => f.write_str("failed"),
        }
    }
}

/// Owner's side of a running launcher
pub struct LauncherHandle {
    label: String,
    status: mpsc::Receiver<StatusSignal>,
    stop: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl LauncherHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next status signal; `None` once the launcher is gone
    pub async fn recv(&mut self) -> Option<StatusSignal> {
        self.status.recv().await
    }

    /// Ask the launcher to stop its process
    ///
    /// Returns false if a stop is already pending or the launcher is done.
    pub fn request_stop(&self) -> bool {
        self.stop.try_send(()).is_ok()
    }

    /// Wait for the launcher task to finish
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("launcher {} task failed: {}", self.label, e);
        }
    }
}

/// Why a running launcher was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    Shutdown,
    Request,
}

/// Launcher's side of the channels
struct Control {
    shutdown: CancellationToken,
    status: mpsc::Sender<StatusSignal>,
    stop: mpsc::Receiver<()>,
}

impl Control {
    fn new(label: &str, shutdown: CancellationToken) -> (Self, impl FnOnce(JoinHandle<()>) -> LauncherHandle) {
        let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let label = label.to_string();

        let control = Self {
            shutdown,
            status: status_tx,
            stop: stop_rx,
        };
        let handle = move |task| LauncherHandle {
            label,
            status: status_rx,
            stop: stop_tx,
            task,
        };
        (control, handle)
    }

    async fn emit(&self, signal: StatusSignal) {
        if self.status.send(signal).await.is_err() {
            debug!("status receiver gone, dropping {} signal", signal);
        }
    }

    /// Resolves on shutdown or on an explicit stop request
    async fn stop_requested(&mut self) -> StopCause {
        tokio::select! {
            _ = self.shutdown.cancelled() => StopCause::Shutdown,
            Some(()) = self.stop.recv() => StopCause::Request,
        }
    }
}

/// Exit monitor for a started process
///
/// The monitor task owns the child, reaps it exactly once and reports the
/// exit. Kill requests are forwarded to it since it holds the child.
struct Monitor {
    kill: mpsc::Sender<oneshot::Sender<io::Result<()>>>,
    exit: oneshot::Receiver<Result<(), LaunchError>>,
}

impl Monitor {
    fn spawn(mut child: Child) -> Self {
        let (kill_tx, mut kill_rx) = mpsc::channel::<oneshot::Sender<io::Result<()>>>(1);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(
            async move {
                let result = loop {
                    tokio::select! {
                        status = child.wait() => {
                            break match status {
                                Ok(status) if status.success() => Ok(()),
                                Ok(status) => Err(LaunchError::ExitStatus(status)),
                                Err(e) => Err(LaunchError::Wait(e)),
                            };
                        }
                        Some(reply) = kill_rx.recv() => {
                            let _ = reply.send(child.start_kill());
                        }
                    }
                };
                let _ = exit_tx.send(result);
            }
            .in_current_span(),
        );

        Self {
            kill: kill_tx,
            exit: exit_rx,
        }
    }

    /// Kill the process; a process that is already gone is not an error
    async fn kill(&self) -> Result<(), LaunchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.kill.send(reply_tx).await.is_err() {
            return Ok(());
        }
        match reply_rx.await {
            Ok(Ok(())) | Err(_) => Ok(()),
            Ok(Err(e)) if already_gone(&e) => Ok(()),
            Ok(Err(e)) => Err(LaunchError::Kill(e)),
        }
    }

    async fn exited(&mut self) -> Result<(), LaunchError> {
        (&mut self.exit).await.unwrap_or(Err(LaunchError::MonitorLost))
    }
}

/// `Child::start_kill` on a child that has already been reaped
fn already_gone(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidInput
}

/// Kill a monitored process and wait for its exit
///
/// A failed kill is reported as `Failed` right away, since the process may
/// never exit.
async fn stop(service: &str, monitor: &mut Monitor) -> StatusSignal {
    match monitor.kill().await {
        Err(e) => {
            error!("error stopping {}: {}", service, e);
            StatusSignal::Failed
        }
        Ok(()) => exit_signal(service, monitor.exited().await),
    }
}

fn exit_signal(service: &str, result: Result<(), LaunchError>) -> StatusSignal {
    match result {
        Ok(()) => {
            debug!("{} process monitor returned successfully", service);
            StatusSignal::StoppedClean
        }
        Err(e) => {
            debug!("{} process monitor returned: {}", service, e);
            StatusSignal::Failed
        }
    }
}

/// Supervises one external process
pub struct Launcher {
    process: ProcessConfig,
    service: String,
    control: Control,
}

impl Launcher {
    /// Start supervising `process` in a new task
    pub fn spawn(process: ProcessConfig, service: impl Into<String>, shutdown: CancellationToken) -> LauncherHandle {
        let (control, handle) = Control::new(&process.label, shutdown);
        let span = tracing::info_span!("launcher", role = %process.label);
        let launcher = Self {
            process,
            service: service.into(),
            control,
        };
        handle(tokio::spawn(launcher.run().instrument(span)))
    }

    async fn run(mut self) {
        let service = self.service.clone();
        debug!("launching {}", service);

        let child = match self.process.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("error launching {}: {}", service, e);
                self.control.emit(StatusSignal::Failed).await;
                return;
            }
        };

        let mut monitor = Monitor::spawn(child);

        info!("{} started", service);
        self.control.emit(StatusSignal::Started).await;

        let signal = tokio::select! {
            cause = self.control.stop_requested() => {
                match cause {
                    StopCause::Shutdown => debug!("shutdown requested, stopping {}", service),
                    StopCause::Request => debug!("stop requested, stopping {}", service),
                }
                stop(&service, &mut monitor).await
            }
            result = monitor.exited() => exit_signal(&service, result),
        };

        info!("{} {}", service, signal);
        self.control.emit(signal).await;
    }
}

/// Periodic HTTP probe of a service that runs detached (nginx)
///
/// Reports `Started` on entry, `Failed` as soon as a probe fails, and on stop
/// runs the service's graceful stop command.
pub struct HealthCheck {
    label: String,
    address: String,
    period: Duration,
    stop_command: ProcessConfig,
    control: Control,
}

impl HealthCheck {
    pub fn spawn(
        label: impl Into<String>,
        address: impl Into<String>,
        period: Duration,
        stop_command: ProcessConfig,
        shutdown: CancellationToken,
    ) -> LauncherHandle {
        let label = label.into();
        let (control, handle) = Control::new(&label, shutdown);
        let span = tracing::info_span!("launcher", role = %label);
        let check = Self {
            label,
            address: address.into(),
            period,
            stop_command,
            control,
        };
        handle(tokio::spawn(check.run().instrument(span)))
    }

    async fn run(mut self) {
        let uri: Uri = match self.address.parse() {
            Ok(uri) => uri,
            Err(e) => {
                let e = LaunchError::ProbeAddress {
                    address: self.address.clone(),
                    reason: e.to_string(),
                };
                error!("{} health check not started: {}", self.label, e);
                self.control.emit(StatusSignal::Failed).await;
                return;
            }
        };

        let client = Client::new();

        info!("{} health check started", self.label);
        self.control.emit(StatusSignal::Started).await;

        let mut ticker = tokio::time::interval(self.period);
        // The first tick fires immediately; probing starts one period in.
        ticker.tick().await;

        let signal = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.probe(&client, &uri).await {
                        error!("{} health check error: {}", self.label, e);
                        break StatusSignal::Failed;
                    }
                }
                cause = self.control.stop_requested() => {
                    debug!("{:?} received, stopping {}", cause, self.label);
                    break self.stop_service().await;
                }
            }
        };

        info!("{} health check {}", self.label, signal);
        self.control.emit(signal).await;
    }

    async fn probe(&self, client: &Client<HttpConnector>, uri: &Uri) -> Result<(), LaunchError> {
        // A hung probe must not outlive its period, or stop requests would wait on it.
        let response = tokio::time::timeout(self.period, client.get(uri.clone()))
            .await
            .map_err(|_| LaunchError::ProbeTimeout(self.period))??;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LaunchError::ProbeStatus(status))
        }
    }

    async fn stop_service(&self) -> StatusSignal {
        debug!("stopping {}", self.label);
        match self.stop_command.run().await {
            Ok(()) => {
                debug!("{} stopped", self.label);
                StatusSignal::StoppedClean
            }
            Err(e) => {
                error!("error stopping {}: {}", self.label, LaunchError::StopCommand(e.to_string()));
                StatusSignal::Failed
            }
        }
    }
}
