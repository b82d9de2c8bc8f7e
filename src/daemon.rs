//! Lifecycle of the local node process.
//!
//! ```text
//! idle -> probing -> adopting ------------------> running(adopted) -> idle
//!                \-> [shutdown external] -> configuring -> starting -> running(managed) -> idle
//! ```
//!
//! A node that was already running with pubsub enabled is adopted and never
//! killed by us. A node running without pubsub is asked to shut down; if it
//! refuses we give up rather than kill a process we don't own.

use crate::error::{BridgeError, Result};
use crate::events::{EventSender, TransportEvent};
use crate::node_api::NodeApi;
use crate::node_config::{repo_initialized, ConfigStore};
use crate::profile::{apply_profile, NetworkProfile};
use crate::retry::poll_until;
use crate::subscription::SubscriptionEngine;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Line the node prints on stdout once its API is serving.
pub const READY_MARKER: &str = "Daemon is ready";
pub const SHUTDOWN_POLL_ATTEMPTS: u32 = 10;
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long a managed node gets to exit after a shutdown request before
/// it is killed.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Managed,
    Adopted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Probing,
    Adopting,
    Configuring,
    Starting,
    Running(Ownership),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A process we spawned earlier is still alive.
    AlreadyRunning,
    /// An external node with pubsub enabled is in use.
    Adopted,
    /// A new managed process was spawned. `ready` is false when the
    /// readiness line never arrived but the process is still alive.
    Spawned { ready: bool },
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub binary: PathBuf,
    pub repo_path: PathBuf,
    pub readiness_timeout: Duration,
    /// Time a managed node gets to exit after a shutdown request before it
    /// is killed. Normally [`STOP_GRACE_PERIOD`].
    pub stop_grace: Duration,
}

struct ManagedProcess {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

impl ManagedProcess {
    fn is_alive(&self) -> bool {
        !self.monitor.is_finished()
    }
}

pub struct DaemonManager {
    settings: DaemonSettings,
    api: NodeApi,
    config_store: Arc<dyn ConfigStore>,
    engine: SubscriptionEngine,
    events: EventSender,
    state: DaemonState,
    process: Option<ManagedProcess>,
    shutdown_poll_interval: Duration,
}

impl DaemonManager {
    pub fn new(
        settings: DaemonSettings,
        api: NodeApi,
        config_store: Arc<dyn ConfigStore>,
        engine: SubscriptionEngine,
        events: EventSender,
    ) -> Self {
        Self {
            settings,
            api,
            config_store,
            engine,
            events,
            state: DaemonState::Idle,
            process: None,
            shutdown_poll_interval: SHUTDOWN_POLL_INTERVAL,
        }
    }

    pub fn state(&self) -> DaemonState {
        if let Some(process) = &self.process {
            if !process.is_alive() {
                return DaemonState::Idle;
            }
        }
        self.state
    }

    pub fn is_managed(&self) -> bool {
        self.process.as_ref().is_some_and(ManagedProcess::is_alive)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process
            .as_ref()
            .filter(|p| p.is_alive())
            .and_then(|p| p.pid)
    }

    pub async fn start(&mut self) -> Result<StartOutcome> {
        if let Some(process) = &self.process {
            if process.is_alive() {
                debug!("Managed node already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            // Crashed since the last call; the monitor already reported it.
            self.process = None;
        }

        self.state = DaemonState::Probing;
        if self.api.is_reachable().await {
            if self.api.pubsub_enabled().await {
                self.state = DaemonState::Adopting;
                info!(api = self.api.base_url(), "Adopting external node with pubsub enabled");
                self.state = DaemonState::Running(Ownership::Adopted);
                return Ok(StartOutcome::Adopted);
            }

            warn!("External node is running without pubsub, requesting shutdown");
            if let Err(e) = self.api.shutdown().await {
                warn!("Shutdown request to external node failed: {}", e);
            }

            let api = self.api.clone();
            let stopped = poll_until(SHUTDOWN_POLL_ATTEMPTS, self.shutdown_poll_interval, || {
                let api = api.clone();
                async move { !api.is_reachable().await }
            })
            .await;

            if !stopped {
                error!("External node did not stop after {} polls", SHUTDOWN_POLL_ATTEMPTS);
                self.state = DaemonState::Idle;
                return Err(BridgeError::ExternalNodeRefusesToStop);
            }
            info!("External node stopped");
        }

        match self.launch().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.state = DaemonState::Idle;
                Err(e)
            }
        }
    }

    async fn launch(&mut self) -> Result<StartOutcome> {
        self.state = DaemonState::Configuring;
        if !repo_initialized(&self.settings.repo_path) {
            self.init_repo().await?;
        }
        let (profile, _) = apply_profile(self.config_store.as_ref(), &self.settings.repo_path).await;

        self.state = DaemonState::Starting;
        let mut command = Command::new(&self.settings.binary);
        command
            .env("IPFS_PATH", &self.settings.repo_path)
            .args(["daemon", "--enable-pubsub-experiment"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if profile == NetworkProfile::Private {
            command.env("LIBP2P_FORCE_PNET", "1");
        }

        let mut child = command.spawn().map_err(|e| {
            BridgeError::SpawnError(format!("{}: {}", self.settings.binary.display(), e))
        })?;
        let pid = child.id();
        info!(?pid, ?profile, "Node process spawned");

        let (ready_tx, ready_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(watch_output(stdout, "stdout", Some(ready_tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(watch_output(stderr, "stderr", None));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_process(
            child,
            stop_rx,
            self.api.clone(),
            self.settings.stop_grace,
            self.engine.clone(),
            self.events.clone(),
        ));
        self.process = Some(ManagedProcess {
            pid,
            stop_tx: Some(stop_tx),
            monitor,
        });

        let deadline = Instant::now() + self.settings.readiness_timeout;
        if let Ok(Ok(())) = timeout(self.settings.readiness_timeout, ready_rx).await {
            info!("Node is ready");
            self.state = DaemonState::Running(Ownership::Managed);
            return Ok(StartOutcome::Spawned { ready: true });
        }

        // Output closed or timed out. Give an exiting process the rest of
        // the window to be reaped before judging it.
        while self.is_managed() && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }

        if self.is_managed() {
            warn!(
                timeout_secs = self.settings.readiness_timeout.as_secs(),
                "No readiness line from node, continuing since the process is alive"
            );
            self.state = DaemonState::Running(Ownership::Managed);
            Ok(StartOutcome::Spawned { ready: false })
        } else {
            self.process = None;
            Err(BridgeError::ReadinessTimeout(self.settings.readiness_timeout.as_secs()))
        }
    }

    async fn init_repo(&self) -> Result<()> {
        info!(repo = %self.settings.repo_path.display(), "Initializing node repository");
        let output = Command::new(&self.settings.binary)
            .env("IPFS_PATH", &self.settings.repo_path)
            .arg("init")
            .output()
            .await
            .map_err(|e| {
                BridgeError::SpawnError(format!("{} init: {}", self.settings.binary.display(), e))
            })?;
        if !output.status.success() {
            return Err(BridgeError::SpawnError(format!(
                "repository init failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Stop the managed node and drop all subscription state. An adopted
    /// node is left running. Returns whether a managed process was stopped.
    pub async fn stop(&mut self) -> Result<bool> {
        let Some(mut process) = self.process.take() else {
            if self.state == DaemonState::Running(Ownership::Adopted) {
                info!("Releasing adopted node, leaving it running");
            }
            self.state = DaemonState::Idle;
            return Ok(false);
        };

        if let Some(stop_tx) = process.stop_tx.take() {
            // Err means the monitor already saw the process exit
            let _ = stop_tx.send(());
        }
        if let Err(e) = process.monitor.await {
            return Err(BridgeError::InternalError(format!("node monitor task failed: {}", e)));
        }

        self.engine.teardown();
        self.state = DaemonState::Idle;
        info!("Managed node stopped");
        Ok(true)
    }
}

async fn watch_output<R>(reader: R, stream: &'static str, mut ready_tx: Option<oneshot::Sender<()>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(stream, "node: {}", line);
                if line.contains(READY_MARKER) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(stream, "Stopped reading node output: {}", e);
                break;
            }
        }
    }
}

async fn monitor_process(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    api: NodeApi,
    grace: Duration,
    engine: SubscriptionEngine,
    events: EventSender,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => warn!(%status, "Node process exited unexpectedly"),
                Err(e) => error!("Failed to wait on node process: {}", e),
            }
            engine.teardown();
            let _ = events.send(TransportEvent::DaemonStopped);
        }
        _ = stop_rx => {
            if let Err(e) = api.shutdown().await {
                debug!("Graceful shutdown request failed: {}", e);
            }
            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "Node process exited"),
                _ => {
                    warn!("Node did not exit within {:?}, killing it", grace);
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill node process: {}", e);
                    }
                }
            }
        }
    }
}
