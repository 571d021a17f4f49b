//! Signal-driven, ordered shutdown.
//!
//! Signal listeners only translate OS signals into [`ShutdownIntent`]s on a
//! channel. [`run_until_shutdown`] decides when to act on them and
//! [`Teardown::run`] stops every component in dependency order, talking to
//! the registry over HTTP like any other client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{ControlMessage, FragmentSenderHandle};
use crate::client::{ControlPlaneClient, WorkerClient};
use crate::config::{Config, OperatingMode};
use crate::disk_log::DiskLoggerHandle;
use crate::orchestrator::{JoinReport, ProcessManager};
use crate::presenter::Presenter;
use crate::registry::{StreamDescriptor, StreamKey, StreamQuery};
use crate::snapshot::write_snapshot;
use crate::transport::ServerHandle;
use crate::whois::WhoisCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownIntent {
    /// Interactive request (SIGINT); the presenter may decline it.
    Requested,
    /// SIGTERM; not negotiable.
    Forced,
}

/// Install SIGINT/SIGTERM handlers and forward each delivery as an intent.
/// The task ends once the receiving side is dropped.
#[cfg(unix)]
pub fn spawn_signal_listener(tx: mpsc::Sender<ShutdownIntent>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let intent = tokio::select! {
                Some(()) = sigint.recv() => ShutdownIntent::Requested,
                Some(()) = sigterm.recv() => ShutdownIntent::Forced,
                _ = tx.closed() => break,
                else => break,
            };
            tracing::info!(?intent, "Received shutdown signal");
            if tx.send(intent).await.is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_signal_listener(tx: mpsc::Sender<ShutdownIntent>) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(ShutdownIntent::Requested).await.is_err() {
                break;
            }
        }
    }))
}

/// Block until an intent should be acted on. Declined requests are logged
/// and waiting resumes. A closed channel counts as forced.
pub async fn run_until_shutdown(
    intents: &mut mpsc::Receiver<ShutdownIntent>,
    presenter: &dyn Presenter,
) -> ShutdownIntent {
    loop {
        match intents.recv().await {
            Some(ShutdownIntent::Forced) => return ShutdownIntent::Forced,
            Some(ShutdownIntent::Requested) => {
                if presenter.confirm_shutdown().await {
                    return ShutdownIntent::Requested;
                }
                tracing::info!("Shutdown request declined");
            }
            None => {
                tracing::warn!("Shutdown channel closed, treating as forced");
                return ShutdownIntent::Forced;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Empty,
    Waiting,
    Stalled,
}

/// Detects a registry drain that stopped making progress.
///
/// Every non-empty observation that is not lower than the previous one
/// counts towards `limit`, the first one included. A drop starts the count
/// again at that observation.
#[derive(Debug)]
pub struct StallDetector {
    limit: u32,
    last: Option<usize>,
    flat: u32,
}

impl StallDetector {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            last: None,
            flat: 0,
        }
    }

    pub fn observe(&mut self, remaining: usize) -> DrainState {
        if remaining == 0 {
            return DrainState::Empty;
        }
        match self.last {
            Some(prev) if remaining >= prev => self.flat += 1,
            _ => self.flat = 1,
        }
        self.last = Some(remaining);

        if self.flat >= self.limit {
            DrainState::Stalled
        } else {
            DrainState::Waiting
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub snapshot_streams: Option<usize>,
    pub control_messages: usize,
    pub delete_requests: usize,
    /// Streams still registered when the drain stalled.
    pub remaining: Vec<StreamKey>,
    pub join: JoinReport,
}

/// Ordered teardown of every component the process started.
pub struct Teardown {
    mode: OperatingMode,
    snapshot_path: Option<PathBuf>,
    control_plane: ControlPlaneClient,
    worker: WorkerClient,
    worker_token: CancellationToken,
    sender: Option<FragmentSenderHandle>,
    transport_token: Option<CancellationToken>,
    processes: Arc<ProcessManager>,
    whois: Arc<dyn WhoisCache>,
    presenter: Arc<dyn Presenter>,
    server: Option<ServerHandle>,
    logger: Option<DiskLoggerHandle>,
    poll_interval: Duration,
    stall_polls: u32,
    join_timeout: Duration,
}

impl Teardown {
    pub fn new(
        config: &Config,
        control_plane: ControlPlaneClient,
        processes: Arc<ProcessManager>,
        whois: Arc<dyn WhoisCache>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        Self {
            mode: config.mode,
            snapshot_path: config.effective_snapshot_path(),
            control_plane,
            worker: WorkerClient::default(),
            worker_token: CancellationToken::new(),
            sender: None,
            transport_token: None,
            processes,
            whois,
            presenter,
            server: None,
            logger: None,
            poll_interval: config.shutdown_poll_interval,
            stall_polls: config.stall_polls,
            join_timeout: config.join_timeout,
        }
    }

    pub fn with_worker_client(mut self, worker: WorkerClient) -> Self {
        self.worker = worker;
        self
    }

    /// Token observed by in-process worker tasks.
    pub fn with_worker_token(mut self, token: CancellationToken) -> Self {
        self.worker_token = token;
        self
    }

    /// UDP sender for control messages, and the token its task runs under.
    pub fn with_sender(mut self, sender: FragmentSenderHandle, token: CancellationToken) -> Self {
        self.sender = Some(sender);
        self.transport_token = Some(token);
        self
    }

    pub fn with_server(mut self, server: ServerHandle) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_logger(mut self, logger: DiskLoggerHandle) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Run every step in order. Each step tolerates its component already
    /// being gone, so running twice is harmless.
    pub async fn run(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        tracing::info!(mode = self.mode.as_str(), "Teardown started");

        if self.mode == OperatingMode::Receive
            && let Some(path) = &self.snapshot_path
        {
            match write_snapshot(&self.control_plane, &self.worker, path).await {
                Ok(n) => report.snapshot_streams = Some(n),
                Err(e) => tracing::warn!(error = %e, "Registry snapshot failed"),
            }
        }

        self.worker_token.cancel();
        let addrs = self.processes.control_addrs().await;
        report.control_messages = self.send_shutdown_messages(&addrs).await;

        let streams = self.list_streams().await;
        report.delete_requests = self.request_deletes(&streams).await;

        report.remaining = self.drain().await;

        report.join = self.processes.shutdown_all(self.join_timeout).await;

        self.whois.stop().await;

        self.presenter.stop().await;
        if let Some(server) = &self.server {
            server.stop().await;
        }
        if let Some(token) = &self.transport_token {
            token.cancel();
        }

        if let Some(logger) = &self.logger {
            logger.stop().await;
        }

        tracing::info!(
            remaining = report.remaining.len(),
            joined = report.join.joined.len(),
            timed_out = report.join.timed_out.len(),
            "Teardown complete"
        );
        report
    }

    async fn send_shutdown_messages(&self, addrs: &[(u32, SocketAddr)]) -> usize {
        let Some(sender) = &self.sender else {
            return 0;
        };
        let mut sent = 0;
        for (pid, addr) in addrs {
            match sender.send_message(&ControlMessage::Shutdown, *addr).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(pid, %addr, error = %e, "Failed to queue shutdown message"),
            }
        }
        sent
    }

    /// Registered streams; an unreachable control plane reads as empty.
    async fn list_streams(&self) -> Vec<StreamDescriptor> {
        match self.control_plane.list_streams(&StreamQuery::all()).await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::debug!(error = %e, "Control plane unreachable, treating registry as empty");
                Vec::new()
            }
        }
    }

    async fn request_deletes(&self, streams: &[StreamDescriptor]) -> usize {
        let results = futures::future::join_all(streams.iter().map(|s| async move {
            let result = self.worker.delete(s.http_port).await;
            if let Err(e) = &result {
                tracing::warn!(stream = %s.key(), error = %e, "Worker delete request failed");
            }
            result.is_ok()
        }))
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    async fn drain(&self) -> Vec<StreamKey> {
        let mut detector = StallDetector::new(self.stall_polls);
        loop {
            let streams = self.list_streams().await;
            match detector.observe(streams.len()) {
                DrainState::Empty => return Vec::new(),
                DrainState::Waiting => {
                    tracing::debug!(remaining = streams.len(), "Waiting for workers to deregister");
                }
                DrainState::Stalled => {
                    let remaining: Vec<StreamKey> = streams.iter().map(StreamDescriptor::key).collect();
                    let ids: Vec<String> = remaining.iter().map(ToString::to_string).collect();
                    tracing::error!(
                        remaining = %ids.join(", "),
                        polls = self.stall_polls,
                        "Registry drain stalled, continuing shutdown"
                    );
                    return remaining;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
