//! Worker process lifecycle: spawn, track by pid, bulk join on shutdown.
//!
//! The manager has no opinion about why a worker should stop. The shutdown
//! coordinator asks workers to exit through their own HTTP and UDP control
//! surfaces and then calls [`ProcessManager::shutdown_all`] to reap them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// How to launch one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Display name used in logs.
    pub name: String,
    /// UDP endpoint the worker listens on for control messages, if any.
    pub control_addr: Option<SocketAddr>,
    /// Extra environment on top of the parent's.
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            name: name.into(),
            control_addr: None,
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_control_addr(mut self, addr: SocketAddr) -> Self {
        self.control_addr = Some(addr);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("process '{0}' exited before its pid could be read")]
    NoPid(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Spawns the command directly, inheriting stdout/stderr.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false)
            .spawn()?;
        Ok(child)
    }
}

/// What to do with a worker that outlives its join timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Log and stop tracking it; the process keeps running.
    #[default]
    Abandon,
    /// Log, then SIGKILL and reap it.
    Kill,
}

pub struct TrackedProcess {
    pub pid: u32,
    pub name: String,
    pub control_addr: Option<SocketAddr>,
    child: Child,
}

/// Outcome of [`ProcessManager::shutdown_all`], by pid.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinReport {
    pub joined: Vec<u32>,
    pub already_exited: Vec<u32>,
    pub timed_out: Vec<u32>,
}

impl JoinReport {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.already_exited.is_empty() && self.timed_out.is_empty()
    }
}

pub struct ProcessManager {
    spawner: Arc<dyn WorkerSpawner>,
    timeout_action: TimeoutAction,
    processes: Mutex<HashMap<u32, TrackedProcess>>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(Arc::new(CommandSpawner))
    }
}

impl ProcessManager {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            timeout_action: TimeoutAction::default(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout_action(mut self, action: TimeoutAction) -> Self {
        self.timeout_action = action;
        self
    }

    /// Launch a worker and start tracking it. Callers should confirm the
    /// process survived startup with [`probe_alive`](Self::probe_alive).
    pub async fn spawn(&self, command: &WorkerCommand) -> Result<u32, SpawnError> {
        let child = self.spawner.spawn(command)?;
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::NoPid(command.name.clone()))?;

        tracing::info!(pid, name = %command.name, program = %command.program, "Spawned worker");

        self.processes.lock().await.insert(
            pid,
            TrackedProcess {
                pid,
                name: command.name.clone(),
                control_addr: command.control_addr,
                child,
            },
        );
        Ok(pid)
    }

    /// Wait `grace`, then report whether `pid` is tracked and still running.
    pub async fn probe_alive(&self, pid: u32, grace: Duration) -> bool {
        tokio::time::sleep(grace).await;

        let mut processes = self.processes.lock().await;
        let Some(process) = processes.get_mut(&pid) else {
            return false;
        };
        match process.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(pid, name = %process.name, %status, "Worker exited during startup");
                false
            }
            Err(e) => {
                tracing::warn!(pid, name = %process.name, error = %e, "Worker liveness probe failed");
                false
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.processes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.processes.lock().await.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub async fn control_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.processes
            .lock()
            .await
            .values()
            .filter_map(|p| p.control_addr.map(|addr| (p.pid, addr)))
            .collect()
    }

    /// Join every tracked process, each bounded by `timeout`. Records are
    /// dropped whatever the outcome.
    pub async fn shutdown_all(&self, timeout: Duration) -> JoinReport {
        let drained: Vec<TrackedProcess> = {
            let mut processes = self.processes.lock().await;
            processes.drain().map(|(_, p)| p).collect()
        };

        let mut report = JoinReport::default();
        for mut process in drained {
            let pid = process.pid;
            match process.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(pid, name = %process.name, %status, "Worker already exited");
                    report.already_exited.push(pid);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(pid, name = %process.name, error = %e, "Could not poll worker status");
                }
            }

            match tokio::time::timeout(timeout, process.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(pid, name = %process.name, %status, "Worker joined");
                    report.joined.push(pid);
                }
                Ok(Err(e)) => {
                    tracing::warn!(pid, name = %process.name, error = %e, "Failed to wait for worker");
                    report.timed_out.push(pid);
                }
                Err(_) => {
                    tracing::warn!(
                        pid,
                        name = %process.name,
                        timeout_secs = timeout.as_secs_f64(),
                        action = ?self.timeout_action,
                        "Worker did not exit before timeout"
                    );
                    if self.timeout_action == TimeoutAction::Kill
                        && let Err(e) = process.child.kill().await
                    {
                        tracing::error!(pid, name = %process.name, error = %e, "Failed to kill worker");
                    }
                    report.timed_out.push(pid);
                }
            }
        }

        report
    }
}
