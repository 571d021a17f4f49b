//! Runtime configuration.
//!
//! Every knob has a default; `Config::from_env` overrides them from
//! `STREAMCTL_*` environment variables. Unparseable values are logged and
//! ignored.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::orchestrator::{TimeoutAction, WorkerCommand};

/// Whether this host generates or receives streams. Selects the event
/// file names and whether a registry snapshot is written on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperatingMode {
    #[default]
    Generate,
    Receive,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Receive => "receive",
        }
    }
}

impl FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generate" | "gen" | "tx" => Ok(Self::Generate),
            "receive" | "recv" | "rx" => Ok(Self::Receive),
            other => Err(format!("unknown operating mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub preferred_port: u16,
    /// Ports tried after `preferred_port` before giving up.
    pub port_search_span: u16,
    pub mode: OperatingMode,
    pub log_dir: PathBuf,
    pub rotate_bytes: u64,
    pub logger_poll_interval: Duration,
    pub shutdown_poll_interval: Duration,
    pub stall_polls: u32,
    pub join_timeout: Duration,
    pub timeout_action: TimeoutAction,
    pub liveness_grace: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub sender_queue_capacity: usize,
    pub workers: Vec<WorkerCommand>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            preferred_port: 8470,
            port_search_span: 64,
            mode: OperatingMode::Generate,
            log_dir: PathBuf::from("logs"),
            rotate_bytes: 10 * 1024 * 1024,
            logger_poll_interval: Duration::from_secs(1),
            shutdown_poll_interval: Duration::from_secs(1),
            stall_polls: 5,
            join_timeout: Duration::from_secs(5),
            timeout_action: TimeoutAction::Abandon,
            liveness_grace: Duration::from_millis(500),
            snapshot_path: None,
            sender_queue_capacity: 256,
            workers: Vec::new(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<f64>(name)
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    Some(matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

/// Parse `;`-separated command lines; each entry is `name=program args...`
/// or just `program args...`.
pub fn parse_worker_list(raw: &str) -> Vec<WorkerCommand> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let (name, cmdline) = match entry.split_once('=') {
                Some((name, rest)) if !name.contains(char::is_whitespace) => {
                    (Some(name.to_string()), rest)
                }
                _ => (None, entry),
            };
            let mut parts = cmdline.split_whitespace();
            let program = parts.next()?;
            let args: Vec<String> = parts.map(str::to_string).collect();
            let name = name.unwrap_or_else(|| program.to_string());
            Some(WorkerCommand::new(program, name).with_args(args))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse("STREAMCTL_PORT") {
            config.preferred_port = port;
        }
        if let Some(span) = env_parse("STREAMCTL_PORT_SPAN") {
            config.port_search_span = span;
        }
        if let Some(mode) = env_parse("STREAMCTL_MODE") {
            config.mode = mode;
        }
        if let Ok(dir) = std::env::var("STREAMCTL_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(bytes) = env_parse("STREAMCTL_ROTATE_BYTES") {
            config.rotate_bytes = bytes;
        }
        if let Some(interval) = env_secs("STREAMCTL_POLL_INTERVAL") {
            config.logger_poll_interval = interval;
            config.shutdown_poll_interval = interval;
        }
        if let Some(polls) = env_parse("STREAMCTL_STALL_POLLS") {
            config.stall_polls = polls;
        }
        if let Some(timeout) = env_secs("STREAMCTL_JOIN_TIMEOUT") {
            config.join_timeout = timeout;
        }
        if let Some(true) = env_flag("STREAMCTL_KILL_ON_TIMEOUT") {
            config.timeout_action = TimeoutAction::Kill;
        }
        if let Ok(path) = std::env::var("STREAMCTL_SNAPSHOT") {
            config.snapshot_path = Some(PathBuf::from(path));
        }
        if let Ok(raw) = std::env::var("STREAMCTL_WORKERS") {
            config.workers = parse_worker_list(&raw);
        }

        config
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.preferred_port = port;
        self
    }

    pub fn with_mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_rotate_bytes(mut self, bytes: u64) -> Self {
        self.rotate_bytes = bytes;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.logger_poll_interval = interval;
        self.shutdown_poll_interval = interval;
        self
    }

    pub fn with_stall_polls(mut self, polls: u32) -> Self {
        self.stall_polls = polls;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Snapshot location, defaulting into the log directory in receive mode.
    pub fn effective_snapshot_path(&self) -> Option<PathBuf> {
        match (&self.snapshot_path, self.mode) {
            (Some(path), _) => Some(path.clone()),
            (None, OperatingMode::Receive) => Some(self.log_dir.join("registry_snapshot.json")),
            (None, OperatingMode::Generate) => None,
        }
    }
}
