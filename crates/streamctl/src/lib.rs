//! streamctl: control plane for UDP stream measurement workers.

pub mod bridge;
pub mod client;
pub mod compare;
pub mod config;
pub mod disk_log;
pub mod oplog;
pub mod orchestrator;
pub mod presenter;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod snapshot;
pub mod transport;
pub mod whois;

pub use client::{ClientError, ControlPlaneClient, WorkerClient};
pub use config::{Config, OperatingMode};
pub use disk_log::{DiskLogger, DiskLoggerHandle, HttpEventSource};
pub use orchestrator::{ProcessManager, TimeoutAction, WorkerCommand};
pub use registry::{
    Registry, RegistryError, StreamDescriptor, StreamKey, StreamKind, StreamQuery,
};
pub use service::ControlPlaneService;
pub use shutdown::{ShutdownIntent, Teardown, TeardownReport};
pub use transport::{ServeError, ServerConfig, ServerHandle};

pub const STREAMCTL_VERSION: &str = env!("CARGO_PKG_VERSION");
