//! HTTP server implementation.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::service::ControlPlaneService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub preferred_port: u16,
    /// How many consecutive ports to try, starting at `preferred_port`.
    pub port_search_span: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            preferred_port: 8470,
            port_search_span: 64,
        }
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            preferred_port: config.preferred_port,
            port_search_span: config.port_search_span,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("invalid listen address '{0}'")]
    BadAddress(String),
    #[error("no free port in {host}:{first}..={last}")]
    NoFreePort { host: String, first: u16, last: u16 },
    #[error("listener error: {0}")]
    Io(#[from] io::Error),
}

/// Bind the first free port in `preferred_port ..= preferred_port + span - 1`.
/// Port 0 asks the OS for any free port.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, ServeError> {
    let ip: IpAddr = config
        .host
        .parse()
        .map_err(|_| ServeError::BadAddress(config.host.clone()))?;

    if config.preferred_port == 0 {
        return Ok(TcpListener::bind(SocketAddr::new(ip, 0)).await?);
    }

    let first = config.preferred_port;
    let last = first.saturating_add(config.port_search_span.max(1) - 1);
    for port in first..=last {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => {
                if port != first {
                    info!(preferred = first, port, "Preferred port busy, using fallback");
                }
                return Ok(listener);
            }
            Err(e) => {
                tracing::debug!(port, error = %e, "Port unavailable");
            }
        }
    }

    Err(ServeError::NoFreePort {
        host: config.host.clone(),
        first,
        last,
    })
}

/// Running control-plane server.
#[derive(Clone)]
pub struct ServerHandle {
    addr: SocketAddr,
    token: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop accepting, drain in-flight requests and wait for the server
    /// task. Safe to call more than once.
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Server task panicked");
            }
            info!("Server shutdown complete");
        }
    }
}

/// Bind and start serving in a background task.
pub async fn start(
    config: ServerConfig,
    service: Arc<ControlPlaneService>,
) -> Result<ServerHandle, ServeError> {
    let listener = bind(&config).await?;
    let addr = listener.local_addr()?;
    let app = routes(service);
    let token = CancellationToken::new();

    info!("Starting control-plane server on {}", addr);

    let task = tokio::spawn({
        let token = token.clone();
        async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "Control-plane server failed");
            }
        }
    });

    Ok(ServerHandle {
        addr,
        token,
        task: Arc::new(Mutex::new(Some(task))),
    })
}
