//! HTTP clients for the control-plane server and for individual workers.
//!
//! Everything outside the server process (disk logger, shutdown
//! coordinator, dashboards) talks to the registry through
//! [`ControlPlaneClient`], so the same code path serves local and remote
//! workers.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::registry::{StreamDescriptor, StreamKey, StreamKind, StreamQuery};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("response from {url} is missing '{field}'")]
    MissingField { url: String, field: &'static str },
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("streamctl/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

async fn check(url: &str, response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Client for the control-plane server's RPC surface.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base: String,
}

impl ControlPlaneClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_base_url(format!("http://{addr}"))
    }

    pub fn with_base_url(base: impl Into<String>) -> Self {
        Self {
            http: http_client(DEFAULT_TIMEOUT),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn list_streams(
        &self,
        query: &StreamQuery,
    ) -> Result<Vec<StreamDescriptor>, ClientError> {
        let url = self.url("/streams");
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(id) = query.stream_id {
            params.push(("streamID", id.to_string()));
        }
        if let Some(kind) = query.kind {
            params.push(("streamType", kind.to_string()));
        }
        if let Some(port) = query.http_port {
            params.push(("httpPort", port.to_string()));
        }

        let response = self.http.get(&url).query(&params).send().await?;
        Ok(check(&url, response).await?.json().await?)
    }

    pub async fn get_stream(&self, key: StreamKey) -> Result<Option<StreamDescriptor>, ClientError> {
        let url = self.url(&format!("/streams/{}/{}", key.kind, key.stream_id));
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(&url, response).await?.json().await?))
    }

    pub async fn register(
        &self,
        stream_id: u32,
        http_port: u16,
        kind: StreamKind,
    ) -> Result<StreamDescriptor, ClientError> {
        let url = self.url("/streams/add");
        let form = [
            ("streamID", stream_id.to_string()),
            ("httpPort", http_port.to_string()),
            ("streamType", kind.to_string()),
        ];
        let response = self.http.post(&url).form(&form).send().await?;
        Ok(check(&url, response).await?.json().await?)
    }

    pub async fn deregister(&self, key: StreamKey) -> Result<(), ClientError> {
        let url = self.url(&format!("/streams/delete/{}/{}", key.kind, key.stream_id));
        let response = self.http.delete(&url).send().await?;
        check(&url, response).await?;
        Ok(())
    }

    pub async fn append_log(&self, message: &str) -> Result<(), ClientError> {
        let url = self.url("/log");
        let response = self
            .http
            .post(&url)
            .form(&[("message", message)])
            .send()
            .await?;
        check(&url, response).await?;
        Ok(())
    }

    pub async fn read_log(&self) -> Result<String, ClientError> {
        let url = self.url("/log");
        let response = self.http.get(&url).send().await?;
        Ok(check(&url, response).await?.text().await?)
    }

    pub async fn alert(&self, title: &str, body: &str) -> Result<(), ClientError> {
        let url = self.url("/alert");
        let response = self
            .http
            .post(&url)
            .form(&[("title", title), ("body", body)])
            .send()
            .await?;
        check(&url, response).await?;
        Ok(())
    }

    pub async fn whois(&self, addresses: &[&str]) -> Result<Vec<(String, String)>, ClientError> {
        let url = self.url("/whois");
        let params: Vec<(String, &str)> = addresses
            .iter()
            .enumerate()
            .map(|(i, addr)| (i.to_string(), *addr))
            .collect();
        let response = self.http.get(&url).query(&params).send().await?;
        Ok(check(&url, response).await?.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct WorkerStats {
    #[serde(rename = "eventSequence")]
    event_sequence: Option<u64>,
}

/// Client for a worker's own HTTP surface (`/stats`, `/events`, `/delete`).
#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    host: String,
}

impl Default for WorkerClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl WorkerClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: http_client(timeout),
            host: "127.0.0.1".to_string(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }

    pub async fn stats(&self, port: u16) -> Result<serde_json::Value, ClientError> {
        let url = self.url(port, "/stats");
        let response = self.http.get(&url).send().await?;
        Ok(check(&url, response).await?.json().await?)
    }

    /// Sequence number of the newest event the worker has recorded.
    pub async fn latest_sequence(&self, port: u16) -> Result<u64, ClientError> {
        let url = self.url(port, "/stats");
        let response = self.http.get(&url).send().await?;
        let stats: WorkerStats = check(&url, response).await?.json().await?;
        stats.event_sequence.ok_or(ClientError::MissingField {
            url,
            field: "eventSequence",
        })
    }

    /// The `count` most recent events as CSV lines.
    pub async fn recent_events_csv(&self, port: u16, count: u64) -> Result<String, ClientError> {
        let url = self.url(port, "/events");
        let response = self
            .http
            .get(&url)
            .query(&[("recent", count.to_string()), ("format", "csv".to_string())])
            .send()
            .await?;
        Ok(check(&url, response).await?.text().await?)
    }

    /// The `count` most recent events as JSON objects.
    pub async fn recent_events_json(
        &self,
        port: u16,
        count: u64,
    ) -> Result<Vec<serde_json::Value>, ClientError> {
        let url = self.url(port, "/events");
        let response = self
            .http
            .get(&url)
            .query(&[("recent", count.to_string()), ("format", "json".to_string())])
            .send()
            .await?;
        Ok(check(&url, response).await?.json().await?)
    }

    /// Ask the worker to deregister itself and exit.
    pub async fn delete(&self, port: u16) -> Result<(), ClientError> {
        let url = self.url(port, "/delete");
        let response = self.http.delete(&url).send().await?;
        check(&url, response).await?;
        Ok(())
    }
}
