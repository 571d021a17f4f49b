//! Incremental disk logger.
//!
//! Polls the control plane for registered streams, asks each worker for
//! the events recorded since the last checkpoint and appends them to one
//! file per representation. The logger is a pure client: it never touches
//! the registry in-process.

mod checkpoint;
mod sink;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use checkpoint::{Batch, Checkpoints, plan};
pub use sink::{EventFormat, EventPayload, EventSink, FileSink, SinkError};

use crate::client::{ClientError, ControlPlaneClient, WorkerClient};
use crate::config::OperatingMode;
use crate::registry::{StreamDescriptor, StreamKey, StreamQuery};

/// Where the logger learns about streams and their events.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn streams(&self) -> Result<Vec<StreamDescriptor>, ClientError>;

    async fn latest_sequence(&self, stream: &StreamDescriptor) -> Result<u64, ClientError>;

    async fn recent_events(
        &self,
        stream: &StreamDescriptor,
        count: u64,
        format: EventFormat,
    ) -> Result<EventPayload, ClientError>;
}

/// Streams from the control-plane server, events from each worker's
/// HTTP port.
pub struct HttpEventSource {
    control_plane: ControlPlaneClient,
    worker: WorkerClient,
}

impl HttpEventSource {
    pub fn new(control_plane: ControlPlaneClient, worker: WorkerClient) -> Self {
        Self {
            control_plane,
            worker,
        }
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn streams(&self) -> Result<Vec<StreamDescriptor>, ClientError> {
        self.control_plane.list_streams(&StreamQuery::all()).await
    }

    async fn latest_sequence(&self, stream: &StreamDescriptor) -> Result<u64, ClientError> {
        self.worker.latest_sequence(stream.http_port).await
    }

    async fn recent_events(
        &self,
        stream: &StreamDescriptor,
        count: u64,
        format: EventFormat,
    ) -> Result<EventPayload, ClientError> {
        match format {
            EventFormat::Csv => self
                .worker
                .recent_events_csv(stream.http_port, count)
                .await
                .map(EventPayload::Csv),
            EventFormat::Json => self
                .worker
                .recent_events_json(stream.http_port, count)
                .await
                .map(EventPayload::Json),
        }
    }
}

/// Outcome of one polling cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub streams: usize,
    pub batches: usize,
    pub events_requested: u64,
    pub sink_failures: usize,
    pub pruned: usize,
    /// The stream list itself could not be fetched.
    pub listing_failed: bool,
}

pub struct DiskLogger<S> {
    source: S,
    sinks: Vec<Box<dyn EventSink>>,
    checkpoints: Checkpoints,
    interval: Duration,
}

impl<S: EventSource + 'static> DiskLogger<S> {
    pub fn new(source: S, sinks: Vec<Box<dyn EventSink>>, interval: Duration) -> Self {
        Self {
            source,
            sinks,
            checkpoints: Checkpoints::new(),
            interval,
        }
    }

    /// CSV and JSON-lines sinks under `log_dir`, named after the mode.
    pub fn for_mode(
        source: S,
        log_dir: &Path,
        mode: OperatingMode,
        rotate_bytes: u64,
        interval: Duration,
    ) -> Self {
        let sinks: Vec<Box<dyn EventSink>> = vec![
            Box::new(FileSink::for_mode(EventFormat::Csv, log_dir, mode, rotate_bytes)),
            Box::new(FileSink::for_mode(EventFormat::Json, log_dir, mode, rotate_bytes)),
        ];
        Self::new(source, sinks, interval)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn checkpoint(&self, key: StreamKey) -> u64 {
        self.checkpoints.get(key)
    }

    pub async fn poll_once(&mut self) -> PollSummary {
        let mut summary = PollSummary::default();

        let streams = match self.source.streams().await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(error = %e, "Disk logger could not list streams");
                summary.listing_failed = true;
                return summary;
            }
        };
        summary.streams = streams.len();

        for stream in &streams {
            let key = stream.key();
            let latest = match self.source.latest_sequence(stream).await {
                Ok(latest) => latest,
                Err(e) => {
                    tracing::warn!(stream = %key, error = %e, "Failed to read event sequence");
                    continue;
                }
            };

            let Some(batch) = plan(self.checkpoints.get(key), latest) else {
                continue;
            };
            if batch.reset {
                tracing::info!(
                    stream = %key,
                    checkpoint = self.checkpoints.get(key),
                    latest,
                    "Event sequence went backwards, resynchronizing"
                );
            }
            // A cleared worker has nothing to fetch; `recent=0` is not "none".
            if batch.fetch == 0 {
                self.checkpoints.commit(key, &batch, true);
                continue;
            }
            summary.batches += 1;
            summary.events_requested += batch.fetch;

            let mut all_written = true;
            for sink in self.sinks.iter_mut() {
                let format = sink.format();
                let result = match self.source.recent_events(stream, batch.fetch, format).await {
                    Ok(payload) => sink.write(stream, &payload),
                    Err(e) => Err(SinkError::Fetch(e)),
                };
                if let Err(e) = result {
                    tracing::warn!(stream = %key, ?format, error = %e, "Failed to log events");
                    summary.sink_failures += 1;
                    all_written = false;
                }
            }

            if self.checkpoints.commit(key, &batch, all_written) {
                tracing::debug!(stream = %key, checkpoint = batch.latest, "Advanced checkpoint");
            }
        }

        let live: HashSet<StreamKey> = streams.iter().map(StreamDescriptor::key).collect();
        summary.pruned = self.checkpoints.retain_live(&live);
        summary
    }

    /// Poll until `token` is cancelled. One more cycle is not started once
    /// cancellation is observed.
    pub async fn run(mut self, token: CancellationToken) -> Self {
        tracing::info!(interval = ?self.interval, sinks = self.sinks.len(), "Disk logger started");
        loop {
            let summary = self.poll_once().await;
            if summary.batches > 0 {
                tracing::debug!(?summary, "Disk logger cycle");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("Disk logger stopped");
        self
    }

    pub fn spawn(self) -> DiskLoggerHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let token = token.clone();
            async move {
                self.run(token).await;
            }
        });
        DiskLoggerHandle {
            token,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Owns the logger task and its private cancellation token.
#[derive(Clone)]
pub struct DiskLoggerHandle {
    token: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DiskLoggerHandle {
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for the current cycle to finish. Safe to call twice.
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "Disk logger task panicked");
        }
    }
}
