//! Receive-mode registry snapshot, written once during teardown.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{ClientError, ControlPlaneClient, WorkerClient};
use crate::registry::{StreamDescriptor, StreamQuery};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to list streams: {0}")]
    Listing(#[from] ClientError),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub descriptor: StreamDescriptor,
    /// Worker `/stats` body, `null` if the worker did not answer.
    pub stats: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(rename = "takenAt")]
    pub taken_at: DateTime<Utc>,
    pub streams: Vec<SnapshotEntry>,
}

impl RegistrySnapshot {
    /// Collect descriptors and per-worker stats through the HTTP clients.
    pub async fn collect(
        control_plane: &ControlPlaneClient,
        worker: &WorkerClient,
    ) -> Result<Self, SnapshotError> {
        let descriptors = control_plane.list_streams(&StreamQuery::all()).await?;
        let stats = futures::future::join_all(descriptors.iter().map(|d| async move {
            match worker.stats(d.http_port).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::warn!(stream = %d.key(), error = %e, "No stats for snapshot");
                    None
                }
            }
        }))
        .await;

        Ok(Self {
            taken_at: Utc::now(),
            streams: descriptors
                .into_iter()
                .zip(stats)
                .map(|(descriptor, stats)| SnapshotEntry { descriptor, stats })
                .collect(),
        })
    }

    /// Write to a sibling temp file, then rename over `path`.
    pub fn write_to(&self, path: &Path) -> Result<(), SnapshotError> {
        let io_err = |source: io::Error| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        };
        let body = serde_json::to_vec_pretty(self)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

/// Collect and write a snapshot, returning how many streams it holds.
pub async fn write_snapshot(
    control_plane: &ControlPlaneClient,
    worker: &WorkerClient,
    path: &Path,
) -> Result<usize, SnapshotError> {
    let snapshot = RegistrySnapshot::collect(control_plane, worker).await?;
    snapshot.write_to(path)?;
    tracing::info!(path = %path.display(), streams = snapshot.streams.len(), "Wrote registry snapshot");
    Ok(snapshot.streams.len())
}
