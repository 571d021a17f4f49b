//! Side-by-side stream report for `GET /compare`.

use std::fmt::Write as _;
use std::str::FromStr;

use async_trait::async_trait;

use crate::client::WorkerClient;
use crate::registry::StreamDescriptor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListOrder {
    #[default]
    Id,
    Kind,
    Port,
    Created,
}

impl FromStr for ListOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "id" | "streamid" => Ok(Self::Id),
            "kind" | "type" | "streamtype" => Ok(Self::Kind),
            "port" | "httpport" => Ok(Self::Port),
            "created" | "age" => Ok(Self::Created),
            other => Err(format!("unknown list order '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompareOptions {
    pub order: ListOrder,
    pub include_sync_source_id: bool,
}

#[async_trait]
pub trait StreamComparator: Send + Sync {
    async fn compare(&self, streams: &[StreamDescriptor], options: &CompareOptions) -> String;
}

/// Fixed-width table of registered streams; optionally asks each worker
/// for its RTP sync source id (`syncSourceID` in `/stats`).
pub struct TableComparator {
    worker: WorkerClient,
}

impl TableComparator {
    pub fn new(worker: WorkerClient) -> Self {
        Self { worker }
    }

    async fn sync_source(&self, port: u16) -> String {
        match self.worker.stats(port).await {
            Ok(stats) => stats
                .get("syncSourceID")
                .and_then(|v| v.as_u64())
                .map(|ssrc| format!("0x{ssrc:08x}"))
                .unwrap_or_else(|| "-".to_string()),
            Err(e) => {
                tracing::debug!(port, error = %e, "No stats for compare report");
                "-".to_string()
            }
        }
    }
}

fn sort_streams(streams: &mut [StreamDescriptor], order: ListOrder) {
    match order {
        ListOrder::Id => streams.sort_by_key(|s| (s.stream_id, s.kind)),
        ListOrder::Kind => streams.sort_by_key(|s| (s.kind, s.stream_id)),
        ListOrder::Port => streams.sort_by_key(|s| s.http_port),
        ListOrder::Created => streams.sort_by_key(|s| s.created_at),
    }
}

#[async_trait]
impl StreamComparator for TableComparator {
    async fn compare(&self, streams: &[StreamDescriptor], options: &CompareOptions) -> String {
        if streams.is_empty() {
            return "no streams registered\n".to_string();
        }

        let mut streams = streams.to_vec();
        sort_streams(&mut streams, options.order);

        let mut out = String::new();
        let _ = write!(out, "{:<20}{:>8}{:>8}", "KIND", "ID", "PORT");
        if options.include_sync_source_id {
            let _ = write!(out, "{:>12}", "SSRC");
        }
        out.push('\n');

        for s in &streams {
            let _ = write!(out, "{:<20}{:>8}{:>8}", s.kind.as_str(), s.stream_id, s.http_port);
            if options.include_sync_source_id {
                let _ = write!(out, "{:>12}", self.sync_source(s.http_port).await);
            }
            out.push('\n');
        }
        out
    }
}
