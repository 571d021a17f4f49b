//! Stream registry - the directory of live worker streams.
//!
//! The registry owns one list of [`StreamDescriptor`]s behind a single mutex.
//! Registration checks key uniqueness and appends inside the same critical
//! section. Queries clone the list under the lock and filter outside it, so
//! filtering never blocks writers.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role a worker process plays for its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    Generator,
    Receiver,
    ResultsAggregator,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Receiver => "receiver",
            Self::ResultsAggregator => "results-aggregator",
        }
    }

    pub fn all() -> [StreamKind; 3] {
        [Self::Generator, Self::Receiver, Self::ResultsAggregator]
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stream kind '{0}'")]
pub struct ParseKindError(pub String);

impl FromStr for StreamKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generator" => Ok(Self::Generator),
            "receiver" => Ok(Self::Receiver),
            "results-aggregator" | "resultsaggregator" | "results_aggregator" => {
                Ok(Self::ResultsAggregator)
            }
            _ => Err(ParseKindError(s.to_string())),
        }
    }
}

/// Uniqueness key of a descriptor within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub stream_id: u32,
    pub kind: StreamKind,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.stream_id)
    }
}

/// Registry record identifying one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    #[serde(rename = "streamID")]
    pub stream_id: u32,
    /// The worker's own HTTP control port.
    #[serde(rename = "httpPort")]
    pub http_port: u16,
    #[serde(rename = "streamType")]
    pub kind: StreamKind,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl StreamDescriptor {
    pub fn new(stream_id: u32, http_port: u16, kind: StreamKind) -> Self {
        Self {
            stream_id,
            http_port,
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey {
            stream_id: self.stream_id,
            kind: self.kind,
        }
    }
}

/// Filters for [`Registry::query`]. Omitted filters pass everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamQuery {
    pub stream_id: Option<u32>,
    pub kind: Option<StreamKind>,
    /// Exact port match; overrides the other filters.
    pub http_port: Option<u16>,
}

impl StreamQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_kind(kind: StreamKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn by_key(key: StreamKey) -> Self {
        Self {
            stream_id: Some(key.stream_id),
            kind: Some(key.kind),
            http_port: None,
        }
    }

    pub fn by_port(port: u16) -> Self {
        Self {
            http_port: Some(port),
            ..Self::default()
        }
    }

    fn apply(&self, streams: Vec<StreamDescriptor>) -> Vec<StreamDescriptor> {
        if let Some(port) = self.http_port {
            return streams
                .into_iter()
                .find(|s| s.http_port == port)
                .into_iter()
                .collect();
        }

        streams
            .into_iter()
            .filter(|s| self.stream_id.is_none_or(|id| s.stream_id == id))
            .filter(|s| self.kind.is_none_or(|k| s.kind == k))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("stream {0} is already registered")]
    Duplicate(StreamKey),
    #[error("stream {0} is not registered")]
    NotFound(StreamKey),
}

/// Mutex-guarded directory of live stream descriptors.
#[derive(Debug, Default)]
pub struct Registry {
    streams: Mutex<Vec<StreamDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StreamDescriptor>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // Only push/retain touch the list; it is never left half-written.
                tracing::error!("Registry mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Insert `descriptor` unless its key is already present.
    pub fn register(&self, descriptor: StreamDescriptor) -> Result<(), RegistryError> {
        let key = descriptor.key();
        let mut streams = self.lock();
        if streams.iter().any(|s| s.key() == key) {
            return Err(RegistryError::Duplicate(key));
        }
        streams.push(descriptor);
        drop(streams);

        tracing::info!(stream = %key, "Stream registered");
        Ok(())
    }

    /// Remove exactly `descriptor`.
    pub fn deregister(&self, descriptor: &StreamDescriptor) -> Result<(), RegistryError> {
        let mut streams = self.lock();
        let before = streams.len();
        streams.retain(|s| s != descriptor);
        let removed = streams.len() != before;
        drop(streams);

        if removed {
            tracing::info!(stream = %descriptor.key(), "Stream deregistered");
            Ok(())
        } else {
            Err(RegistryError::NotFound(descriptor.key()))
        }
    }

    pub fn query(&self, query: &StreamQuery) -> Vec<StreamDescriptor> {
        let snapshot = self.lock().clone();
        query.apply(snapshot)
    }

    pub fn get(&self, key: StreamKey) -> Option<StreamDescriptor> {
        self.query(&StreamQuery::by_key(key)).into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry
            .register(StreamDescriptor::new(7, 9001, StreamKind::Receiver))
            .unwrap();

        let err = registry
            .register(StreamDescriptor::new(7, 9002, StreamKind::Receiver))
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::Duplicate(StreamKey {
                stream_id: 7,
                kind: StreamKind::Receiver
            })
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.query(&StreamQuery::all())[0].http_port, 9001);
    }

    #[test]
    fn same_id_different_kind_is_allowed() {
        let registry = Registry::new();
        registry
            .register(StreamDescriptor::new(1, 9001, StreamKind::Generator))
            .unwrap();
        registry
            .register(StreamDescriptor::new(1, 9002, StreamKind::Receiver))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn deregister_missing_is_not_found() {
        let registry = Registry::new();
        let desc = StreamDescriptor::new(3, 9003, StreamKind::Generator);
        assert!(matches!(
            registry.deregister(&desc),
            Err(RegistryError::NotFound(_))
        ));

        registry.register(desc.clone()).unwrap();
        registry.deregister(&desc).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn port_filter_short_circuits_other_filters() {
        let registry = Registry::new();
        registry
            .register(StreamDescriptor::new(1, 9001, StreamKind::Generator))
            .unwrap();
        registry
            .register(StreamDescriptor::new(2, 9002, StreamKind::Receiver))
            .unwrap();

        let query = StreamQuery {
            stream_id: Some(1),
            kind: Some(StreamKind::Generator),
            http_port: Some(9002),
        };
        let found = registry.query(&query);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].stream_id, 2);

        assert!(registry.query(&StreamQuery::by_port(1234)).is_empty());
    }

    #[test]
    fn id_and_kind_filters_narrow() {
        let registry = Registry::new();
        for (id, kind) in [
            (1, StreamKind::Generator),
            (1, StreamKind::Receiver),
            (2, StreamKind::Receiver),
        ] {
            registry
                .register(StreamDescriptor::new(id, 9000 + id as u16 * 10 + kind as u16, kind))
                .unwrap();
        }

        assert_eq!(registry.query(&StreamQuery::by_kind(StreamKind::Receiver)).len(), 2);
        let by_id = StreamQuery {
            stream_id: Some(1),
            ..StreamQuery::default()
        };
        assert_eq!(registry.query(&by_id).len(), 2);
        assert_eq!(
            registry
                .query(&StreamQuery::by_key(StreamKey {
                    stream_id: 1,
                    kind: StreamKind::Receiver
                }))
                .len(),
            1
        );
    }

    #[test]
    fn concurrent_register_and_deregister_leave_exact_set() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for t in 0..8u32 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for i in 0..50u32 {
                    let id = t * 1000 + i;
                    let desc = StreamDescriptor::new(id, (id % 60000) as u16, StreamKind::Receiver);
                    registry.register(desc.clone()).unwrap();
                    if i % 2 == 0 {
                        registry.deregister(&desc).unwrap();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let ids: HashSet<u32> = registry
            .query(&StreamQuery::all())
            .into_iter()
            .map(|s| s.stream_id)
            .collect();
        let expected: HashSet<u32> = (0..8u32)
            .flat_map(|t| (0..50u32).filter(|i| i % 2 == 1).map(move |i| t * 1000 + i))
            .collect();
        assert_eq!(ids, expected);
        assert_eq!(registry.len(), expected.len());
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Generator".parse::<StreamKind>().unwrap(), StreamKind::Generator);
        assert_eq!(
            "ResultsAggregator".parse::<StreamKind>().unwrap(),
            StreamKind::ResultsAggregator
        );
        assert!("sender".parse::<StreamKind>().is_err());
    }

    #[test]
    fn descriptor_json_field_names() {
        let desc = StreamDescriptor::new(4, 9100, StreamKind::ResultsAggregator);
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["streamID"], 4);
        assert_eq!(json["httpPort"], 9100);
        assert_eq!(json["streamType"], "results-aggregator");
        assert!(json["createdAt"].is_string());
    }
}
