//! Per-stream write checkpoints.
//!
//! A checkpoint is the newest event sequence number already written to
//! disk. Checkpoints live in memory only; after a restart every stream
//! starts at 0 and its full recent history is written again.

use std::collections::{HashMap, HashSet};

use crate::registry::StreamKey;

/// What to fetch for one stream in one polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// Number of most-recent events to fetch.
    pub fetch: u64,
    /// The worker's latest sequence number at planning time.
    pub latest: u64,
    /// The worker's counter went backwards (stats were cleared).
    pub reset: bool,
}

/// Plan the next batch, or `None` when nothing new was recorded.
///
/// A reset to 0 yields a batch with `fetch == 0`; callers resync the
/// checkpoint without asking the worker for events.
pub fn plan(checkpoint: u64, latest: u64) -> Option<Batch> {
    if latest < checkpoint {
        return Some(Batch {
            fetch: latest,
            latest,
            reset: true,
        });
    }
    if latest == checkpoint {
        return None;
    }
    Some(Batch {
        fetch: latest - checkpoint,
        latest,
        reset: false,
    })
}

#[derive(Debug, Default)]
pub struct Checkpoints {
    written: HashMap<StreamKey, u64>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: StreamKey) -> u64 {
        self.written.get(&key).copied().unwrap_or(0)
    }

    pub fn set(&mut self, key: StreamKey, sequence: u64) {
        self.written.insert(key, sequence);
    }

    /// Advance after a batch. A normal batch advances only if every sink
    /// succeeded; a reset batch always resynchronizes.
    pub fn commit(&mut self, key: StreamKey, batch: &Batch, all_written: bool) -> bool {
        if batch.reset || all_written {
            self.set(key, batch.latest);
            true
        } else {
            false
        }
    }

    /// Drop checkpoints of streams that are no longer registered.
    pub fn retain_live(&mut self, live: &HashSet<StreamKey>) -> usize {
        let before = self.written.len();
        self.written.retain(|key, _| live.contains(key));
        before - self.written.len()
    }

    pub fn len(&self) -> usize {
        self.written.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }
}
