//! Free-text operational log behind `GET/POST /log`.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

pub trait OperationalLog: Send + Sync {
    fn append(&self, message: &str);

    /// Render all retained entries, oldest first, one per line.
    fn render(&self) -> String;
}

#[derive(Debug, Clone)]
struct Entry {
    at: DateTime<Utc>,
    message: String,
}

/// Bounded in-memory log; the oldest entry is dropped at capacity.
pub struct MemoryLog {
    entries: Mutex<VecDeque<Entry>>,
    capacity: usize,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MemoryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

impl OperationalLog for MemoryLog {
    fn append(&self, message: &str) {
        tracing::info!(target: "streamctl::oplog", "{}", message);

        let Ok(mut entries) = self.entries.lock() else {
            tracing::error!("Operational log mutex poisoned");
            return;
        };
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(Entry {
            at: Utc::now(),
            message: message.to_string(),
        });
    }

    fn render(&self) -> String {
        let Ok(entries) = self.entries.lock() else {
            return String::new();
        };
        entries
            .iter()
            .map(|e| format!("{} {}\n", e.at.format("%Y-%m-%d %H:%M:%S%.3f"), e.message))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_entries() {
        let log = MemoryLog::new(2);
        log.append("one");
        log.append("two");
        log.append("three");

        let text = log.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" two"));
        assert!(lines[1].ends_with(" three"));
    }

    #[test]
    fn empty_renders_empty() {
        assert_eq!(MemoryLog::default().render(), "");
    }
}
