//! Control messages exchanged between the parent and worker processes.
//!
//! Messages are JSON-encoded and then handed to the fragmenting sender, so
//! a message of any size fits the UDP path.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Worker should stop its stream, deregister and exit.
    Shutdown,
    /// Worker should clear its statistics and restart event numbering.
    ResetStats,
    Ping {
        /// Sender's wall clock, milliseconds since the Unix epoch.
        sent_at: i64,
    },
}

impl ControlMessage {
    pub fn ping() -> Self {
        Self::Ping {
            sent_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
