//! Datagram fragmentation for control messages.
//!
//! Every datagram carries a fixed header followed by a slice of the
//! message payload:
//!
//! ```text
//! +-------+------------+-------+-------+-----------+
//! | magic | message id | index | count |  payload  |
//! |  u16  |  16 bytes  |  u16  |  u16  |  n bytes  |
//! +-------+------------+-------+-------+-----------+
//! ```
//!
//! All integers are big-endian. A datagram never exceeds
//! [`MAX_DATAGRAM_SIZE`].

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Largest datagram every IPv4 host must accept.
pub const MAX_DATAGRAM_SIZE: usize = 576;

pub const FRAGMENT_MAGIC: u16 = 0x5346;

pub const HEADER_LEN: usize = 2 + 16 + 2 + 2;

/// Payload bytes carried by one full fragment.
pub const MAX_CHUNK_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_LEN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),
    #[error("fragment index {index} out of range for count {count}")]
    IndexOutOfRange { index: u16, count: u16 },
    #[error("payload of {0} bytes needs more than {max} fragments", max = u16::MAX)]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: Uuid,
    pub index: u16,
    pub count: u16,
    pub payload: Bytes,
}

impl Fragment {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u16(FRAGMENT_MAGIC);
        buf.put_slice(self.message_id.as_bytes());
        buf.put_u16(self.index);
        buf.put_u16(self.count);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, FragmentError> {
        if datagram.len() < HEADER_LEN {
            return Err(FragmentError::Truncated(datagram.len()));
        }
        let mut buf = datagram;
        let magic = buf.get_u16();
        if magic != FRAGMENT_MAGIC {
            return Err(FragmentError::BadMagic(magic));
        }
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let index = buf.get_u16();
        let count = buf.get_u16();
        if index >= count {
            return Err(FragmentError::IndexOutOfRange { index, count });
        }

        Ok(Self {
            message_id: Uuid::from_bytes(id),
            index,
            count,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

/// Split `payload` into ordered fragments sharing one fresh message id.
///
/// A payload that fits in one datagram becomes a single fragment with
/// `count == 1`.
pub fn split(payload: &[u8]) -> Result<Vec<Fragment>, FragmentError> {
    split_with_id(Uuid::new_v4(), payload)
}

pub fn split_with_id(message_id: Uuid, payload: &[u8]) -> Result<Vec<Fragment>, FragmentError> {
    let chunks = payload.len().div_ceil(MAX_CHUNK_SIZE).max(1);
    let count = u16::try_from(chunks).map_err(|_| FragmentError::TooLarge(payload.len()))?;

    if payload.is_empty() {
        return Ok(vec![Fragment {
            message_id,
            index: 0,
            count: 1,
            payload: Bytes::new(),
        }]);
    }

    Ok(payload
        .chunks(MAX_CHUNK_SIZE)
        .enumerate()
        .map(|(i, chunk)| Fragment {
            message_id,
            index: i as u16,
            count,
            payload: Bytes::copy_from_slice(chunk),
        })
        .collect())
}

struct Partial {
    parts: Vec<Option<Bytes>>,
    received: usize,
}

/// Receiver-side reassembly of fragmented messages.
///
/// Holds at most `max_in_flight` incomplete messages; the oldest is evicted
/// when a new message id arrives at capacity.
pub struct Reassembler {
    pending: HashMap<Uuid, Partial>,
    order: VecDeque<Uuid>,
    max_in_flight: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Reassembler {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Feed one fragment; returns the full payload once every index arrived.
    pub fn push(&mut self, fragment: Fragment) -> Option<Vec<u8>> {
        if fragment.count == 1 {
            return Some(fragment.payload.to_vec());
        }

        if !self.pending.contains_key(&fragment.message_id) {
            if self.pending.len() >= self.max_in_flight
                && let Some(oldest) = self.order.pop_front()
            {
                tracing::debug!(message_id = %oldest, "Evicting incomplete message");
                self.pending.remove(&oldest);
            }
            self.order.push_back(fragment.message_id);
            self.pending.insert(
                fragment.message_id,
                Partial {
                    parts: vec![None; fragment.count as usize],
                    received: 0,
                },
            );
        }

        let partial = self.pending.get_mut(&fragment.message_id)?;
        let Some(slot) = partial.parts.get_mut(fragment.index as usize) else {
            tracing::warn!(
                message_id = %fragment.message_id,
                index = fragment.index,
                "Fragment count changed mid-message, ignoring"
            );
            return None;
        };
        if slot.is_none() {
            *slot = Some(fragment.payload);
            partial.received += 1;
        }

        if partial.received < partial.parts.len() {
            return None;
        }

        let partial = self.pending.remove(&fragment.message_id)?;
        self.order.retain(|id| *id != fragment.message_id);
        let mut out = Vec::new();
        for part in partial.parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        Some(out)
    }
}
