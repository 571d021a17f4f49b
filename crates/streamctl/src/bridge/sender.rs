//! Fire-and-forget UDP sender for fragmented control messages.
//!
//! Producers enqueue `(payload, destination)` pairs on a bounded channel; a
//! single consumer task splits each payload and sends the fragments in
//! order. The socket is looked up in the [`SocketSlot`] for every datagram,
//! so another component may swap it at any time.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::fragment::{self, FragmentError};
use super::protocol::ControlMessage;

/// How long one queue wait may block before the cancel flag is re-checked.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared, replaceable UDP socket handle.
#[derive(Clone)]
pub struct SocketSlot {
    inner: Arc<RwLock<Arc<UdpSocket>>>,
}

impl SocketSlot {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(socket))),
        }
    }

    /// Bind an ephemeral loopback socket.
    pub async fn bind_loopback() -> std::io::Result<Self> {
        Ok(Self::new(UdpSocket::bind("127.0.0.1:0").await?))
    }

    pub fn current(&self) -> Arc<UdpSocket> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a new socket; in-flight sends keep the old one until they finish.
    pub fn replace(&self, socket: UdpSocket) {
        let socket = Arc::new(socket);
        match self.inner.write() {
            Ok(mut guard) => *guard = socket,
            Err(poisoned) => *poisoned.into_inner() = socket,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub payload: Vec<u8>,
    pub dest: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sender queue closed")]
    Closed,
}

/// Producer side of the sender queue.
#[derive(Clone)]
pub struct FragmentSenderHandle {
    tx: mpsc::Sender<Outbound>,
}

impl FragmentSenderHandle {
    /// Enqueue raw bytes, waiting for queue space.
    pub async fn send(&self, payload: Vec<u8>, dest: SocketAddr) -> Result<(), SendError> {
        self.tx
            .send(Outbound { payload, dest })
            .await
            .map_err(|_| SendError::Closed)
    }

    pub async fn send_message(
        &self,
        message: &ControlMessage,
        dest: SocketAddr,
    ) -> Result<(), SendError> {
        let payload = message.to_bytes()?;
        self.send(payload, dest).await
    }
}

pub struct FragmentSender;

impl FragmentSender {
    /// Start the consumer task. It exits once `token` is cancelled or every
    /// handle has been dropped.
    pub fn spawn(
        socket: SocketSlot,
        capacity: usize,
        token: CancellationToken,
    ) -> (FragmentSenderHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run_sender(socket, rx, token));
        (FragmentSenderHandle { tx }, task)
    }
}

async fn run_sender(
    socket: SocketSlot,
    mut rx: mpsc::Receiver<Outbound>,
    token: CancellationToken,
) {
    tracing::debug!("Fragment sender started");

    while !token.is_cancelled() {
        let outbound = match tokio::time::timeout(QUEUE_POLL_INTERVAL, rx.recv()).await {
            Ok(Some(outbound)) => outbound,
            Ok(None) => {
                tracing::debug!("All sender handles dropped");
                break;
            }
            // Empty queue.
            Err(_) => continue,
        };

        if let Err(e) = send_fragmented(&socket, &outbound).await {
            tracing::warn!(dest = %outbound.dest, error = %e, "Dropping control message");
        }
    }

    tracing::debug!("Fragment sender exiting");
}

#[derive(Debug, thiserror::Error)]
enum DeliveryError {
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error("send of fragment {index}/{count} failed: {source}")]
    Io {
        index: u16,
        count: u16,
        source: std::io::Error,
    },
}

async fn send_fragmented(socket: &SocketSlot, outbound: &Outbound) -> Result<(), DeliveryError> {
    let fragments = fragment::split(&outbound.payload)?;
    let count = fragments.len();
    if count > 1 {
        tracing::trace!(
            dest = %outbound.dest,
            payload_bytes = outbound.payload.len(),
            fragments = count,
            "Fragmenting control message"
        );
    }

    for frag in fragments {
        let datagram = frag.encode();
        socket
            .current()
            .send_to(&datagram, outbound.dest)
            .await
            .map_err(|source| DeliveryError::Io {
                index: frag.index,
                count: frag.count,
                source,
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fragment::{Fragment, MAX_DATAGRAM_SIZE, Reassembler};

    async fn recv_message(socket: &UdpSocket) -> Vec<u8> {
        let mut reassembler = Reassembler::default();
        let mut buf = [0u8; 2048];
        loop {
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n <= MAX_DATAGRAM_SIZE);
            let frag = Fragment::decode(&buf[..n]).unwrap();
            if let Some(done) = reassembler.push(frag) {
                return done;
            }
        }
    }

    #[tokio::test]
    async fn delivers_large_payload_in_fragments() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();

        let token = CancellationToken::new();
        let slot = SocketSlot::bind_loopback().await.unwrap();
        let (handle, task) = FragmentSender::spawn(slot, 8, token.clone());

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 200) as u8).collect();
        handle.send(payload.clone(), dest).await.unwrap();

        assert_eq!(recv_message(&receiver).await, payload);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn control_message_roundtrip() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();

        let token = CancellationToken::new();
        let slot = SocketSlot::bind_loopback().await.unwrap();
        let (handle, _task) = FragmentSender::spawn(slot, 8, token.clone());

        handle
            .send_message(&ControlMessage::Shutdown, dest)
            .await
            .unwrap();

        let bytes = recv_message(&receiver).await;
        assert_eq!(ControlMessage::from_bytes(&bytes).unwrap(), ControlMessage::Shutdown);
        token.cancel();
    }

    #[tokio::test]
    async fn uses_replaced_socket() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();

        let token = CancellationToken::new();
        let slot = SocketSlot::bind_loopback().await.unwrap();
        let (handle, _task) = FragmentSender::spawn(slot.clone(), 8, token.clone());

        let replacement = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let replacement_addr = replacement.local_addr().unwrap();
        slot.replace(replacement);

        handle.send(b"ping".to_vec(), dest).await.unwrap();

        let mut buf = [0u8; 128];
        let (_, from) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, replacement_addr);
        token.cancel();
    }

    #[tokio::test]
    async fn failed_send_does_not_stall_queue() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();
        // An IPv4 socket cannot send to an IPv6 address.
        let unreachable: SocketAddr = "[::1]:9".parse().unwrap();

        let token = CancellationToken::new();
        let slot = SocketSlot::bind_loopback().await.unwrap();
        let (handle, task) = FragmentSender::spawn(slot, 8, token.clone());

        handle.send(b"lost".to_vec(), unreachable).await.unwrap();
        handle.send(b"after".to_vec(), dest).await.unwrap();

        assert_eq!(recv_message(&receiver).await, b"after");
        assert!(!task.is_finished());

        handle.send(b"again".to_vec(), dest).await.unwrap();
        assert_eq!(recv_message(&receiver).await, b"again");

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn exits_promptly_on_cancel() {
        let token = CancellationToken::new();
        let slot = SocketSlot::bind_loopback().await.unwrap();
        let (_handle, task) = FragmentSender::spawn(slot, 1, token.clone());

        token.cancel();
        tokio::time::timeout(QUEUE_POLL_INTERVAL * 5, task)
            .await
            .expect("sender did not observe cancellation")
            .unwrap();
    }
}
