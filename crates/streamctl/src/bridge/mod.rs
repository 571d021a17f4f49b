//! UDP control channel between the parent and worker processes.
//!
//! # Architecture
//!
//! - **protocol**: Control message types (JSON)
//! - **fragment**: Datagram framing, splitting and receiver-side reassembly
//! - **sender**: Bounded queue drained by one fire-and-forget sender task

pub mod fragment;
pub mod protocol;
pub mod sender;

pub use fragment::{Fragment, FragmentError, MAX_DATAGRAM_SIZE, Reassembler};
pub use protocol::ControlMessage;
pub use sender::{FragmentSender, FragmentSenderHandle, SendError, SocketSlot};
