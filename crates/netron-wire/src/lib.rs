//! Netron wire layer.
//!
//! Everything below the runtime core: the packet envelope, the
//! length-prefixed JSON codec, the transport adapter contract with its TCP
//! implementation, and the HMAC helpers used by authenticated handshakes.
//!
//! ## Architecture
//!
//! - **Packet**: flags + action + status + stream id + JSON payload
//! - **Codec**: 4-byte big-endian length header followed by the JSON body
//! - **Adapter**: binds listeners and dials connections for one transport

pub mod auth;
pub mod codec;
pub mod packet;
pub mod transport;

pub use packet::{Action, Handshake, Packet, PacketFlags, PROTOCOL_VERSION};
pub use transport::{Adapter, Connection, Listener, TcpAdapter};

use netron_types::NetronError;
use thiserror::Error;

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
}

impl From<WireError> for NetronError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => NetronError::Io(e),
            WireError::ConnectionClosed => NetronError::ConnectionClosed,
            other => NetronError::Wire(other.to_string()),
        }
    }
}
