//! Shared error types for the Netron runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top-level error type for the Netron runtime.
#[derive(Error, Debug)]
pub enum NetronError {
    /// A gate, adapter, context or peer uid is already registered.
    #[error("Already exists: {0}")]
    Exists(String),

    /// A gate or adapter referenced by id was never registered.
    #[error("Unknown: {0}")]
    Unknown(String),

    /// A context, definition or peer was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A caller supplied a malformed argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection or handshake confirmation was rejected.
    #[error("Access denied: {0}")]
    InvalidAccess(String),

    /// A value failed validation (bad IP address, bad subnet, bad packet).
    #[error("Not valid: {0}")]
    NotValid(String),

    /// The operation is refused by local policy.
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// The peer is in a state that does not permit the operation.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The connection closed before a reply arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No reply arrived within the configured response timeout.
    #[error("Response timeout after {0} ms")]
    Timeout(u64),

    /// A context method or property access failed.
    #[error("Context error: {0}")]
    Context(String),

    /// The remote side answered with a negative reply.
    #[error("Remote {kind} error: {message}")]
    Remote {
        /// Kind of failure reported by the peer.
        kind: ErrorKind,
        /// Human-readable message from the peer.
        message: String,
    },

    /// Framing, serialization or transport failure.
    #[error("Wire error: {0}")]
    Wire(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetronError {
    /// The serialisable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetronError::Exists(_) => ErrorKind::Exists,
            NetronError::Unknown(_) => ErrorKind::Unknown,
            NetronError::NotFound(_) => ErrorKind::NotFound,
            NetronError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            NetronError::InvalidAccess(_) => ErrorKind::InvalidAccess,
            NetronError::NotValid(_) => ErrorKind::NotValid,
            NetronError::NotAllowed(_) => ErrorKind::NotAllowed,
            NetronError::IllegalState(_) => ErrorKind::IllegalState,
            NetronError::ConnectionClosed => ErrorKind::ConnectionClosed,
            NetronError::Timeout(_) => ErrorKind::Timeout,
            NetronError::Context(_) => ErrorKind::Context,
            NetronError::Remote { kind, .. } => *kind,
            NetronError::Wire(_) | NetronError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Convert into a wire-level negative reply body.
    pub fn to_remote(&self) -> RemoteError {
        let message = match self {
            NetronError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        RemoteError {
            kind: self.kind(),
            message,
        }
    }
}

/// Serialisable discriminant of [`NetronError`], carried in negative replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Exists,
    Unknown,
    NotFound,
    InvalidArgument,
    InvalidAccess,
    NotValid,
    NotAllowed,
    IllegalState,
    ConnectionClosed,
    Timeout,
    Context,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Exists => "exists",
            ErrorKind::Unknown => "unknown",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::InvalidAccess => "invalid_access",
            ErrorKind::NotValid => "not_valid",
            ErrorKind::NotAllowed => "not_allowed",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::ConnectionClosed => "connection_closed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Context => "context",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Body of a negative reply (`ERROR` flag set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Kind of failure.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl From<RemoteError> for NetronError {
    fn from(err: RemoteError) -> Self {
        NetronError::Remote {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// Alias for Result with NetronError.
pub type NetronResult<T> = Result<T, NetronError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_remote_roundtrip() {
        let err = NetronError::Exists("peer 'b' already connected".to_string());
        let remote = err.to_remote();
        assert_eq!(remote.kind, ErrorKind::Exists);

        let json = serde_json::to_string(&remote).unwrap();
        assert!(json.contains("\"exists\""));

        let back: NetronError = serde_json::from_str::<RemoteError>(&json).unwrap().into();
        assert_eq!(back.kind(), ErrorKind::Exists);
        assert!(back.to_string().contains("already connected"));
    }

    #[test]
    fn test_remote_message_not_double_wrapped() {
        let err = NetronError::Remote {
            kind: ErrorKind::NotFound,
            message: "no context 'calc'".to_string(),
        };
        assert_eq!(err.to_remote().message, "no context 'calc'");
    }

    #[test]
    fn test_io_maps_to_internal() {
        let err: NetronError = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
