//! Error types shared across the relay library.

use std::time::Duration;

/// Failures on the engine link: dialing, handshaking, framed traffic.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport is not connected")]
    Disconnected,

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("unknown frame kind {0:#04x}")]
    UnknownFrameKind(u8),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-id extraction and parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("message of {0} bytes is shorter than a session id")]
    Truncated(usize),

    #[error("invalid session id {0:?}: expected 32 hex characters")]
    InvalidId(String),
}

/// Failures while establishing a viewer's engine session.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to encode session request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("engine rejected the session request: {0}")]
    Rejected(String),
}

/// Failures acquiring a shared host connection.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("engine at {hostname}:{port} is unreachable")]
    Unreachable { hostname: String, port: u16 },
}
