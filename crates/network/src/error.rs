//! Transport error taxonomy.
//!
//! Framing and transport errors are fatal to the connection they occurred
//! on and never to the process; crypto-level failures travel inside
//! response bodies and do not appear here.

use mpc_wire::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("certificate verification failed: {0}")]
    CertificateVerifyFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("connection closed by peer after {received} of {expected} bytes")]
    ConnectionClosed { received: usize, expected: usize },

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("syscall error: {0}")]
    Syscall(String),

    #[error("frame validation failed: {0}")]
    Frame(#[from] ValidationError),

    #[error("protobuf parse error: {0}")]
    ProtobufParse(String),

    #[error("not connected")]
    Disconnected,

    #[error("send queue full")]
    QueueFull,

    #[error("failed to bind {address}: {reason}")]
    BindFailed { address: String, reason: String },

    #[error("failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("internal channel closed")]
    ChannelClosed,
}

impl NetworkError {
    /// Classify an I/O error from a read/write on an established stream.
    pub fn from_io(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::UnexpectedEof => NetworkError::ConnectionClosed {
                received: 0,
                expected: 0,
            },
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                NetworkError::ConnectionError(error.to_string())
            }
            ErrorKind::TimedOut => NetworkError::Timeout(error.to_string()),
            _ => NetworkError::Syscall(error.to_string()),
        }
    }

    /// Whether the error means the peer is gone (as opposed to a slow or
    /// malformed exchange).
    pub fn is_disconnection(&self) -> bool {
        matches!(
            self,
            NetworkError::ConnectionClosed { .. }
                | NetworkError::ConnectionError(_)
                | NetworkError::Disconnected
        )
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
