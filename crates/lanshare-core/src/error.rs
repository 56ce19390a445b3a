//! Error types for lanshare
//!
//! Errors are split by how far they are allowed to travel:
//!
//! - **Request-level**: a single download request failed (`NotFound`,
//!   `InvalidName`, `FileTooLarge`, file `Io`). The handler logs it and keeps
//!   serving the same peer.
//! - **Connection-level**: the peer is gone or its connection is unusable
//!   (`Connection`, `SendTimeout`). Only that one session is torn down.
//! - **Server-level**: the listener could not be created or the server was
//!   driven through an invalid lifecycle transition (`Bind`, `InvalidState`).

use crate::protocol::ProtocolError;
use std::borrow::Cow;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur in lanshare operations
#[derive(Debug, Error)]
pub enum ShareError {
    // ============ Server Errors ============
    /// Failed to bind the listening socket
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested bind address
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Connection Errors ============
    /// Peer connection failed (closed, reset, write or read failure)
    #[error("Connection error: {0}")]
    Connection(Cow<'static, str>),

    /// A send did not complete within the configured timeout
    #[error("Send timed out")]
    SendTimeout,

    // ============ Request Errors ============
    /// Requested file is not present in the shared directory
    #[error("File not found: {0}")]
    NotFound(String),

    /// Requested name is not a plain file name
    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    /// Requested file exceeds the configured payload limit
    #[error("File {name} is {size} bytes, limit is {limit}")]
    FileTooLarge {
        /// File name
        name: String,
        /// Actual size in bytes
        size: u64,
        /// Configured limit in bytes
        limit: u64,
    },

    // ============ I/O and Protocol Errors ============
    /// Filesystem I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding or decoding error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ShareError {
    /// Whether the error means the peer connection itself is unusable
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::SendTimeout)
    }

    /// Whether the error is a missing (or unresolvable) file
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::InvalidName(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ShareError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ShareError::Connection(err.to_string().into())
    }
}

/// Result type alias using `ShareError`
pub type Result<T> = std::result::Result<T, ShareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_classification() {
        assert!(ShareError::Connection("reset".into()).is_connection_error());
        assert!(ShareError::SendTimeout.is_connection_error());
        assert!(!ShareError::NotFound("a.txt".into()).is_connection_error());
        assert!(!ShareError::InvalidState("stopped".into()).is_connection_error());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(ShareError::NotFound("a.txt".into()).is_not_found());
        assert!(ShareError::InvalidName("../etc".into()).is_not_found());

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(ShareError::from(io).is_not_found());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(!ShareError::from(denied).is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = ShareError::FileTooLarge {
            name: "big.iso".into(),
            size: 10,
            limit: 5,
        };
        assert_eq!(err.to_string(), "File big.iso is 10 bytes, limit is 5");
    }
}
