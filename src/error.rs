//! Mesh error types.

use std::io;
use thiserror::Error;

use crate::address::Address;
use crate::transport::Handle;

/// Mesh-specific errors.
///
/// Per-packet drop conditions (bad signature, expired TTL, blacklisted
/// sender) are not errors: the router counts them and moves on.
#[derive(Debug, Error)]
pub enum MeshError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No route is known for the target address.
    #[error("No route to {0}")]
    NoRoute(Address),

    /// Message exceeds maximum allowed size.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Invalid network magic bytes.
    #[error("Invalid network magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 4], actual: [u8; 4] },

    /// Peer frames its packets with an incompatible protocol version.
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// The connection for a handle is no longer open.
    #[error("Connection closed: {0}")]
    ConnectionClosed(Handle),

    /// Node is shutting down.
    #[error("Node shutting down")]
    Shutdown,
}

impl From<bincode::Error> for MeshError {
    fn from(err: bincode::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
