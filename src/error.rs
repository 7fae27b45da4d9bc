//! Error taxonomy for the bridge
//!
//! Every fallible operation in the library returns [`BridgeError`]. The
//! variants follow the failure scopes of the system: connection-level faults
//! (`Protocol`, `Disconnected`) end a single connection, client-level faults
//! (`DaemonUnreachable`, `Spawn`) end a single `execute` call, and kernel-level
//! faults (`NoSessionFound`, `Kernel`) are reported to the caller inside a
//! `Failure` response.

use std::io;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed frame: unknown type tag, oversized payload, or a message
    /// arriving in the wrong direction
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream before a read or write completed
    #[error("peer disconnected")]
    Disconnected,

    /// The client could not reach a daemon, even after spawning one
    #[error("daemon unreachable at {addr}: {reason}")]
    DaemonUnreachable { addr: String, reason: String },

    /// The daemon executable could not be started
    #[error("failed to spawn daemon: {0}")]
    Spawn(String),

    /// No running interpreter could be discovered
    #[error("no running kernel found: {0}")]
    NoSessionFound(String),

    /// The configured port is already bound, normally by another daemon
    #[error("a daemon is already listening on port {0}")]
    AlreadyRunning(u16),

    /// The interpreter transport produced something we cannot use
    #[error("kernel error: {0}")]
    Kernel(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Classify an I/O error, folding the "peer went away" kinds into
    /// [`BridgeError::Disconnected`]
    pub fn from_stream_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => BridgeError::Disconnected,
            _ => BridgeError::Io(err),
        }
    }

    /// True when the error only means the other side hung up
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BridgeError::Disconnected)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Kernel(format!("malformed kernel message: {}", err))
    }
}
