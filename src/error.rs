//! Error kinds surfaced by the transport and sync layers.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for peer operations.
pub type PeerResult<T> = Result<T, PeerError>;

/// Errors raised by the peer, its connections and the action protocol.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The requested TCP+UDP port pair could not be bound.
    #[error("port {port} is not available: {source}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Outbound dial failed; the registry is left unchanged.
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The beacon socket is unusable.
    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    /// Mid-stream failure on a connection. The connection is closed.
    #[error("connection i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A received manifest could not be parsed.
    #[error("malformed manifest: {0}")]
    ManifestMalformed(#[from] serde_json::Error),

    /// A received file could not be materialized locally. The stream stays framed.
    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PeerError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PeerError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// True when the error leaves the connection unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, PeerError::Io(_))
    }
}
