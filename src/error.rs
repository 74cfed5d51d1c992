//! Error types for framecast

use std::net::SocketAddr;

use crate::capture::PlaneKind;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Listening socket could not be created or bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Bind address could not be parsed
    #[error("invalid bind address {0:?}")]
    InvalidAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raw plane declares bytes but carries no data pointer
    #[error("{plane} plane declares {size} bytes but has no data")]
    MissingPlaneData { plane: PlaneKind, size: u32 },

    /// Raw plane holds fewer bytes than it declares
    #[error("{plane} plane declares {declared} bytes but only {available} are readable")]
    TruncatedPlane {
        plane: PlaneKind,
        declared: u32,
        available: usize,
    },

    #[error("failed to allocate {size} bytes for {plane} plane")]
    Allocation { plane: PlaneKind, size: usize },

    /// Header declares a plane larger than the reader accepts
    #[error("{plane} plane of {size} bytes exceeds the {limit} byte limit")]
    PlaneTooLarge {
        plane: PlaneKind,
        size: u32,
        limit: u32,
    },

    /// Message is shorter than its header declares
    #[error("truncated message: expected {expected} bytes, got {actual}")]
    TruncatedMessage { expected: usize, actual: usize },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
