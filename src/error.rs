//! Error types for xcapture.

use thiserror::Error;

/// Main error type for all capture operations.
///
/// The recoverable/fatal split is structural: parsing and storage faults
/// never abort a capture session, while transport and configuration faults
/// do. See [`CaptureError::is_fatal`].
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Malformed heap or item data. Recoverable: the datagram is dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Archive container write failure. Recoverable: that record is lost.
    #[error("storage error: {0}")]
    Storage(#[source] std::io::Error),

    /// Socket bind/receive/send failure. Fatal, propagates to the session
    /// supervisor.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// Missing or invalid session parameter. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// MessagePack serialization error (descriptors, metadata, records).
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A queue or channel closed during teardown.
    #[error("session shut down")]
    Shutdown,
}

impl CaptureError {
    /// Whether this error terminates the capture session.
    ///
    /// Only transport-level and startup configuration failures are fatal;
    /// everything else is logged, counted, and survived.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Config(_))
    }
}

/// Result type alias using CaptureError.
pub type Result<T> = std::result::Result<T, CaptureError>;
