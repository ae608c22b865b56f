//! Error types for vault synchronization.

use std::io;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while handling a sync operation.
///
/// Every variant is frame-local: a failing frame is logged and dropped,
/// the session stays up. Session-fatal conditions (transport errors,
/// deadline expiry) are handled by the session tasks directly and never
/// pass through this type.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Path failed validation (traversal, absolute, or empty).
    #[error("path rejected: {path:?}")]
    PathRejected {
        /// The offending wire path.
        path: String,
    },

    /// Envelope or payload failed to decode.
    #[error("payload rejected: {reason}")]
    PayloadRejected {
        /// Description of the decode failure.
        reason: String,
    },

    /// Write exceeds the configured maximum file size.
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge {
        /// Size of the rejected content.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// Disk read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Token did not resolve to any identity.
    #[error("unauthorized")]
    Unauthorized,
}

impl SyncError {
    /// Creates a path rejection error.
    pub fn path_rejected(path: impl Into<String>) -> Self {
        Self::PathRejected { path: path.into() }
    }

    /// Creates a payload rejection error.
    pub fn payload_rejected(reason: impl Into<String>) -> Self {
        Self::PayloadRejected {
            reason: reason.into(),
        }
    }
}
