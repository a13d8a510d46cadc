//! Error types for frame storage operations

use thiserror::Error;

/// Result type for frame storage operations
pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors raised by frame stores and the frame state machine
#[derive(Error, Debug)]
pub enum FrameError {
    /// No frame exists under the given token, or it has already expired
    /// and been reclaimed by the backend.
    #[error("Resumption token expired or unknown: {0}")]
    TokenExpired(String),

    /// A single-shot transition (`approve`, `reject`) was attempted on a
    /// frame that is no longer pending.
    #[error("Invalid frame transition from '{from}' via '{attempted}'")]
    InvalidStateTransition {
        /// Status the frame was actually in
        from: String,
        /// The transition that was attempted
        attempted: String,
    },

    /// A compare-and-set lost the race: the stored status did not match
    /// the expected one.
    #[error("Frame status changed concurrently for token: {0}")]
    CasConflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific storage failure (connection lost, disk full, ...)
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Custom(String),
}
