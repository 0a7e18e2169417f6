//! Error types shared by geonotes crates

use thiserror::Error;

/// Result type alias for shared geonotes operations
pub type Result<T> = std::result::Result<T, GeoNotesError>;

/// Errors raised by the shared utilities (checksums, logging, file helpers)
#[derive(Error, Debug)]
pub enum GeoNotesError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl GeoNotesError {
    /// Whether the error means the inspected bytes are wrong rather than unreadable
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, GeoNotesError::ChecksumMismatch { .. })
    }
}
