//! Error types shared by sluice sources

use crate::batch::BatchId;
use crate::pattern::PatternError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid settings, detected at start
    Configuration,
    /// Filesystem errors
    Io,
    /// JSON (de)serialization errors
    Serialization,
    /// Batch hand-off errors
    Queue,
    /// Per-record decode failures
    Decode,
    /// Other/unknown errors
    Other,
}

/// Errors raised by the shared building blocks
#[derive(Error, Debug)]
pub enum CoreError {
    /// Pattern failed to compile
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Offset key is empty or contains a path separator
    #[error("Invalid offset key: {0}")]
    InvalidKey(String),

    /// The producing side of the batch queue went away
    #[error("Batch queue closed")]
    QueueClosed,

    /// Acknowledge for a batch that was never delivered or was already acknowledged
    #[error("Unknown batch: {0}")]
    UnknownBatch(BatchId),
}

impl CoreError {
    /// Check if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
                )
            }
            Self::Pattern(_)
            | Self::Json(_)
            | Self::InvalidKey(_)
            | Self::QueueClosed
            | Self::UnknownBatch(_) => false,
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Pattern(_) | Self::InvalidKey(_) => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Io,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::QueueClosed | Self::UnknownBatch(_) => ErrorCategory::Queue,
        }
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Pattern(_) => "PATTERN_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::InvalidKey(_) => "INVALID_OFFSET_KEY",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::UnknownBatch(_) => "UNKNOWN_BATCH",
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::QueueClosed.error_code(), "QUEUE_CLOSED");
        assert_eq!(
            CoreError::UnknownBatch(BatchId::new(7)).to_string(),
            "Unknown batch: batch-7"
        );
    }

    #[test]
    fn test_categories() {
        let io = CoreError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(io.category(), ErrorCategory::Io);
        assert!(io.is_retriable());

        let pattern = CoreError::Pattern(PatternError::EmptyPattern);
        assert_eq!(pattern.category(), ErrorCategory::Configuration);
        assert!(!pattern.is_retriable());
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&ErrorCategory::Configuration).unwrap();
        assert_eq!(json, "\"configuration\"");
    }
}
