//! Error types for the directory spooler

use sluice_core::{CoreError, ErrorCategory};
use thiserror::Error;

/// Spooler errors
#[derive(Error, Debug)]
pub enum SpoolError {
    /// Invalid settings, detected at start
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A record or file could not be decoded
    #[error("Decode error in {file} at offset {offset}: {message}")]
    Decode {
        file: String,
        offset: u64,
        message: String,
    },

    /// Archive/delete/quarantine failed; the file stays where it is
    #[error("Post-processing failed for {file}: {message}")]
    PostProcess { file: String, message: String },

    /// The watched directory vanished or cannot be listed
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Batch hand-off or offset storage error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Operation on a source that is not running
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SpoolError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a post-processing error
    pub fn post_process(file: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PostProcess {
            file: file.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

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
            Self::Core(e) => e.is_retriable(),
            Self::PostProcess { .. } => true,
            Self::Configuration(_)
            | Self::Decode { .. }
            | Self::DirectoryUnavailable(_)
            | Self::InvalidState(_) => false,
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Decode { .. } => ErrorCategory::Decode,
            Self::PostProcess { .. } | Self::DirectoryUnavailable(_) | Self::Io(_) => {
                ErrorCategory::Io
            }
            Self::Core(e) => e.category(),
            Self::InvalidState(_) => ErrorCategory::Other,
        }
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Decode { .. } => "DECODE_ERROR",
            Self::PostProcess { .. } => "POST_PROCESS_ERROR",
            Self::DirectoryUnavailable(_) => "DIRECTORY_UNAVAILABLE",
            Self::Io(_) => "IO_ERROR",
            Self::Core(e) => e.error_code(),
            Self::InvalidState(_) => "INVALID_STATE",
        }
    }

    /// True for errors that stop the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::DirectoryUnavailable(_) | Self::Core(CoreError::QueueClosed)
        )
    }
}

/// Result type for spooler operations
pub type Result<T> = std::result::Result<T, SpoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = SpoolError::Decode {
            file: "data.csv".into(),
            offset: 24,
            message: "Data has more columns than header".into(),
        };
        assert_eq!(
            err.to_string(),
            "Decode error in data.csv at offset 24: Data has more columns than header"
        );
        assert_eq!(err.error_code(), "DECODE_ERROR");
        assert_eq!(err.category(), ErrorCategory::Decode);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SpoolError::config("bad regex").is_fatal());
        assert!(SpoolError::DirectoryUnavailable("/in".into()).is_fatal());
        assert!(!SpoolError::post_process("a.txt", "permission denied").is_fatal());
        assert!(SpoolError::post_process("a.txt", "disk full").is_retriable());
    }

    #[test]
    fn test_core_errors_pass_through() {
        let err: SpoolError = CoreError::QueueClosed.into();
        assert_eq!(err.error_code(), "QUEUE_CLOSED");
        assert!(err.is_fatal());
    }
}
