//! Error types for the CDC source

use sluice_core::{CoreError, ErrorCategory};
use thiserror::Error;

/// CDC errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// Invalid settings, detected at start
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A transaction exceeded its length or size bound and was force-resolved
    #[error("Transaction {txn_id} overflowed: {reason}")]
    TransactionOverflow { txn_id: String, reason: String },

    /// The log cannot be read from the required position; resuming is unsafe
    #[error("Fatal log access error: {0}")]
    FatalLogAccess(String),

    /// A log record could not be parsed
    #[error("Decode error at log position {position}: {message}")]
    Decode { position: u64, message: String },

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Batch hand-off or offset storage error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Operation on a source that is not running
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl CdcError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a fatal log access error
    pub fn log_access(msg: impl Into<String>) -> Self {
        Self::FatalLogAccess(msg.into())
    }

    /// Create an overflow error
    pub fn overflow(txn_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransactionOverflow {
            txn_id: txn_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a decode error
    pub fn decode(position: u64, msg: impl Into<String>) -> Self {
        Self::Decode {
            position,
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
            Self::Configuration(_)
            | Self::TransactionOverflow { .. }
            | Self::FatalLogAccess(_)
            | Self::Decode { .. }
            | Self::Json(_)
            | Self::InvalidState(_) => false,
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Decode { .. } => ErrorCategory::Decode,
            Self::FatalLogAccess(_) | Self::Io(_) => ErrorCategory::Io,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Core(e) => e.category(),
            Self::TransactionOverflow { .. } | Self::InvalidState(_) => ErrorCategory::Other,
        }
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::TransactionOverflow { .. } => "TRANSACTION_OVERFLOW",
            Self::FatalLogAccess(_) => "FATAL_LOG_ACCESS",
            Self::Decode { .. } => "DECODE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Core(e) => e.error_code(),
            Self::InvalidState(_) => "INVALID_STATE",
        }
    }

    /// True for errors that stop the engine.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Configuration(_) | Self::FatalLogAccess(_) | Self::Io(_) => true,
            Self::Core(CoreError::QueueClosed) => true,
            Self::Core(_)
            | Self::TransactionOverflow { .. }
            | Self::Decode { .. }
            | Self::Json(_)
            | Self::InvalidState(_) => false,
        }
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_is_not_fatal() {
        let err = CdcError::overflow("0x0a.001", "open for 3700s");
        assert_eq!(err.to_string(), "Transaction 0x0a.001 overflowed: open for 3700s");
        assert_eq!(err.error_code(), "TRANSACTION_OVERFLOW");
        assert!(!err.is_fatal());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_log_access_is_fatal() {
        let err = CdcError::log_access("segment 7 missing");
        assert!(err.is_fatal());
        assert_eq!(err.category(), ErrorCategory::Io);
    }

    #[test]
    fn test_core_errors_pass_through() {
        let err: CdcError = CoreError::QueueClosed.into();
        assert_eq!(err.error_code(), "QUEUE_CLOSED");
        assert!(err.is_fatal());
    }
}
