//! Error types for LarchDB.

use thiserror::Error;

/// Result type alias using LarchError.
pub type Result<T> = std::result::Result<T, LarchError>;

/// Errors that can occur in LarchDB operations.
#[derive(Debug, Error)]
pub enum LarchError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Tree errors
    #[error("key not found")]
    KeyNotFound,

    #[error("key is smaller than every pivot in the node")]
    PivotOutOfRange,

    // Swap space errors
    #[error("object not found: {id}")]
    ObjectNotFound { id: u64 },

    #[error("object {id} has no backing version to fault from")]
    ObjectNotResident { id: u64 },

    // Serialization errors
    #[error("format error: {0}")]
    Format(String),

    #[error("object corrupted: {id} version {version}, reason: {reason}")]
    ObjectCorrupted {
        id: u64,
        version: u64,
        reason: String,
    },

    // Log errors
    #[error("log corrupted at line {line}: {reason}")]
    LogCorrupted { line: usize, reason: String },

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    // Configuration errors
    #[error("invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: LarchError = io_err.into();
        assert!(matches!(err, LarchError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_object_not_found_display() {
        let err = LarchError::ObjectNotFound { id: 42 };
        assert_eq!(err.to_string(), "object not found: 42");
    }

    #[test]
    fn test_object_corrupted_display() {
        let err = LarchError::ObjectCorrupted {
            id: 7,
            version: 3,
            reason: "checksum mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "object corrupted: 7 version 3, reason: checksum mismatch"
        );
    }

    #[test]
    fn test_log_corrupted_display() {
        let err = LarchError::LogCorrupted {
            line: 12,
            reason: "truncated record".to_string(),
        };
        assert_eq!(err.to_string(), "log corrupted at line 12: truncated record");
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = LarchError::InvalidParameter {
            name: "epsilon".to_string(),
            value: "1.5".to_string(),
        };
        assert_eq!(err.to_string(), "invalid parameter: epsilon = 1.5");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(LarchError::KeyNotFound)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LarchError>();
    }
}
