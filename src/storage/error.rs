//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected (bad magic, bad version, gap in chunk chain, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// A frame's stored CRC32 does not match its payload
    #[error("Checksum mismatch: stored={stored}, computed={computed}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// A frame ended before its declared length (incomplete write)
    #[error("Truncated frame: {0}")]
    Truncated(String),

    /// Invalid input (bad query options, mismatched vector dimensions, etc.)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Write attempted against a read-only chunk or a Cold block
    #[error("Not writable: {0}")]
    NotWritable(String),

    /// Embedding capability failed for every record in a call
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Index archive serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::NotWritable("chunk 3 is sealed".to_string());
        assert_eq!(err.to_string(), "Not writable: chunk 3 is sealed");

        let err = StorageError::ChecksumMismatch {
            stored: 1,
            computed: 2,
        };
        assert_eq!(err.to_string(), "Checksum mismatch: stored=1, computed=2");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }
}
