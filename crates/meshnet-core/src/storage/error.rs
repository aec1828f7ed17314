//! Storage error types.
//!
//! - `Serialization`: a snapshot could not be encoded or decoded
//! - `Io`: the backing store failed

use thiserror::Error;

use crate::error::NetError;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<StorageError> for NetError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}
