//! Node error types.

use meshnet_core::{NetError, StorageError};
use thiserror::Error;

/// Errors surfaced by the node runtime.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Network-layer operation failed
    #[error("network layer: {0}")]
    Net(#[from] NetError),

    /// Storage backend failed
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// A NetKey argument could not be parsed
    #[error("invalid NetKey: {0}")]
    InvalidKey(String),

    /// File system error while preparing the data directory
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
