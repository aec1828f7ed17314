//! Mesh network-layer node.
//!
//! Production glue around [`meshnet_core`]'s action-based network layer:
//! system time and OS randomness through [`SystemEnv`], durable state in
//! [`RedbStorage`], and a [`Node`] that executes the returned actions.
//!
//! # Components
//!
//! - [`Node`]: runs a `MeshNet` against an environment and a storage backend
//! - [`RedbStorage`]: crash-safe snapshot storage
//! - [`SystemEnv`]: production environment (real time, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod node;
pub mod storage;
mod system_env;

pub use error::NodeError;
pub use node::{Delivered, Node, NodeConfig, Outbound, log_delivered};
pub use storage::RedbStorage;
pub use system_env::SystemEnv;

/// Parse a 128-bit key from 32 hex digits.
///
/// # Errors
///
/// - `InvalidKey` for bad hex or a wrong length
pub fn parse_key(hex_key: &str) -> Result<[u8; 16], NodeError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| NodeError::InvalidKey(e.to_string()))?;
    <[u8; 16]>::try_from(bytes.as_slice())
        .map_err(|_| NodeError::InvalidKey(format!("expected 16 bytes, got {}", bytes.len())))
}
