//! Persistence of network-layer state.
//!
//! The trait is synchronous and stores one [`NetSnapshot`] at a time. Only
//! root keys are persisted; every derived key is recomputed on restore.
//! Snapshots are encoded as CBOR.

mod chaotic;
mod error;
mod memory;

use std::fmt;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
use meshnet_crypto::KEY_SIZE;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    friend::Friendship, key_refresh::KeyRefreshPhase, replay::ReplayEntry, subnet::NodeIdentity,
};

/// Persisted state of one subnet.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRecord {
    /// NetKey index
    pub net_idx: u16,
    /// Active NetKey
    pub net_key: [u8; KEY_SIZE],
    /// Candidate NetKey during Phase 1 and Phase 2
    pub candidate: Option<[u8; KEY_SIZE]>,
    /// Key Refresh phase
    pub phase: KeyRefreshPhase,
    /// Last observed Key Refresh flag
    pub kr_flag: bool,
    /// Node Identity state
    pub node_identity: NodeIdentity,
}

impl fmt::Debug for SubnetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubnetRecord")
            .field("net_idx", &self.net_idx)
            .field("candidate", &self.candidate.is_some())
            .field("phase", &self.phase)
            .field("kr_flag", &self.kr_flag)
            .finish_non_exhaustive()
    }
}

impl Drop for SubnetRecord {
    fn drop(&mut self) {
        self.net_key.zeroize();
        if let Some(candidate) = self.candidate.as_mut() {
            candidate.zeroize();
        }
    }
}

/// Persisted state of one application key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppKeyRecord {
    /// Owning NetKey index
    pub net_idx: u16,
    /// AppKey index
    pub app_idx: u16,
    /// Active key
    pub key: [u8; KEY_SIZE],
    /// Replacement written during a Key Refresh
    pub candidate: Option<[u8; KEY_SIZE]>,
}

impl fmt::Debug for AppKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppKeyRecord")
            .field("net_idx", &self.net_idx)
            .field("app_idx", &self.app_idx)
            .field("updated", &self.candidate.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for AppKeyRecord {
    fn drop(&mut self) {
        self.key.zeroize();
        if let Some(candidate) = self.candidate.as_mut() {
            candidate.zeroize();
        }
    }
}

/// Everything that must survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSnapshot {
    /// Stored IV Index
    pub iv_index: u32,
    /// IV Update in progress
    pub iv_update: bool,
    /// Next sequence number to use
    pub seq: u32,
    /// Subnet table
    pub subnets: Vec<SubnetRecord>,
    /// Application key table
    pub app_keys: Vec<AppKeyRecord>,
    /// Friendships whose credentials are derived on restore
    pub friendships: Vec<Friendship>,
    /// Replay ledger, least recently updated first
    pub replay: Vec<ReplayEntry>,
}

/// Storage abstraction for network-layer snapshots.
///
/// Must be Clone (shared between the node and its persistence task), Send +
/// Sync, and synchronous. Implementations share internal state, so clones
/// see the same snapshot.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Replace the stored snapshot.
    fn save_snapshot(&self, snapshot: &NetSnapshot) -> Result<(), StorageError>;

    /// Load the stored snapshot. `None` if nothing was saved.
    fn load_snapshot(&self) -> Result<Option<NetSnapshot>, StorageError>;

    /// Remove the stored snapshot (node reset).
    fn clear(&self) -> Result<(), StorageError>;
}

/// Encode a snapshot as CBOR.
pub fn encode_snapshot(snapshot: &NetSnapshot) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(snapshot, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decode a snapshot from CBOR.
pub fn decode_snapshot(bytes: &[u8]) -> Result<NetSnapshot, StorageError> {
    ciborium::de::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
