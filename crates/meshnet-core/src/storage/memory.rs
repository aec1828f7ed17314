use std::sync::Arc;

use parking_lot::Mutex;

use super::{NetSnapshot, Storage, StorageError, decode_snapshot, encode_snapshot};

/// In-memory storage for tests and simulation.
///
/// Holds the CBOR encoding rather than the snapshot itself, so a load goes
/// through the same serialization path as a durable backend. Clones share
/// the same slot.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the stored encoding, if any.
    pub fn stored_len(&self) -> Option<usize> {
        self.inner.lock().as_ref().map(Vec::len)
    }
}

impl Storage for MemoryStorage {
    fn save_snapshot(&self, snapshot: &NetSnapshot) -> Result<(), StorageError> {
        let bytes = encode_snapshot(snapshot)?;
        *self.inner.lock() = Some(bytes);
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<NetSnapshot>, StorageError> {
        self.inner.lock().as_deref().map(decode_snapshot).transpose()
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.inner.lock() = None;
        Ok(())
    }
}
