//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. A save
//! either replaces the whole snapshot or leaves the previous one in place.

use std::{path::Path, sync::Arc};

use meshnet_core::{
    NetSnapshot, Storage, StorageError,
    storage::{decode_snapshot, encode_snapshot},
};
use redb::{Database, TableDefinition};

/// Table: net_state
/// Key: record name
/// Value: CBOR-encoded NetSnapshot
const NET_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("net_state");

const SNAPSHOT_KEY: &str = "snapshot";

fn io(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(NET_STATE).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn save_snapshot(&self, snapshot: &NetSnapshot) -> Result<(), StorageError> {
        let bytes = encode_snapshot(snapshot)?;

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(NET_STATE).map_err(io)?;
            table.insert(SNAPSHOT_KEY, bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<NetSnapshot>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(NET_STATE).map_err(io)?;

        match table.get(SNAPSHOT_KEY).map_err(io)? {
            Some(value) => decode_snapshot(value.value()).map(Some),
            None => Ok(None),
        }
    }

    fn clear(&self) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(NET_STATE).map_err(io)?;
            table.remove(SNAPSHOT_KEY).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }
}
