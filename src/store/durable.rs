//! ACID-durable snapshot store backed by redb.
//!
//! Snapshots are bincode-encoded and keyed by version number, so the latest
//! snapshot is simply the last key in the table.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, TableError};

use crate::error::StoreError;

use super::StoreResult;
use super::snapshot::GraphSnapshot;

/// Version -> bincode-encoded [`GraphSnapshot`].
const SNAPSHOT_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("snapshots");

const DB_FILE: &str = "kgrl.redb";

fn redb_err(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Redb {
        message: format!("{context}: {e}"),
    }
}

/// Durable store of graph snapshots.
pub struct SnapshotStore {
    db: Arc<Database>,
}

impl SnapshotStore {
    /// Open or create the store in `data_dir`.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join(DB_FILE);
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Store a snapshot under its version, replacing any previous one.
    pub fn put(&self, snapshot: &GraphSnapshot) -> StoreResult<()> {
        let bytes = bincode::serialize(snapshot).map_err(|e| StoreError::Serialization {
            message: format!("snapshot v{}: {e}", snapshot.version),
        })?;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| redb_err("begin_write failed", e))?;
        {
            let mut table = txn
                .open_table(SNAPSHOT_TABLE)
                .map_err(|e| redb_err("open_table failed", e))?;
            table
                .insert(snapshot.version, bytes.as_slice())
                .map_err(|e| redb_err("insert failed", e))?;
        }
        txn.commit()
            .map_err(|e| redb_err("commit failed", e))?;
        tracing::info!(
            version = snapshot.version,
            bytes = bytes.len(),
            "snapshot stored durably"
        );
        Ok(())
    }

    fn decode(version: u64, bytes: &[u8]) -> StoreResult<GraphSnapshot> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
            message: format!("snapshot v{version}: {e}"),
        })
    }

    /// Fetch one version.
    pub fn get(&self, version: u64) -> StoreResult<GraphSnapshot> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| redb_err("begin_read failed", e))?;
        let table = match txn.open_table(SNAPSHOT_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(StoreError::SnapshotNotFound { version });
            }
            Err(e) => return Err(redb_err("open_table failed", e)),
        };
        let guard = table
            .get(version)
            .map_err(|e| redb_err("get failed", e))?
            .ok_or(StoreError::SnapshotNotFound { version })?;
        Self::decode(version, guard.value())
    }

    /// The highest stored version, if any.
    pub fn latest(&self) -> StoreResult<Option<GraphSnapshot>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| redb_err("begin_read failed", e))?;
        let table = match txn.open_table(SNAPSHOT_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(redb_err("open_table failed", e)),
        };
        let Some((key, value)) = table
            .last()
            .map_err(|e| redb_err("last failed", e))?
        else {
            return Ok(None);
        };
        Self::decode(key.value(), value.value()).map(Some)
    }

    /// Stored versions, ascending.
    pub fn versions(&self) -> StoreResult<Vec<u64>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| redb_err("begin_read failed", e))?;
        let table = match txn.open_table(SNAPSHOT_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(redb_err("open_table failed", e)),
        };
        let mut versions = Vec::new();
        for entry in table.iter().map_err(|e| redb_err("iter failed", e))? {
            let (key, _) = entry.map_err(|e| redb_err("iter failed", e))?;
            versions.push(key.value());
        }
        Ok(versions)
    }

    /// Delete one version. Returns whether it existed.
    pub fn remove(&self, version: u64) -> StoreResult<bool> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| redb_err("begin_write failed", e))?;
        let existed = {
            let mut table = txn
                .open_table(SNAPSHOT_TABLE)
                .map_err(|e| redb_err("open_table failed", e))?;
            let removed = table
                .remove(version)
                .map_err(|e| redb_err("remove failed", e))?;
            removed.is_some()
        };
        txn.commit()
            .map_err(|e| redb_err("commit failed", e))?;
        Ok(existed)
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::GraphStore;
    use crate::graph::{EdgeSpec, NodeSpec, Relation};
    use tempfile::TempDir;

    fn snapshot(version: u64) -> GraphSnapshot {
        let store = GraphStore::new();
        store.upsert_node(NodeSpec::state("door_locked", "door")).unwrap();
        store.upsert_node(NodeSpec::state("door_open", "door")).unwrap();
        store
            .upsert_edge(
                EdgeSpec::new("door_locked", Relation::Transitions, "door_open")
                    .with_confidence(0.7),
            )
            .unwrap();
        store.snapshot(version)
    }

    #[test]
    fn put_get_latest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.latest().unwrap().is_none());
        assert!(store.versions().unwrap().is_empty());

        store.put(&snapshot(1)).unwrap();
        store.put(&snapshot(2)).unwrap();
        assert_eq!(store.get(1).unwrap().version, 1);
        assert_eq!(store.latest().unwrap().unwrap().version, 2);
        assert_eq!(store.versions().unwrap(), vec![1, 2]);
    }

    #[test]
    fn missing_version() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get(9),
            Err(StoreError::SnapshotNotFound { version: 9 })
        ));
        store.put(&snapshot(1)).unwrap();
        assert!(store.remove(1).unwrap());
        assert!(!store.remove(1).unwrap());
        assert!(store.get(1).is_err());
    }

    #[test]
    fn persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        let original = snapshot(4);
        {
            let store = SnapshotStore::open(dir.path()).unwrap();
            store.put(&original).unwrap();
        }
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.get(4).unwrap(), original);
    }
}
