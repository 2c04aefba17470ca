//! Sync cursors and sync timestamps, kept in the metadata partition.

use crate::error::{StorageError, StorageResult};
use crate::replica::ReplicaStore;
use rusqlite::{params, OptionalExtension};
use tillsync_types::{EntityType, Timestamp};
use tracing::debug;

const LAST_FULL_SYNC_KEY: &str = "last_full_sync_at";
const LAST_SYNC_KEY: &str = "last_sync_at";

fn cursor_key(entity_type: EntityType) -> String {
    format!("cursor:{}", entity_type.as_str())
}

/// Reads and writes sync bookkeeping in the replica's `sync_meta` table.
///
/// Shares the replica's connection, so a checkpoint is exactly as durable as
/// the records it describes.
#[derive(Clone)]
pub struct CheckpointManager {
    store: ReplicaStore,
}

impl CheckpointManager {
    /// Creates a checkpoint manager over the given replica.
    pub fn new(store: ReplicaStore) -> Self {
        Self { store }
    }

    /// The highest `updated_at` applied for an entity type, if it was ever
    /// synced.
    pub fn get_cursor(&self, entity_type: EntityType) -> StorageResult<Option<Timestamp>> {
        self.get_timestamp(&cursor_key(entity_type))
    }

    /// Advances the cursor for an entity type.
    ///
    /// Cursors only move forward: a value below the stored cursor is ignored
    /// and `false` is returned.
    pub fn set_cursor(&self, entity_type: EntityType, value: Timestamp) -> StorageResult<bool> {
        let conn = self.store.lock()?;
        let changed = conn.execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value
             WHERE CAST(excluded.value AS INTEGER) >= CAST(sync_meta.value AS INTEGER)",
            params![cursor_key(entity_type), value.as_millis().to_string()],
        )?;
        if changed == 0 {
            debug!(%entity_type, cursor = value.as_millis(), "ignored cursor regression");
        }
        Ok(changed > 0)
    }

    /// Forgets the cursor for an entity type; its next sync is a full sync.
    pub fn clear_cursor(&self, entity_type: EntityType) -> StorageResult<()> {
        let conn = self.store.lock()?;
        conn.execute("DELETE FROM sync_meta WHERE key = ?1", params![cursor_key(entity_type)])?;
        Ok(())
    }

    /// Forgets every cursor.
    pub fn clear_all_cursors(&self) -> StorageResult<()> {
        let conn = self.store.lock()?;
        conn.execute("DELETE FROM sync_meta WHERE key LIKE 'cursor:%'", [])?;
        Ok(())
    }

    pub fn get_last_full_sync_at(&self) -> StorageResult<Option<Timestamp>> {
        self.get_timestamp(LAST_FULL_SYNC_KEY)
    }

    pub fn set_last_full_sync_at(&self, value: Timestamp) -> StorageResult<()> {
        self.put_timestamp(LAST_FULL_SYNC_KEY, value)
    }

    /// When the last sync pass (of either kind) finished.
    pub fn get_last_sync_at(&self) -> StorageResult<Option<Timestamp>> {
        self.get_timestamp(LAST_SYNC_KEY)
    }

    pub fn set_last_sync_at(&self, value: Timestamp) -> StorageResult<()> {
        self.put_timestamp(LAST_SYNC_KEY, value)
    }

    fn get_timestamp(&self, key: &str) -> StorageResult<Option<Timestamp>> {
        let conn = self.store.lock()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM sync_meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;

        value
            .map(|v| {
                v.parse::<u64>()
                    .map(Timestamp::from_millis)
                    .map_err(|e| StorageError::InvalidData(format!("{key} = {v:?}: {e}")))
            })
            .transpose()
    }

    fn put_timestamp(&self, key: &str, value: Timestamp) -> StorageResult<()> {
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![key, value.as_millis().to_string()],
        )?;
        Ok(())
    }
}
