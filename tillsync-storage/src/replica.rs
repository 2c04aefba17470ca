//! Partitioned record storage for the local catalog replica.

use crate::error::{StorageError, StorageResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tillsync_types::{EntityRecord, EntityType, RecordId, RecordPayload, Timestamp};
use tracing::debug;

/// Local replica of the remote catalog, one partition per entity type.
///
/// Cloning is cheap and every clone shares the same connection.
#[derive(Clone)]
pub struct ReplicaStore {
    conn: Arc<Mutex<Connection>>,
}

impl ReplicaStore {
    /// Opens or creates a replica at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_connection(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory replica (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = crate::open_memory_connection()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Inserts or replaces records by id. Applying the same record twice
    /// leaves the partition unchanged. Returns the number of rows written.
    ///
    /// The batch is written in one transaction, but callers must not rely on
    /// all-or-nothing semantics: every row write is independently idempotent.
    pub fn upsert_many(&self, entity_type: EntityType, records: &[EntityRecord]) -> StorageResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            if record.entity_type() != entity_type {
                return Err(StorageError::InvalidData(format!(
                    "record {} is a {}, not a {}",
                    record.id,
                    record.entity_type(),
                    entity_type
                )));
            }
            let updated_at = i64::try_from(record.updated_at.as_millis()).map_err(|_| {
                StorageError::InvalidData(format!(
                    "updated_at of {entity_type} {} out of range: {}",
                    record.id,
                    record.updated_at.as_millis()
                ))
            })?;
            let payload = serde_json::to_string(&record.payload.to_json()?)?;
            rows.push((record.id.as_str(), updated_at, payload));
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO records (entity_type, id, updated_at, payload_json)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (id, updated_at, payload) in &rows {
                stmt.execute(params![entity_type.as_str(), id, updated_at, payload])?;
            }
        }
        tx.commit()?;

        debug!(%entity_type, count = rows.len(), "upserted records");
        Ok(rows.len())
    }

    /// Removes every record of one entity type. Returns the number removed.
    pub fn clear(&self, entity_type: EntityType) -> StorageResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM records WHERE entity_type = ?1",
            params![entity_type.as_str()],
        )?;
        debug!(%entity_type, removed, "cleared partition");
        Ok(removed)
    }

    /// Returns every record of one entity type, ordered by `updated_at` then id.
    pub fn get_all(&self, entity_type: EntityType) -> StorageResult<Vec<EntityRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, updated_at, payload_json FROM records
             WHERE entity_type = ?1 ORDER BY updated_at, id",
        )?;
        let rows = stmt.query_map(params![entity_type.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, updated_at, payload) = row?;
            records.push(decode_record(entity_type, id, updated_at, &payload)?);
        }
        Ok(records)
    }

    /// Returns one record by id.
    pub fn get_one(&self, entity_type: EntityType, id: &RecordId) -> StorageResult<Option<EntityRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT updated_at, payload_json FROM records WHERE entity_type = ?1 AND id = ?2",
                params![entity_type.as_str(), id.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((updated_at, payload)) => Ok(Some(decode_record(
                entity_type,
                id.to_string(),
                updated_at,
                &payload,
            )?)),
            None => Ok(None),
        }
    }

    /// Number of records in one partition.
    pub fn count(&self, entity_type: EntityType) -> StorageResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE entity_type = ?1",
            params![entity_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Record counts for every entity type, including empty partitions.
    pub fn counts(&self) -> StorageResult<HashMap<EntityType, usize>> {
        let mut counts = HashMap::new();
        for entity_type in EntityType::ALL {
            counts.insert(entity_type, self.count(entity_type)?);
        }
        Ok(counts)
    }

    /// Applies an optimistic adjustment to a product's `current_stock` for
    /// local display. `updated_at` and `stock_synced_at` are left untouched, so
    /// the next sync of that product replaces the value with the backend's.
    ///
    /// Returns the adjusted stock, or `None` if the product is not replicated.
    pub fn adjust_stock(&self, product_id: &RecordId, delta: i64) -> StorageResult<Option<i64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let payload: Option<String> = tx
            .query_row(
                "SELECT payload_json FROM records WHERE entity_type = ?1 AND id = ?2",
                params![EntityType::Product.as_str(), product_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let mut payload = RecordPayload::from_json(EntityType::Product, serde_json::from_str(&payload)?)?;
        let RecordPayload::Product(product) = &mut payload else {
            return Err(StorageError::InvalidData(format!(
                "product {product_id} decoded as a different entity type"
            )));
        };
        product.current_stock = product.current_stock.saturating_add(delta);
        let adjusted = product.current_stock;

        tx.execute(
            "UPDATE records SET payload_json = ?3 WHERE entity_type = ?1 AND id = ?2",
            params![
                EntityType::Product.as_str(),
                product_id.as_str(),
                serde_json::to_string(&payload.to_json()?)?
            ],
        )?;
        tx.commit()?;

        debug!(product_id = %product_id, delta, adjusted, "applied optimistic stock adjustment");
        Ok(Some(adjusted))
    }
}

fn decode_record(
    entity_type: EntityType,
    id: String,
    updated_at: i64,
    payload: &str,
) -> StorageResult<EntityRecord> {
    let updated_at = u64::try_from(updated_at)
        .map_err(|_| StorageError::InvalidData(format!("negative updated_at for {entity_type} {id}")))?;
    let payload = RecordPayload::from_json(entity_type, serde_json::from_str(payload)?)?;
    Ok(EntityRecord::new(id, Timestamp::from_millis(updated_at), payload))
}
