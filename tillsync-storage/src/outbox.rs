//! Durable storage for queued mutations.
//!
//! Rows are only ever transitioned, never deleted, except for an explicit
//! prune of `SUCCEEDED` rows.

use crate::error::{StorageError, StorageResult};
use crate::replica::ReplicaStore;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tillsync_types::{IdempotencyKey, MutationKind, MutationStatus, QueuedMutation, Timestamp};
use tracing::{debug, info};

const COLUMNS: &str = "local_id, kind, payload_json, status, created_at, updated_at,
                       attempt_count, last_error, idempotency_key";

/// Number of outbox rows in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
    pub succeeded: usize,
}

/// Outbox table accessor over the replica's connection.
#[derive(Clone)]
pub struct OutboxStore {
    store: ReplicaStore,
}

impl OutboxStore {
    pub fn new(store: ReplicaStore) -> Self {
        Self { store }
    }

    /// Persists a new `PENDING` mutation and returns its local id.
    pub fn insert(
        &self,
        kind: MutationKind,
        payload: &serde_json::Value,
        created_at: Timestamp,
        idempotency_key: IdempotencyKey,
    ) -> StorageResult<i64> {
        let conn = self.store.lock()?;
        conn.execute(
            "INSERT INTO outbox (kind, payload_json, status, created_at, updated_at,
                                 attempt_count, last_error, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?4, 0, NULL, ?5)",
            params![
                kind.as_str(),
                serde_json::to_string(payload)?,
                MutationStatus::Pending.as_str(),
                created_at.as_millis() as i64,
                idempotency_key.to_string(),
            ],
        )?;
        let local_id = conn.last_insert_rowid();
        debug!(local_id, %kind, "persisted mutation");
        Ok(local_id)
    }

    pub fn get(&self, local_id: i64) -> StorageResult<Option<QueuedMutation>> {
        let conn = self.store.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM outbox WHERE local_id = ?1"),
                params![local_id],
                read_row,
            )
            .optional()?;
        row.map(decode_row).transpose()
    }

    /// Lists mutations in FIFO order, optionally filtered by status.
    pub fn list(&self, status: Option<MutationStatus>) -> StorageResult<Vec<QueuedMutation>> {
        let conn = self.store.lock()?;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {COLUMNS} FROM outbox WHERE status = ?1 ORDER BY created_at, local_id"
                ))?;
                let rows = stmt
                    .query_map(params![status.as_str()], read_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {COLUMNS} FROM outbox ORDER BY created_at, local_id"
                ))?;
                let rows = stmt.query_map([], read_row)?.collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        rows.into_iter().map(decode_row).collect()
    }

    /// Moves a `PENDING` row to `SYNCING`. Returns `false` if the row was not
    /// pending (already claimed, or transitioned elsewhere).
    pub fn mark_syncing(&self, local_id: i64, at: Timestamp) -> StorageResult<bool> {
        self.transition(local_id, MutationStatus::Pending, MutationStatus::Syncing, at)
    }

    /// Moves a `SYNCING` row to `SUCCEEDED`.
    pub fn mark_succeeded(&self, local_id: i64, at: Timestamp) -> StorageResult<bool> {
        self.transition(local_id, MutationStatus::Syncing, MutationStatus::Succeeded, at)
    }

    /// Moves a `SYNCING` row to `FAILED`, recording the error and counting the
    /// attempt.
    pub fn mark_failed(&self, local_id: i64, error: &str, at: Timestamp) -> StorageResult<bool> {
        let conn = self.store.lock()?;
        let changed = conn.execute(
            "UPDATE outbox
             SET status = ?2, last_error = ?3, attempt_count = attempt_count + 1, updated_at = ?4
             WHERE local_id = ?1 AND status = ?5",
            params![
                local_id,
                MutationStatus::Failed.as_str(),
                error,
                at.as_millis() as i64,
                MutationStatus::Syncing.as_str(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Returns a `SYNCING` row to `PENDING` after a delivery attempt that may
    /// succeed later, recording the error and counting the attempt.
    pub fn mark_deferred(&self, local_id: i64, error: &str, at: Timestamp) -> StorageResult<bool> {
        let conn = self.store.lock()?;
        let changed = conn.execute(
            "UPDATE outbox
             SET status = ?2, last_error = ?3, attempt_count = attempt_count + 1, updated_at = ?4
             WHERE local_id = ?1 AND status = ?5",
            params![
                local_id,
                MutationStatus::Pending.as_str(),
                error,
                at.as_millis() as i64,
                MutationStatus::Syncing.as_str(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Moves every `FAILED` row back to `PENDING`. Returns the number moved.
    pub fn reset_failed(&self, at: Timestamp) -> StorageResult<usize> {
        self.transition_all(MutationStatus::Failed, MutationStatus::Pending, at)
    }

    /// Returns rows left `SYNCING` by an interrupted process to `PENDING`.
    /// Their delivery outcome is unknown; the idempotency key lets the backend
    /// recognise a duplicate.
    pub fn recover_in_flight(&self, at: Timestamp) -> StorageResult<usize> {
        let recovered = self.transition_all(MutationStatus::Syncing, MutationStatus::Pending, at)?;
        if recovered > 0 {
            info!(recovered, "recovered interrupted outbox deliveries");
        }
        Ok(recovered)
    }

    /// Deletes `SUCCEEDED` rows last updated before `before`. Rows in any other
    /// status are never pruned.
    pub fn prune_succeeded(&self, before: Timestamp) -> StorageResult<usize> {
        let conn = self.store.lock()?;
        let removed = conn.execute(
            "DELETE FROM outbox WHERE status = ?1 AND updated_at < ?2",
            params![MutationStatus::Succeeded.as_str(), before.as_millis() as i64],
        )?;
        if removed > 0 {
            debug!(removed, "pruned delivered mutations");
        }
        Ok(removed)
    }

    pub fn counts(&self) -> StorageResult<OutboxCounts> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare_cached("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = OutboxCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = count as usize;
            match status.parse::<MutationStatus>()? {
                MutationStatus::Pending => counts.pending = count,
                MutationStatus::Syncing => counts.syncing = count,
                MutationStatus::Failed => counts.failed = count,
                MutationStatus::Succeeded => counts.succeeded = count,
            }
        }
        Ok(counts)
    }

    fn transition(
        &self,
        local_id: i64,
        from: MutationStatus,
        to: MutationStatus,
        at: Timestamp,
    ) -> StorageResult<bool> {
        let conn = self.store.lock()?;
        let changed = conn.execute(
            "UPDATE outbox SET status = ?2, updated_at = ?3 WHERE local_id = ?1 AND status = ?4",
            params![local_id, to.as_str(), at.as_millis() as i64, from.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn transition_all(&self, from: MutationStatus, to: MutationStatus, at: Timestamp) -> StorageResult<usize> {
        let conn = self.store.lock()?;
        let changed = conn.execute(
            "UPDATE outbox SET status = ?1, updated_at = ?2 WHERE status = ?3",
            params![to.as_str(), at.as_millis() as i64, from.as_str()],
        )?;
        Ok(changed)
    }
}

type RawRow = (i64, String, String, String, i64, i64, i64, Option<String>, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn decode_row(raw: RawRow) -> StorageResult<QueuedMutation> {
    let (local_id, kind, payload, status, created_at, updated_at, attempts, last_error, key) = raw;
    let idempotency_key = key
        .parse::<IdempotencyKey>()
        .map_err(|e| StorageError::InvalidData(format!("idempotency key of mutation {local_id}: {e}")))?;
    Ok(QueuedMutation {
        local_id,
        kind: kind.parse()?,
        payload: serde_json::from_str(&payload)?,
        status: status.parse()?,
        created_at: Timestamp::from_millis(created_at.max(0) as u64),
        updated_at: Timestamp::from_millis(updated_at.max(0) as u64),
        attempt_count: attempts.max(0) as u32,
        last_error,
        idempotency_key,
    })
}
