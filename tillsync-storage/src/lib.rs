//! SQLite storage layer for tillsync.
//!
//! One database file holds the whole local replica:
//!
//! - `records`: one partition per entity type, keyed by `(entity_type, id)`
//! - `sync_meta`: the metadata partition (cursors, sync timestamps)
//! - `outbox`: locally originated mutations awaiting delivery
//!
//! [`ReplicaStore`] owns the connection. [`CheckpointManager`] and
//! [`OutboxStore`] are thin views over the same connection, so everything the
//! sync engine persists shares one durability domain.

mod checkpoint;
mod error;
mod outbox;
mod replica;

pub use checkpoint::CheckpointManager;
pub use error::{StorageError, StorageResult};
pub use outbox::{OutboxCounts, OutboxStore};
pub use replica::ReplicaStore;

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        entity_type TEXT NOT NULL,
        id TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        payload_json TEXT NOT NULL,
        PRIMARY KEY (entity_type, id)
    );

    CREATE INDEX IF NOT EXISTS idx_records_updated_at
        ON records (entity_type, updated_at);

    CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS outbox (
        local_id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        idempotency_key TEXT NOT NULL UNIQUE
    );

    CREATE INDEX IF NOT EXISTS idx_outbox_status
        ON outbox (status, created_at, local_id);
";

/// Opens a SQLite database file and applies the replica schema.
///
/// WAL journaling with `synchronous = FULL` so a write that returned is on
/// disk before the caller checkpoints or acknowledges an enqueue.
pub(crate) fn open_connection(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Opens an in-memory database with the replica schema (for testing).
pub(crate) fn open_memory_connection() -> StorageResult<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}
