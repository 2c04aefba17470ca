//! Sync state tracking.
//!
//! Per-type progress lives here in process memory; anything that must
//! survive a restart (cursors, sync timestamps) is in the checkpoint manager.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tillsync_types::{EntityType, Timestamp};

/// How an entity type was (or is being) synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Clear the partition, then repopulate from the beginning.
    Full,
    /// Fetch only what changed after the cursor.
    Incremental,
}

/// Tracks sync state for all entity types.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    entities: HashMap<EntityType, EntitySyncState>,
    pass_running: bool,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets sync state for an entity type.
    pub fn get_entity(&self, entity_type: EntityType) -> Option<&EntitySyncState> {
        self.entities.get(&entity_type)
    }

    /// Gets mutable sync state for an entity type, creating if needed.
    pub fn get_or_create_entity(&mut self, entity_type: EntityType) -> &mut EntitySyncState {
        self.entities.entry(entity_type).or_default()
    }

    /// Whether a pass or any single type is currently syncing.
    pub fn is_syncing(&self) -> bool {
        self.pass_running || self.entities.values().any(|e| e.syncing)
    }

    pub fn set_pass_running(&mut self, running: bool) {
        self.pass_running = running;
    }

    /// The last error of every type whose most recent attempt failed.
    pub fn errors(&self) -> BTreeMap<EntityType, String> {
        self.entities
            .iter()
            .filter_map(|(ty, state)| state.last_error.clone().map(|e| (*ty, e)))
            .collect()
    }
}

/// Sync state for a single entity type.
#[derive(Debug, Clone, Default)]
pub struct EntitySyncState {
    /// A sync of this type is in progress.
    pub syncing: bool,
    /// Error of the most recent attempt; cleared by the next success.
    pub last_error: Option<String>,
    /// When this type last finished a sync without error.
    pub last_synced_at: Option<Timestamp>,
    /// Mode of the most recent attempt.
    pub last_mode: Option<SyncMode>,
}

impl EntitySyncState {
    /// Marks the start of an attempt.
    pub fn begin(&mut self, mode: SyncMode) {
        self.syncing = true;
        self.last_mode = Some(mode);
    }

    /// Marks the end of an attempt.
    pub fn finish(&mut self, error: Option<String>, at: Timestamp) {
        self.syncing = false;
        if error.is_none() {
            self.last_synced_at = Some(at);
        }
        self.last_error = error;
    }
}

/// Read-only diagnostic view of the sync subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// A sync pass is running.
    pub syncing: bool,
    /// When the last sync pass finished.
    pub last_sync: Option<Timestamp>,
    /// When the last full sync pass finished.
    pub last_full_sync: Option<Timestamp>,
    /// Last error per entity type, for types whose latest attempt failed.
    pub per_entity_error: BTreeMap<EntityType, String>,
    /// Replicated records per entity type.
    pub record_counts: BTreeMap<EntityType, usize>,
    /// Mutations waiting for delivery.
    pub pending_mutations: usize,
    /// Mutations whose last delivery attempt failed.
    pub failed_mutations: usize,
}
