//! Read-only access to the replica and change notification.
//!
//! Consumers read catalog data through [`SnapshotReader`] and never talk to
//! the remote backend. After a sync pass changes something, every
//! [`ChangeNotifier`] subscriber is called once and re-reads what it needs.

use crate::state::{SyncState, SyncStatus};
use crate::SyncResult;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tillsync_storage::{CheckpointManager, OutboxStore, ReplicaStore};
use tillsync_types::{EntityRecord, EntityType, RecordId};
use tokio::sync::RwLock;
use tracing::warn;

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct NotifierInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Callback>>,
}

/// Publish/subscribe hook fired after a sync pass that applied changes.
///
/// Cloning is cheap; clones share subscribers.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. It stays registered until the returned
    /// subscription is unsubscribed or dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.insert(id, Arc::new(callback));
        }
        Subscription {
            id,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Calls every subscriber once.
    pub fn notify(&self) {
        // Snapshot the callbacks so one may unsubscribe from inside the call.
        let callbacks: Vec<Callback> = match self.inner.subscribers.lock() {
            Ok(subscribers) => subscribers.values().cloned().collect(),
            Err(_) => {
                warn!("change notifier poisoned; dropping notification");
                return;
            }
        };
        for callback in callbacks {
            callback();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Registration returned by [`ChangeNotifier::subscribe`].
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    notifier: Weak<NotifierInner>,
}

impl Subscription {
    /// Removes the callback.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.notifier.upgrade() {
            if let Ok(mut subscribers) = inner.subscribers.lock() {
                subscribers.remove(&self.id);
            }
        }
    }
}

/// Non-blocking reads over the local replica.
#[derive(Clone)]
pub struct SnapshotReader {
    store: ReplicaStore,
    checkpoints: CheckpointManager,
    outbox: OutboxStore,
    state: Arc<RwLock<SyncState>>,
}

impl SnapshotReader {
    pub(crate) fn new(store: ReplicaStore, state: Arc<RwLock<SyncState>>) -> Self {
        Self {
            checkpoints: CheckpointManager::new(store.clone()),
            outbox: OutboxStore::new(store.clone()),
            store,
            state,
        }
    }

    /// Current contents of one partition, whatever the sync or network state.
    /// A store failure is logged and reads as an empty snapshot.
    pub fn get_snapshot(&self, entity_type: EntityType) -> Vec<EntityRecord> {
        match self.store.get_all(entity_type) {
            Ok(records) => records,
            Err(e) => {
                warn!(%entity_type, error = %e, "snapshot read failed");
                Vec::new()
            }
        }
    }

    /// One replicated record, if present.
    pub fn get_record(&self, entity_type: EntityType, id: &RecordId) -> Option<EntityRecord> {
        match self.store.get_one(entity_type, id) {
            Ok(record) => record,
            Err(e) => {
                warn!(%entity_type, id = %id, error = %e, "record read failed");
                None
            }
        }
    }

    /// Diagnostic view composed from the checkpoints, the record counts, the
    /// outbox counts, and in-memory per-type errors.
    pub async fn sync_status(&self) -> SyncResult<SyncStatus> {
        let (syncing, per_entity_error) = {
            let state = self.state.read().await;
            (state.is_syncing(), state.errors())
        };

        let mut record_counts = BTreeMap::new();
        for entity_type in EntityType::ALL {
            record_counts.insert(entity_type, self.store.count(entity_type)?);
        }
        let outbox = self.outbox.counts()?;

        Ok(SyncStatus {
            syncing,
            last_sync: self.checkpoints.get_last_sync_at()?,
            last_full_sync: self.checkpoints.get_last_full_sync_at()?,
            per_entity_error,
            record_counts,
            pending_mutations: outbox.pending + outbox.syncing,
            failed_mutations: outbox.failed,
        })
    }
}
