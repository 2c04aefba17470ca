//! Mutation outbox: durable FIFO delivery of locally-originated writes.
//!
//! A mutation is persisted `PENDING` before [`MutationOutbox::enqueue`]
//! returns, so callers may treat the local effect as committed even while
//! offline. Delivery walks the queue in creation order:
//!
//! ```text
//! PENDING ──▶ SYNCING ──▶ SUCCEEDED
//!    ▲  ▲         │
//!    │  └─offline─┤
//!    │            ▼ rejected
//!    └──retry── FAILED
//! ```
//!
//! Nothing is deleted on failure. Ordering is per device only; conflicting
//! writes from other devices are settled by the backend, last writer wins.

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteBackend;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tillsync_storage::{OutboxCounts, OutboxStore, ReplicaStore};
use tillsync_types::{IdempotencyKey, MutationKind, MutationStatus, QueuedMutation, Timestamp};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What one `process_queue` run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxReport {
    /// Items moved back from `FAILED` to `PENDING` before processing.
    pub retried: usize,
    /// Items submitted.
    pub attempted: usize,
    pub succeeded: usize,
    /// Items the remote rejected, now `FAILED`.
    pub failed: usize,
    /// Items left `PENDING` because the remote was unreachable, including the
    /// one whose attempt failed.
    pub deferred: usize,
}

impl OutboxReport {
    /// Whether processing stopped early on a transient failure.
    pub fn interrupted(&self) -> bool {
        self.deferred > 0
    }
}

/// The outbox service over the durable queue.
pub struct MutationOutbox {
    store: OutboxStore,
    remote: Arc<dyn RemoteBackend>,
    processing: Mutex<()>,
}

impl MutationOutbox {
    /// Opens the outbox on a replica database. Items a previous process left
    /// `SYNCING` are returned to `PENDING`; their idempotency keys let the
    /// backend drop a duplicate delivery.
    pub fn new(store: ReplicaStore, remote: Arc<dyn RemoteBackend>) -> SyncResult<Self> {
        let store = OutboxStore::new(store);
        store.recover_in_flight(Timestamp::now())?;
        Ok(Self {
            store,
            remote,
            processing: Mutex::new(()),
        })
    }

    /// Validates and durably queues a mutation. Returns its local id.
    pub fn enqueue(&self, kind: MutationKind, payload: Value) -> SyncResult<i64> {
        validate(kind, &payload)?;
        let local_id =
            self.store
                .insert(kind, &payload, Timestamp::now(), IdempotencyKey::new())?;
        info!(local_id, %kind, "queued mutation");
        Ok(local_id)
    }

    /// Delivers `PENDING` items in FIFO order.
    ///
    /// A rejection marks the item `FAILED` and moves on. A network failure or
    /// timeout counts the attempt, records the error, returns the item to
    /// `PENDING` and stops, so the queue resumes in order on the next run.
    /// Concurrent calls run one after another.
    pub async fn process_queue(&self) -> SyncResult<OutboxReport> {
        let _guard = self.processing.lock().await;
        self.drain(OutboxReport::default()).await
    }

    /// Moves every `FAILED` item back to `PENDING`, then processes the queue.
    pub async fn retry_failed(&self) -> SyncResult<OutboxReport> {
        let _guard = self.processing.lock().await;
        let retried = self.store.reset_failed(Timestamp::now())?;
        if retried > 0 {
            info!(retried, "retrying failed mutations");
        }
        self.drain(OutboxReport {
            retried,
            ..OutboxReport::default()
        })
        .await
    }

    pub fn list(&self, status: Option<MutationStatus>) -> SyncResult<Vec<QueuedMutation>> {
        Ok(self.store.list(status)?)
    }

    pub fn get(&self, local_id: i64) -> SyncResult<Option<QueuedMutation>> {
        Ok(self.store.get(local_id)?)
    }

    pub fn counts(&self) -> SyncResult<OutboxCounts> {
        Ok(self.store.counts()?)
    }

    /// Deletes `SUCCEEDED` items older than `retention`. Other statuses are
    /// kept regardless of age.
    pub fn prune_succeeded(&self, retention: Duration) -> SyncResult<usize> {
        let cutoff = Timestamp::now().saturating_sub(retention);
        Ok(self.store.prune_succeeded(cutoff)?)
    }

    async fn drain(&self, mut report: OutboxReport) -> SyncResult<OutboxReport> {
        let pending = self.store.list(Some(MutationStatus::Pending))?;
        if pending.is_empty() {
            return Ok(report);
        }
        debug!(pending = pending.len(), "processing outbox");

        let mut items = pending.into_iter();
        while let Some(mut mutation) = items.next() {
            if !self.store.mark_syncing(mutation.local_id, Timestamp::now())? {
                continue;
            }
            mutation.status = MutationStatus::Syncing;
            report.attempted += 1;

            match self.remote.submit_mutation(&mutation).await {
                Ok(()) => {
                    self.store.mark_succeeded(mutation.local_id, Timestamp::now())?;
                    report.succeeded += 1;
                    debug!(local_id = mutation.local_id, kind = %mutation.kind, "mutation delivered");
                }
                Err(e) if e.is_transient() => {
                    self.store
                        .mark_deferred(mutation.local_id, &e.to_string(), Timestamp::now())?;
                    report.deferred = 1 + items.len();
                    warn!(
                        local_id = mutation.local_id,
                        error = %e,
                        deferred = report.deferred,
                        "remote unreachable; stopping outbox run"
                    );
                    break;
                }
                Err(e) => {
                    self.store
                        .mark_failed(mutation.local_id, &e.to_string(), Timestamp::now())?;
                    report.failed += 1;
                    warn!(local_id = mutation.local_id, kind = %mutation.kind, error = %e, "mutation rejected");
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "outbox run finished"
        );
        Ok(report)
    }
}

/// Checks a payload before it is queued. Failures never reach the queue.
fn validate(kind: MutationKind, payload: &Value) -> SyncResult<()> {
    let Value::Object(fields) = payload else {
        return Err(SyncError::Validation(format!("{kind} payload must be a JSON object")));
    };

    let require = |field: &str, ok: fn(&Value) -> bool, expected: &str| -> SyncResult<()> {
        match fields.get(field) {
            Some(value) if ok(value) => Ok(()),
            Some(_) => Err(SyncError::Validation(format!("{kind}: `{field}` must be {expected}"))),
            None => Err(SyncError::Validation(format!("{kind}: missing `{field}`"))),
        }
    };
    let non_empty_string = |v: &Value| v.as_str().is_some_and(|s| !s.is_empty());
    let id_like = |v: &Value| v.as_str().is_some_and(|s| !s.is_empty()) || v.is_i64() || v.is_u64();

    match kind {
        MutationKind::AdjustStock => {
            require("product_id", non_empty_string, "a non-empty string")?;
            require("delta", |v| v.is_i64() || v.is_u64(), "an integer")
        }
        MutationKind::RecordPayment => {
            require("order_id", id_like, "an id")?;
            require("amount", Value::is_number, "a number")
        }
        MutationKind::UpdateOrder | MutationKind::DeleteCatalogItem => {
            require("id", id_like, "an id")
        }
        MutationKind::CreateOrder | MutationKind::UpsertCatalogItem => Ok(()),
    }
}
