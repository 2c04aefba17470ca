//! Catalog sync engine.
//!
//! Pulls catalog pages from the remote backend into the local replica. Each
//! entity type is synced either in full (clear, then repopulate) or
//! incrementally (only rows changed after the cursor), one page at a time:
//! fetch, apply, checkpoint. The cursor is only written after the page it
//! describes has been applied, so stopping between pages always leaves a
//! resumable state.

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteBackend;
use crate::snapshot::{ChangeNotifier, SnapshotReader};
use crate::state::{SyncMode, SyncState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tillsync_storage::{CheckpointManager, ReplicaStore};
use tillsync_types::{EntityRecord, EntityType, RecordPayload, Timestamp};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default number of records per page.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A full sync of every type is due once the last one is this old (ms).
    pub full_sync_interval_ms: u64,
    /// Records requested per page.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_sync_interval_ms: 24 * 60 * 60 * 1000,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_millis(self.full_sync_interval_ms)
    }
}

/// Result of a request to run a sync pass.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// This call ran the pass.
    Completed(SyncReport),
    /// The engine was busy when this call arrived; it waited for the running
    /// work to finish instead of starting a pass of its own. The running work
    /// is usually another pass, but may be a single-type sync
    /// ([`SyncEngine::sync_entity`] and friends), in which case only that type
    /// was synced.
    Coalesced,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Coalesced => None,
        }
    }

    pub fn into_report(self) -> Option<SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Coalesced => None,
        }
    }

    pub fn is_coalesced(&self) -> bool {
        matches!(self, SyncOutcome::Coalesced)
    }
}

/// What one sync pass did.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    /// One entry per entity type, in sync order.
    pub entities: Vec<EntitySyncReport>,
}

impl SyncReport {
    /// Whether any type applied or removed records.
    pub fn changed(&self) -> bool {
        self.entities.iter().any(|e| e.changed)
    }

    /// Whether every type took the full branch.
    pub fn was_full(&self) -> bool {
        self.entities.iter().all(|e| e.mode == SyncMode::Full)
    }

    pub fn entity(&self, entity_type: EntityType) -> Option<&EntitySyncReport> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }

    /// Types whose sync failed in this pass.
    pub fn failed(&self) -> impl Iterator<Item = &EntitySyncReport> {
        self.entities.iter().filter(|e| e.error.is_some())
    }

    /// Whether at least one page was fetched successfully.
    pub fn remote_reachable(&self) -> bool {
        self.entities.iter().any(|e| e.pages > 0)
    }
}

/// What syncing one entity type did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySyncReport {
    pub entity_type: EntityType,
    pub mode: SyncMode,
    /// Pages fetched successfully.
    pub pages: usize,
    pub records_applied: usize,
    /// Cursor after the last checkpoint of this run.
    pub cursor: Option<Timestamp>,
    /// Records were applied, or a full sync cleared a non-empty partition.
    pub changed: bool,
    pub error: Option<String>,
}

impl EntitySyncReport {
    fn new(entity_type: EntityType, mode: SyncMode) -> Self {
        Self {
            entity_type,
            mode,
            pages: 0,
            records_applied: 0,
            cursor: None,
            changed: false,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// How to sync one type.
#[derive(Debug, Clone, Copy)]
enum Plan {
    /// Full if no cursor exists, incremental otherwise.
    Auto,
    Full,
    Incremental(Timestamp),
}

/// Syncs the catalog replica against the remote backend.
///
/// One engine is constructed per replica and shared by reference. All passes
/// and single-type syncs are serialized through one in-flight guard.
pub struct SyncEngine {
    config: SyncConfig,
    store: ReplicaStore,
    checkpoints: CheckpointManager,
    remote: Arc<dyn RemoteBackend>,
    notifier: ChangeNotifier,
    state: Arc<RwLock<SyncState>>,
    in_flight: Mutex<()>,
}

impl SyncEngine {
    /// Creates a new sync engine over a replica.
    pub fn new(store: ReplicaStore, remote: Arc<dyn RemoteBackend>, config: SyncConfig) -> Self {
        Self {
            config,
            checkpoints: CheckpointManager::new(store.clone()),
            store,
            remote,
            notifier: ChangeNotifier::new(),
            state: Arc::new(RwLock::new(SyncState::new())),
            in_flight: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Page size actually requested; never zero.
    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// A reader over the same replica and sync state.
    pub fn snapshot_reader(&self) -> SnapshotReader {
        SnapshotReader::new(self.store.clone(), self.state.clone())
    }

    /// Whether a full sync of every type is due: never done, or at least
    /// `full_sync_interval` ago.
    pub fn needs_full_sync(&self, now: Timestamp) -> SyncResult<bool> {
        Ok(match self.checkpoints.get_last_full_sync_at()? {
            None => true,
            Some(last) => last.elapsed_until(now) >= self.config.full_sync_interval(),
        })
    }

    // ── Passes ───────────────────────────────────────────────────

    /// Runs the periodic decision: a full sync of every type if one is due,
    /// otherwise an incremental sync of every type.
    pub async fn initialize(&self) -> SyncResult<SyncOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Ok(self.wait_for_running_pass().await);
        };

        let full = self.needs_full_sync(Timestamp::now())?;
        let mode = if full { SyncMode::Full } else { SyncMode::Incremental };
        info!(?mode, "starting sync pass");
        let report = self.run_pass(full).await?;
        Ok(SyncOutcome::Completed(report))
    }

    /// Syncs every type: full where no cursor exists, incremental elsewhere.
    pub async fn sync_all_entities(&self) -> SyncResult<SyncOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Ok(self.wait_for_running_pass().await);
        };
        let report = self.run_pass(false).await?;
        Ok(SyncOutcome::Completed(report))
    }

    /// Resyncs every type through the full branch. Each type's cursor and
    /// partition are cleared once the remote answers its first page.
    pub async fn force_full_sync(&self) -> SyncResult<SyncOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Ok(self.wait_for_running_pass().await);
        };
        info!("forcing full sync");
        let report = self.run_pass(true).await?;
        Ok(SyncOutcome::Completed(report))
    }

    // ── Single types ─────────────────────────────────────────────

    /// Syncs one type: full if it has no cursor, incremental otherwise.
    /// Waits for any running pass first.
    pub async fn sync_entity(&self, entity_type: EntityType) -> EntitySyncReport {
        self.sync_one(entity_type, Plan::Auto).await
    }

    /// Replaces one type's partition with the remote's current rows. The old
    /// rows and cursor stay if the first page cannot be fetched.
    pub async fn full_sync_entity(&self, entity_type: EntityType) -> EntitySyncReport {
        self.sync_one(entity_type, Plan::Full).await
    }

    /// Applies every change of one type after `cursor`.
    pub async fn incremental_sync_entity(
        &self,
        entity_type: EntityType,
        cursor: Timestamp,
    ) -> EntitySyncReport {
        self.sync_one(entity_type, Plan::Incremental(cursor)).await
    }

    // ── Internals ────────────────────────────────────────────────

    /// Single-type sync under the in-flight guard. Subscribers hear about it
    /// once if it changed the replica.
    async fn sync_one(&self, entity_type: EntityType, plan: Plan) -> EntitySyncReport {
        let _guard = self.in_flight.lock().await;
        let report = self.sync_type(entity_type, plan).await;
        if report.changed {
            self.notifier.notify();
        }
        report
    }

    async fn wait_for_running_pass(&self) -> SyncOutcome {
        debug!("sync pass already running; waiting for it");
        drop(self.in_flight.lock().await);
        SyncOutcome::Coalesced
    }

    /// Runs one pass over every type. Caller holds the in-flight guard.
    async fn run_pass(&self, full: bool) -> SyncResult<SyncReport> {
        let started_at = Timestamp::now();
        self.state.write().await.set_pass_running(true);

        let plan = if full { Plan::Full } else { Plan::Auto };
        let mut entities = Vec::with_capacity(EntityType::ALL.len());
        for entity_type in EntityType::ALL {
            entities.push(self.sync_type(entity_type, plan).await);
        }

        let report = SyncReport {
            started_at,
            finished_at: Timestamp::now(),
            entities,
        };
        let bookkeeping = self.record_pass(&report);
        self.state.write().await.set_pass_running(false);
        bookkeeping?;

        let failed = report.failed().count();
        info!(
            changed = report.changed(),
            failed,
            full = report.was_full(),
            "sync pass finished"
        );
        if report.changed() {
            self.notifier.notify();
        }
        Ok(report)
    }

    /// A full pass only counts once every type completed it; otherwise the
    /// next `initialize` runs it again.
    fn record_pass(&self, report: &SyncReport) -> SyncResult<()> {
        if report.was_full() && report.failed().next().is_none() {
            self.checkpoints.set_last_full_sync_at(report.started_at)?;
        }
        self.checkpoints.set_last_sync_at(report.finished_at)?;
        Ok(())
    }

    /// Syncs one type and records the outcome in the sync state. Errors are
    /// captured in the report, never propagated.
    async fn sync_type(&self, entity_type: EntityType, plan: Plan) -> EntitySyncReport {
        let mut report = EntitySyncReport::new(entity_type, SyncMode::Full);
        let result = self.try_sync_type(entity_type, plan, &mut report).await;

        let error = result.err().map(|e| e.to_string());
        if let Some(error) = &error {
            warn!(
                %entity_type,
                error = %error,
                cursor = ?report.cursor,
                "sync failed; will resume from last checkpoint"
            );
        } else {
            debug!(
                %entity_type,
                mode = ?report.mode,
                pages = report.pages,
                records = report.records_applied,
                "entity synced"
            );
        }

        self.state
            .write()
            .await
            .get_or_create_entity(entity_type)
            .finish(error.clone(), Timestamp::now());
        report.error = error;
        report
    }

    async fn try_sync_type(
        &self,
        entity_type: EntityType,
        plan: Plan,
        report: &mut EntitySyncReport,
    ) -> SyncResult<()> {
        let plan = match plan {
            Plan::Auto => match self.checkpoints.get_cursor(entity_type)? {
                Some(cursor) => Plan::Incremental(cursor),
                None => Plan::Full,
            },
            other => other,
        };

        match plan {
            Plan::Full | Plan::Auto => {
                report.mode = SyncMode::Full;
                self.state
                    .write()
                    .await
                    .get_or_create_entity(entity_type)
                    .begin(SyncMode::Full);

                // Nothing is cleared until the first page has arrived.
                let first = self.remote.fetch_page(entity_type, None, self.batch_size()).await?;

                self.checkpoints.clear_cursor(entity_type)?;
                let removed = self.store.clear(entity_type)?;
                report.changed = removed > 0;
                debug!(%entity_type, removed, "starting full sync");

                self.apply_pages(entity_type, None, Some(first), report).await
            }
            Plan::Incremental(cursor) => {
                report.mode = SyncMode::Incremental;
                report.cursor = Some(cursor);
                self.state
                    .write()
                    .await
                    .get_or_create_entity(entity_type)
                    .begin(SyncMode::Incremental);

                self.apply_pages(entity_type, Some(cursor), None, report).await
            }
        }
    }

    /// The fetch, apply, checkpoint loop. `first` is a page already fetched
    /// with `since`.
    async fn apply_pages(
        &self,
        entity_type: EntityType,
        mut since: Option<Timestamp>,
        mut first: Option<Vec<EntityRecord>>,
        report: &mut EntitySyncReport,
    ) -> SyncResult<()> {
        let batch_size = self.batch_size();

        loop {
            let mut page = match first.take() {
                Some(page) => page,
                None => self.remote.fetch_page(entity_type, since, batch_size).await?,
            };
            report.pages += 1;
            if page.is_empty() {
                return Ok(());
            }

            let full_page = page.len() >= batch_size;
            let Some(checkpoint) = next_checkpoint(&page, full_page) else {
                return Ok(());
            };
            if let Some(since) = since {
                if checkpoint <= since {
                    return Err(SyncError::Protocol(format!(
                        "{entity_type} page did not advance past {since}"
                    )));
                }
            }

            stamp_page(&mut page);
            self.store.upsert_many(entity_type, &page)?;
            report.records_applied += page.len();
            report.changed = true;

            self.checkpoints.set_cursor(entity_type, checkpoint)?;
            report.cursor = Some(checkpoint);
            debug!(
                %entity_type,
                records = page.len(),
                cursor = checkpoint.as_millis(),
                "checkpointed page"
            );

            if !full_page {
                return Ok(());
            }
            since = Some(checkpoint);
        }
    }
}

/// Per-type adjustments applied to a page before it is stored.
///
/// Products take `current_stock` verbatim from the page and stamp
/// `stock_synced_at` from the row's `updated_at`; any local value is
/// replaced, never merged.
fn stamp_page(page: &mut [EntityRecord]) {
    for record in page {
        let updated_at = record.updated_at;
        match &mut record.payload {
            RecordPayload::Product(product) => product.stock_synced_at = Some(updated_at),
            RecordPayload::Category(_) | RecordPayload::Package(_) | RecordPayload::Table(_) => {}
        }
    }
}

/// The cursor to store after applying `page`.
///
/// Fetches are strictly after the cursor, so a full page that ends in a run
/// of two or more equal `updated_at` values could leave the rest of that run
/// behind on the server. In that case the checkpoint stops just below the run
/// and the next fetch reads the whole run again. A page that is a single run
/// has nothing below it and checkpoints at its maximum.
pub(crate) fn next_checkpoint(page: &[EntityRecord], full_page: bool) -> Option<Timestamp> {
    let max = page.iter().map(|r| r.updated_at).max()?;
    if !full_page {
        return Some(max);
    }

    let run = page.iter().filter(|r| r.updated_at == max).count();
    if run < 2 {
        return Some(max);
    }

    match page.iter().map(|r| r.updated_at).filter(|t| *t < max).max() {
        Some(below_run) => Some(below_run),
        None => {
            warn!(
                updated_at = max.as_millis(),
                records = page.len(),
                "full page shares one updated_at; rows beyond the page wait for the next full sync"
            );
            Some(max)
        }
    }
}
