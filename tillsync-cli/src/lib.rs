//! Configuration and commands behind the `tillsync` binary.
//!
//! The binary is a thin clap front end; everything it does goes through
//! [`App`], which owns one replica plus the engine and outbox over it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tillsync_storage::ReplicaStore;
use tillsync_sync::{
    HttpRemote, HttpRemoteConfig, MutationOutbox, OrchestratorConfig, OutboxReport, RemoteBackend,
    SyncConfig, SyncEngine, SyncOutcome, SyncStatus,
};
use tillsync_types::{EntityType, MutationKind, MutationStatus, QueuedMutation, RecordId};
use tracing::{info, warn};

/// Default replica location, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "tillsync.db";

/// Everything the binary can be configured with.
///
/// Loaded from an optional JSON file; missing fields take their defaults and
/// command-line flags override what the file says.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub db_path: PathBuf,
    pub remote: HttpRemoteConfig,
    pub sync: SyncConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            remote: HttpRemoteConfig::default(),
            sync: SyncConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl CliConfig {
    /// Reads the config file at `path`, or returns the defaults when no path
    /// is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Applies command-line overrides on top of the loaded values.
    pub fn with_overrides(
        mut self,
        db_path: Option<PathBuf>,
        base_url: Option<String>,
        batch_size: Option<usize>,
    ) -> Self {
        if let Some(db_path) = db_path {
            self.db_path = db_path;
        }
        if let Some(base_url) = base_url {
            self.remote.base_url = base_url;
        }
        if let Some(batch_size) = batch_size {
            self.sync.batch_size = batch_size;
        }
        self
    }

    /// Opens the replica named by `db_path`.
    pub fn open_store(&self) -> Result<ReplicaStore> {
        ReplicaStore::open(&self.db_path)
            .with_context(|| format!("Failed to open replica at {}", self.db_path.display()))
    }

    /// Builds the HTTP remote from the `remote` section.
    pub fn http_remote(&self) -> Result<Arc<dyn RemoteBackend>> {
        let remote = HttpRemote::new(self.remote.clone()).context("Failed to build HTTP client")?;
        Ok(Arc::new(remote))
    }
}

/// One-shot access to the replica, the engine and the outbox.
pub struct App {
    store: ReplicaStore,
    engine: SyncEngine,
    outbox: MutationOutbox,
}

impl App {
    pub fn new(store: ReplicaStore, remote: Arc<dyn RemoteBackend>, config: SyncConfig) -> Result<Self> {
        let engine = SyncEngine::new(store.clone(), remote.clone(), config);
        let outbox = MutationOutbox::new(store.clone(), remote).context("Failed to open outbox")?;
        Ok(Self {
            store,
            engine,
            outbox,
        })
    }

    /// Runs one sync pass. `full` forces every type through the full branch.
    pub async fn sync(&self, full: bool) -> Result<SyncOutcome> {
        let outcome = if full {
            self.engine.force_full_sync().await?
        } else {
            self.engine.initialize().await?
        };
        if let Some(report) = outcome.report() {
            for failed in report.failed() {
                warn!(
                    "{} sync failed: {}",
                    failed.entity_type,
                    failed.error.as_deref().unwrap_or("unknown error")
                );
            }
            info!(
                "Sync pass finished (full: {}, changed: {})",
                report.was_full(),
                report.changed()
            );
        }
        Ok(outcome)
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(self.engine.snapshot_reader().sync_status().await?)
    }

    /// Every replicated record of one type, encoded as flat JSON rows.
    pub fn snapshot(&self, entity_type: EntityType) -> Result<Vec<Value>> {
        self.engine
            .snapshot_reader()
            .get_snapshot(entity_type)
            .iter()
            .map(|record| record.to_json().map_err(Into::into))
            .collect()
    }

    pub fn record(&self, entity_type: EntityType, id: &str) -> Result<Option<Value>> {
        self.engine
            .snapshot_reader()
            .get_record(entity_type, &RecordId::new(id))
            .map(|record| record.to_json())
            .transpose()
            .map_err(Into::into)
    }

    /// Queues a mutation. A stock adjustment is also applied to the local
    /// replica so the new level shows before the next sync.
    pub fn enqueue(&self, kind: MutationKind, payload: Value) -> Result<i64> {
        let local_id = self.outbox.enqueue(kind, payload.clone())?;
        if kind == MutationKind::AdjustStock {
            let product_id = payload["product_id"].as_str().unwrap_or_default();
            let delta = payload["delta"].as_i64().unwrap_or_default();
            match self.store.adjust_stock(&RecordId::new(product_id), delta)? {
                Some(stock) => info!("Local stock for {} is now {}", product_id, stock),
                None => warn!("Product {} is not replicated; stock shown after next sync", product_id),
            }
        }
        info!("Queued {} as #{}", kind, local_id);
        Ok(local_id)
    }

    pub fn mutations(&self, status: Option<MutationStatus>) -> Result<Vec<QueuedMutation>> {
        Ok(self.outbox.list(status)?)
    }

    /// Delivers pending mutations.
    pub async fn push(&self) -> Result<OutboxReport> {
        let report = self.outbox.process_queue().await?;
        log_outbox(&report);
        Ok(report)
    }

    /// Moves failed mutations back to pending and delivers them.
    pub async fn retry(&self) -> Result<OutboxReport> {
        let report = self.outbox.retry_failed().await?;
        log_outbox(&report);
        Ok(report)
    }
}

fn log_outbox(report: &OutboxReport) {
    info!(
        "Outbox run: {} sent, {} failed, {} deferred",
        report.succeeded, report.failed, report.deferred
    );
}
