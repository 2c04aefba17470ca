//! Background driver for the sync engine and the outbox.
//!
//! [`create_orchestrator`] wires an engine and an outbox over one replica and
//! returns a cloneable [`OrchestratorHandle`] for consumers plus the
//! [`SyncOrchestrator`] loop, which the caller spawns:
//!
//! ```no_run
//! # async fn demo(store: tillsync_storage::ReplicaStore,
//! #               remote: std::sync::Arc<dyn tillsync_sync::RemoteBackend>)
//! #               -> tillsync_sync::SyncResult<()> {
//! use tillsync_sync::{create_orchestrator, OrchestratorConfig, SyncConfig};
//!
//! let (handle, orchestrator) =
//!     create_orchestrator(store, remote, SyncConfig::default(), OrchestratorConfig::default())?;
//! tokio::spawn(orchestrator.run());
//!
//! handle.wait_ready().await?;
//! let products = handle.get_snapshot(tillsync_types::EntityType::Product);
//! # Ok(()) }
//! ```
//!
//! The loop waits `startup_delay`, runs one sync pass and one outbox run,
//! signals readiness, then serves commands and a periodic `poll_interval`
//! tick until shutdown.

use crate::engine::{SyncConfig, SyncEngine, SyncOutcome};
use crate::error::{SyncError, SyncResult};
use crate::outbox::{MutationOutbox, OutboxReport};
use crate::remote::RemoteBackend;
use crate::snapshot::{SnapshotReader, Subscription};
use crate::state::SyncStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tillsync_storage::ReplicaStore;
use tillsync_types::{EntityRecord, EntityType, MutationKind, MutationStatus, QueuedMutation, RecordId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the background loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Delay before the first sync, so startup is not slowed down (ms).
    pub startup_delay_ms: u64,
    /// Period of the background sync check (ms).
    pub poll_interval_ms: u64,
    /// Delivered mutations older than this are pruned on each tick (ms).
    pub succeeded_retention_ms: u64,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: 2_000,
            poll_interval_ms: 300_000,
            succeeded_retention_ms: 7 * 24 * 60 * 60 * 1000,
            command_buffer: 32,
        }
    }
}

impl OrchestratorConfig {
    fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn succeeded_retention(&self) -> Duration {
        Duration::from_millis(self.succeeded_retention_ms)
    }
}

/// Commands accepted by the orchestrator loop.
#[derive(Debug)]
pub enum SyncCommand {
    /// Sync every type now (full where no cursor exists).
    SyncNow {
        respond: oneshot::Sender<SyncResult<SyncOutcome>>,
    },
    /// Resync every type in full.
    ForceFullSync {
        respond: oneshot::Sender<SyncResult<SyncOutcome>>,
    },
    /// Deliver pending mutations.
    ProcessOutbox {
        respond: oneshot::Sender<SyncResult<OutboxReport>>,
    },
    /// Requeue failed mutations and deliver.
    RetryFailed {
        respond: oneshot::Sender<SyncResult<OutboxReport>>,
    },
    /// Network reachability changed.
    ConnectivityChanged(bool),
    /// Stop the loop.
    Shutdown,
}

/// Events published by the orchestrator.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The startup sync and outbox run finished.
    Ready,
    /// A sync pass finished.
    SyncCompleted {
        changed: bool,
        full: bool,
        failed: Vec<EntityType>,
    },
    /// An outbox run finished.
    OutboxProcessed(OutboxReport),
    ConnectivityChanged { online: bool },
}

/// Consumer-facing handle. Cloning is cheap.
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    event_tx: broadcast::Sender<SyncEvent>,
    ready_rx: watch::Receiver<bool>,
    engine: Arc<SyncEngine>,
    outbox: Arc<MutationOutbox>,
    reader: SnapshotReader,
}

impl OrchestratorHandle {
    // ── Reads ────────────────────────────────────────────────────

    /// Current replica contents for one type. Never waits on sync activity.
    pub fn get_snapshot(&self, entity_type: EntityType) -> Vec<EntityRecord> {
        self.reader.get_snapshot(entity_type)
    }

    pub fn get_record(&self, entity_type: EntityType, id: &RecordId) -> Option<EntityRecord> {
        self.reader.get_record(entity_type, id)
    }

    pub async fn get_sync_status(&self) -> SyncResult<SyncStatus> {
        self.reader.sync_status().await
    }

    /// Calls `callback` after every sync pass that changed the replica.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.engine.notifier().subscribe(callback)
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Waits until the startup sync has run.
    pub async fn wait_ready(&self) -> SyncResult<()> {
        let mut ready = self.ready_rx.clone();
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::ChannelClosed)
    }

    // ── Outbox ───────────────────────────────────────────────────

    /// Validates and durably queues a mutation. Returns its local id.
    ///
    /// Any optimistic local effect (such as a stock decrement for display) is
    /// the caller's job, done alongside this call.
    pub fn enqueue_mutation(&self, kind: MutationKind, payload: Value) -> SyncResult<i64> {
        self.outbox.enqueue(kind, payload)
    }

    pub fn list_mutations(&self, status: Option<MutationStatus>) -> SyncResult<Vec<QueuedMutation>> {
        self.outbox.list(status)
    }

    pub async fn process_outbox(&self) -> SyncResult<OutboxReport> {
        self.request(|respond| SyncCommand::ProcessOutbox { respond }).await
    }

    pub async fn retry_failed_mutations(&self) -> SyncResult<OutboxReport> {
        self.request(|respond| SyncCommand::RetryFailed { respond }).await
    }

    // ── Sync ─────────────────────────────────────────────────────

    pub async fn sync_now(&self) -> SyncResult<SyncOutcome> {
        self.request(|respond| SyncCommand::SyncNow { respond }).await
    }

    pub async fn force_full_sync(&self) -> SyncResult<SyncOutcome> {
        self.request(|respond| SyncCommand::ForceFullSync { respond }).await
    }

    /// Reports a connectivity change. Coming back online replays the outbox
    /// and runs a sync.
    pub async fn set_online(&self, online: bool) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::ConnectivityChanged(online))
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::Shutdown)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> SyncCommand,
    ) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }
}

/// The background loop. Spawn [`SyncOrchestrator::run`] on the runtime.
pub struct SyncOrchestrator {
    config: OrchestratorConfig,
    engine: Arc<SyncEngine>,
    outbox: Arc<MutationOutbox>,
    command_rx: mpsc::Receiver<SyncCommand>,
    event_tx: broadcast::Sender<SyncEvent>,
    ready_tx: watch::Sender<bool>,
    online: bool,
}

/// Builds the engine, the outbox and the loop over one replica.
///
/// Opening the outbox recovers deliveries a previous process left in flight.
pub fn create_orchestrator(
    store: ReplicaStore,
    remote: Arc<dyn RemoteBackend>,
    sync_config: SyncConfig,
    config: OrchestratorConfig,
) -> SyncResult<(OrchestratorHandle, SyncOrchestrator)> {
    let engine = Arc::new(SyncEngine::new(store.clone(), remote.clone(), sync_config));
    let outbox = Arc::new(MutationOutbox::new(store, remote)?);

    let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
    let (event_tx, _) = broadcast::channel(64);
    let (ready_tx, ready_rx) = watch::channel(false);

    let handle = OrchestratorHandle {
        command_tx,
        event_tx: event_tx.clone(),
        ready_rx,
        reader: engine.snapshot_reader(),
        engine: engine.clone(),
        outbox: outbox.clone(),
    };

    let orchestrator = SyncOrchestrator {
        config,
        engine,
        outbox,
        command_rx,
        event_tx,
        ready_tx,
        online: true,
    };

    Ok((handle, orchestrator))
}

impl SyncOrchestrator {
    /// Runs until [`SyncCommand::Shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            startup_delay_ms = self.config.startup_delay_ms,
            poll_interval_ms = self.config.poll_interval_ms,
            "sync orchestrator starting"
        );

        tokio::time::sleep(self.config.startup_delay()).await;
        self.run_initialize().await;
        self.run_outbox().await;
        self.ready_tx.send_replace(true);
        self.emit(SyncEvent::Ready);

        let period = self.config.poll_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                command = self.command_rx.recv() => match command {
                    None | Some(SyncCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
            }
        }

        info!("sync orchestrator stopped");
    }

    async fn on_tick(&mut self) {
        if !self.online {
            debug!("offline; skipping periodic sync");
            return;
        }
        self.run_initialize().await;
        self.run_outbox().await;

        match self.outbox.prune_succeeded(self.config.succeeded_retention()) {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "pruned delivered mutations"),
            Err(e) => warn!(error = %e, "outbox prune failed"),
        }
    }

    async fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::SyncNow { respond } => {
                let result = self.engine.sync_all_entities().await;
                self.publish_sync(&result);
                let _ = respond.send(result);
            }
            SyncCommand::ForceFullSync { respond } => {
                let result = self.engine.force_full_sync().await;
                self.publish_sync(&result);
                let _ = respond.send(result);
            }
            SyncCommand::ProcessOutbox { respond } => {
                let result = self.outbox.process_queue().await;
                self.publish_outbox(&result);
                let _ = respond.send(result);
            }
            SyncCommand::RetryFailed { respond } => {
                let result = self.outbox.retry_failed().await;
                self.publish_outbox(&result);
                let _ = respond.send(result);
            }
            SyncCommand::ConnectivityChanged(online) => self.set_online(online).await,
            SyncCommand::Shutdown => {}
        }
    }

    async fn set_online(&mut self, online: bool) {
        let was_online = std::mem::replace(&mut self.online, online);
        if was_online == online {
            return;
        }
        info!(online, "connectivity changed");
        self.emit(SyncEvent::ConnectivityChanged { online });

        if online {
            self.run_outbox().await;
            let result = self.engine.sync_all_entities().await;
            self.publish_sync(&result);
        }
    }

    async fn run_initialize(&mut self) {
        let result = self.engine.initialize().await;
        self.publish_sync(&result);
    }

    async fn run_outbox(&mut self) {
        let result = self.outbox.process_queue().await;
        self.publish_outbox(&result);
    }

    fn publish_sync(&self, result: &SyncResult<SyncOutcome>) {
        match result {
            Ok(SyncOutcome::Completed(report)) => self.emit(SyncEvent::SyncCompleted {
                changed: report.changed(),
                full: report.was_full(),
                failed: report.failed().map(|e| e.entity_type).collect(),
            }),
            Ok(SyncOutcome::Coalesced) => {}
            Err(e) => warn!(error = %e, "sync pass aborted"),
        }
    }

    fn publish_outbox(&self, result: &SyncResult<OutboxReport>) {
        match result {
            Ok(report) if report.attempted > 0 || report.retried > 0 => {
                self.emit(SyncEvent::OutboxProcessed(report.clone()));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "outbox run aborted"),
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}
