//! Offline-first catalog sync for tillsync.
//!
//! Keeps a local replica of the point-of-sale catalog usable with no network
//! at all, reconciles it against the hosted backend, and queues local writes
//! for delivery when the backend is reachable.
//!
//! # Architecture
//!
//! The replica, its checkpoints and the outbox table live in one SQLite
//! database (`tillsync-storage`). This crate adds the moving parts:
//!
//! - **Remote**: the page-fetch and mutation-submit contract of the backend
//! - **Engine**: full and incremental sync with per-page checkpoints
//! - **Outbox**: durable FIFO delivery of queued mutations
//! - **Snapshot**: non-blocking reads and change notification
//! - **Orchestrator**: startup sync, periodic polling and explicit triggers
//!
//! ## Sync Process
//!
//! 1. **Decide**: full sync of every type when the last one is older than
//!    the full-sync interval, otherwise incremental
//! 2. **Fetch**: request a page ordered by `updated_at`, after the cursor
//! 3. **Apply**: upsert the page into the type's partition
//! 4. **Checkpoint**: advance the cursor past what was applied
//! 5. **Notify**: tell subscribers once if the pass changed anything
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tillsync_storage::ReplicaStore;
//! use tillsync_sync::remote::mock::MockRemote;
//! use tillsync_sync::{SyncConfig, SyncEngine};
//!
//! let store = ReplicaStore::open_in_memory().unwrap();
//! let config = SyncConfig {
//!     batch_size: 50,
//!     ..Default::default()
//! };
//!
//! let engine = SyncEngine::new(store, Arc::new(MockRemote::new()), config);
//! assert_eq!(engine.batch_size(), 50);
//! ```

mod engine;
mod error;
pub mod http;
mod orchestrator;
pub mod outbox;
pub mod remote;
pub mod snapshot;
pub mod state;

pub use engine::{EntitySyncReport, SyncConfig, SyncEngine, SyncOutcome, SyncReport, DEFAULT_BATCH_SIZE};
pub use error::{SyncError, SyncResult};
pub use http::{HttpRemote, HttpRemoteConfig};
pub use orchestrator::{
    create_orchestrator, OrchestratorConfig, OrchestratorHandle, SyncCommand, SyncEvent,
    SyncOrchestrator,
};
pub use outbox::{MutationOutbox, OutboxReport};
pub use remote::RemoteBackend;
pub use snapshot::{ChangeNotifier, SnapshotReader, Subscription};
pub use state::{EntitySyncState, SyncMode, SyncState, SyncStatus};
