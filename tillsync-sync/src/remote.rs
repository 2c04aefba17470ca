//! Remote backend abstraction.
//!
//! The engine needs exactly two things from the hosted backend: a way to page
//! through catalog rows in `updated_at` order, and a way to submit one queued
//! mutation. Anything that can do both can back the replica.

use crate::error::SyncResult;
use async_trait::async_trait;
use tillsync_types::{EntityRecord, EntityType, QueuedMutation, Timestamp};

/// The page-fetch and mutation-submit contract of the remote backend.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Fetches up to `page_size` records of one entity type, ordered
    /// ascending by `updated_at`. With `since`, only records whose
    /// `updated_at` is strictly greater are returned.
    async fn fetch_page(
        &self,
        entity_type: EntityType,
        since: Option<Timestamp>,
        page_size: usize,
    ) -> SyncResult<Vec<EntityRecord>>;

    /// Submits one queued mutation.
    ///
    /// `SyncError::Rejected` means the backend refused it for good;
    /// `Network`/`Timeout` mean the outcome should be retried later.
    async fn submit_mutation(&self, mutation: &QueuedMutation) -> SyncResult<()>;
}

/// An in-memory backend for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tillsync_types::MutationKind;

    /// One recorded `fetch_page` call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FetchCall {
        pub entity_type: EntityType,
        pub since: Option<Timestamp>,
        pub page_size: usize,
        /// Records returned, or `None` if the call failed.
        pub returned: Option<usize>,
    }

    #[derive(Default)]
    struct MockState {
        records: HashMap<EntityType, Vec<EntityRecord>>,
        offline: bool,
        /// Successful fetches allowed per type before fetches start failing.
        fetch_budget: HashMap<EntityType, usize>,
        rejected_kinds: HashSet<MutationKind>,
        fetch_delay: Option<Duration>,
        fetch_calls: Vec<FetchCall>,
        submissions: Vec<QueuedMutation>,
    }

    /// A scripted in-memory backend.
    ///
    /// Holds the authoritative rows, answers pages with the strict `>` bound,
    /// and records every call so tests can assert on traffic.
    #[derive(Clone, Default)]
    pub struct MockRemote {
        state: Arc<Mutex<MockState>>,
    }

    impl MockRemote {
        /// Creates an empty, online backend.
        pub fn new() -> Self {
            Self::default()
        }

        /// Inserts or replaces rows by `(entity type, id)`.
        pub fn upsert(&self, records: impl IntoIterator<Item = EntityRecord>) {
            let mut state = self.state.lock().unwrap();
            for record in records {
                let rows = state.records.entry(record.entity_type()).or_default();
                rows.retain(|r| r.id != record.id);
                rows.push(record);
            }
        }

        /// Removes every row of one type.
        pub fn clear(&self, entity_type: EntityType) {
            self.state.lock().unwrap().records.remove(&entity_type);
        }

        /// Makes every call fail with a network error.
        pub fn set_offline(&self, offline: bool) {
            self.state.lock().unwrap().offline = offline;
        }

        /// Lets `successful` more fetches of `entity_type` succeed, then fails
        /// the rest with a network error until [`Self::heal`].
        pub fn fail_fetches_after(&self, entity_type: EntityType, successful: usize) {
            self.state
                .lock()
                .unwrap()
                .fetch_budget
                .insert(entity_type, successful);
        }

        /// Clears scripted fetch failures, rejections and offline mode.
        pub fn heal(&self) {
            let mut state = self.state.lock().unwrap();
            state.fetch_budget.clear();
            state.rejected_kinds.clear();
            state.offline = false;
        }

        /// Rejects every submission of one mutation kind.
        pub fn reject(&self, kind: MutationKind) {
            self.state.lock().unwrap().rejected_kinds.insert(kind);
        }

        /// Delays every fetch, to hold a sync pass open.
        pub fn set_fetch_delay(&self, delay: Option<Duration>) {
            self.state.lock().unwrap().fetch_delay = delay;
        }

        pub fn fetch_calls(&self) -> Vec<FetchCall> {
            self.state.lock().unwrap().fetch_calls.clone()
        }

        pub fn fetch_calls_for(&self, entity_type: EntityType) -> Vec<FetchCall> {
            self.fetch_calls()
                .into_iter()
                .filter(|c| c.entity_type == entity_type)
                .collect()
        }

        pub fn reset_calls(&self) {
            let mut state = self.state.lock().unwrap();
            state.fetch_calls.clear();
            state.submissions.clear();
        }

        /// Mutations accepted by the backend, in submission order.
        pub fn submissions(&self) -> Vec<QueuedMutation> {
            self.state.lock().unwrap().submissions.clone()
        }
    }

    #[async_trait]
    impl RemoteBackend for MockRemote {
        async fn fetch_page(
            &self,
            entity_type: EntityType,
            since: Option<Timestamp>,
            page_size: usize,
        ) -> SyncResult<Vec<EntityRecord>> {
            let delay = self.state.lock().unwrap().fetch_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.state.lock().unwrap();
            let mut call = FetchCall {
                entity_type,
                since,
                page_size,
                returned: None,
            };

            let exhausted = match state.fetch_budget.get_mut(&entity_type) {
                Some(0) => true,
                Some(budget) => {
                    *budget -= 1;
                    false
                }
                None => false,
            };
            if state.offline || exhausted {
                state.fetch_calls.push(call);
                return Err(SyncError::Network("mock remote unreachable".into()));
            }

            let mut page: Vec<EntityRecord> = state
                .records
                .get(&entity_type)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| since.is_none_or(|s| r.updated_at > s))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            page.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
            page.truncate(page_size);

            call.returned = Some(page.len());
            state.fetch_calls.push(call);
            Ok(page)
        }

        async fn submit_mutation(&self, mutation: &QueuedMutation) -> SyncResult<()> {
            let mut state = self.state.lock().unwrap();
            if state.offline {
                return Err(SyncError::Network("mock remote unreachable".into()));
            }
            if state.rejected_kinds.contains(&mutation.kind) {
                return Err(SyncError::Rejected(format!("{} not accepted", mutation.kind)));
            }
            state.submissions.push(mutation.clone());
            Ok(())
        }
    }
}
