use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tillsync_storage::{CheckpointManager, ReplicaStore};
use tillsync_sync::remote::mock::MockRemote;
use tillsync_sync::{SyncConfig, SyncEngine, SyncMode, SyncOutcome};
use tillsync_types::{
    CategoryPayload, EntityRecord, EntityType, ProductPayload, RecordId, RecordPayload, TablePayload,
    Timestamp,
};

fn ts(ms: u64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn product(id: &str, updated_at: u64, stock: i64) -> EntityRecord {
    EntityRecord::new(
        id,
        ts(updated_at),
        RecordPayload::Product(ProductPayload {
            name: format!("Product {id}"),
            current_stock: stock,
            ..Default::default()
        }),
    )
}

fn category(id: &str, updated_at: u64) -> EntityRecord {
    EntityRecord::new(
        id,
        ts(updated_at),
        RecordPayload::Category(CategoryPayload {
            name: format!("Category {id}"),
            ..Default::default()
        }),
    )
}

fn table(id: &str, updated_at: u64) -> EntityRecord {
    EntityRecord::new(
        id,
        ts(updated_at),
        RecordPayload::Table(TablePayload {
            name: format!("Table {id}"),
            ..Default::default()
        }),
    )
}

fn products(count: u64) -> Vec<EntityRecord> {
    (1..=count).map(|i| product(&format!("p{i:03}"), i, 10)).collect()
}

fn make_engine(batch_size: usize) -> (SyncEngine, ReplicaStore, MockRemote) {
    let store = ReplicaStore::open_in_memory().unwrap();
    let remote = MockRemote::new();
    let engine = SyncEngine::new(
        store.clone(),
        Arc::new(remote.clone()),
        SyncConfig {
            batch_size,
            ..Default::default()
        },
    );
    (engine, store, remote)
}

fn sinces(remote: &MockRemote, entity_type: EntityType) -> Vec<Option<u64>> {
    remote
        .fetch_calls_for(entity_type)
        .iter()
        .map(|c| c.since.map(|t| t.as_millis()))
        .collect()
}

fn returned(remote: &MockRemote, entity_type: EntityType) -> Vec<Option<usize>> {
    remote
        .fetch_calls_for(entity_type)
        .iter()
        .map(|c| c.returned)
        .collect()
}

// ── Configuration ────────────────────────────────────────────────

#[test]
fn default_config() {
    let config = SyncConfig::default();
    assert_eq!(config.batch_size, 100);
    assert_eq!(config.full_sync_interval_ms, 86_400_000);
    assert_eq!(config.full_sync_interval(), Duration::from_secs(24 * 3600));
}

#[test]
fn config_deserializes_with_defaults() {
    let config: SyncConfig = serde_json::from_str(r#"{"batch_size": 25}"#).unwrap();
    assert_eq!(config.batch_size, 25);
    assert_eq!(config.full_sync_interval_ms, 86_400_000);
}

#[test]
fn zero_batch_size_is_clamped() {
    let (engine, _, _) = make_engine(0);
    assert_eq!(engine.batch_size(), 1);
}

// ── Full sync ────────────────────────────────────────────────────

#[tokio::test]
async fn full_sync_pages_through_250_products() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert(products(250));

    let report = engine.full_sync_entity(EntityType::Product).await;

    assert!(report.is_ok(), "{:?}", report.error);
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.pages, 3);
    assert_eq!(report.records_applied, 250);
    assert_eq!(returned(&remote, EntityType::Product), vec![Some(100), Some(100), Some(50)]);
    assert_eq!(sinces(&remote, EntityType::Product), vec![None, Some(100), Some(200)]);
    assert_eq!(report.cursor, Some(ts(250)));
    assert_eq!(
        CheckpointManager::new(store.clone()).get_cursor(EntityType::Product).unwrap(),
        Some(ts(250))
    );
    assert_eq!(store.count(EntityType::Product).unwrap(), 250);
}

#[tokio::test]
async fn full_sync_leaves_no_prior_generation() {
    let (engine, store, remote) = make_engine(100);
    store
        .upsert_many(EntityType::Product, &[product("stale", 1, 3), product("a", 1, 3)])
        .unwrap();
    remote.upsert([product("a", 5, 4), product("b", 6, 2)]);

    let report = engine.full_sync_entity(EntityType::Product).await;
    assert!(report.changed);

    let ids: Vec<_> = store
        .get_all(EntityType::Product)
        .unwrap()
        .into_iter()
        .map(|r| r.id.to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn full_sync_of_empty_remote_empties_partition() {
    let (engine, store, _remote) = make_engine(100);
    store.upsert_many(EntityType::Table, &[table("t1", 1)]).unwrap();

    let report = engine.full_sync_entity(EntityType::Table).await;

    assert!(report.is_ok());
    assert!(report.changed);
    assert_eq!(report.pages, 1);
    assert_eq!(report.cursor, None);
    assert_eq!(store.count(EntityType::Table).unwrap(), 0);
}

#[tokio::test]
async fn full_sync_stamps_stock_synced_at_from_updated_at() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert([product("p1", 42, 5)]);

    engine.full_sync_entity(EntityType::Product).await;

    let stored = store
        .get_one(EntityType::Product, &RecordId::new("p1"))
        .unwrap()
        .unwrap();
    let payload = stored.as_product().unwrap();
    assert_eq!(payload.current_stock, 5);
    assert_eq!(payload.stock_synced_at, Some(ts(42)));
}

// ── Incremental sync ─────────────────────────────────────────────

#[tokio::test]
async fn incremental_sync_applies_only_changed_records() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert(products(5));
    engine.sync_entity(EntityType::Product).await;
    let before = store.get_all(EntityType::Product).unwrap();
    remote.reset_calls();

    remote.upsert([product("p002", 10, 99), product("p004", 10, 98)]);
    let report = engine.incremental_sync_entity(EntityType::Product, ts(5)).await;

    assert!(report.is_ok());
    assert_eq!(report.mode, SyncMode::Incremental);
    assert_eq!(report.records_applied, 2);
    assert_eq!(report.cursor, Some(ts(10)));
    assert_eq!(sinces(&remote, EntityType::Product), vec![Some(5)]);

    let after = store.get_all(EntityType::Product).unwrap();
    let changed: Vec<_> = after
        .iter()
        .filter(|r| !before.contains(r))
        .map(|r| r.id.to_string())
        .collect();
    assert_eq!(changed, vec!["p002", "p004"]);
    assert_eq!(after.len(), 5);
}

#[tokio::test]
async fn sync_entity_chooses_mode_from_cursor() {
    let (engine, _store, remote) = make_engine(100);
    remote.upsert([category("c1", 1)]);

    let first = engine.sync_entity(EntityType::Category).await;
    assert_eq!(first.mode, SyncMode::Full);

    let second = engine.sync_entity(EntityType::Category).await;
    assert_eq!(second.mode, SyncMode::Incremental);
    assert_eq!(second.records_applied, 0);
    assert!(!second.changed);
    assert_eq!(sinces(&remote, EntityType::Category), vec![None, Some(1)]);
}

#[tokio::test]
async fn empty_incremental_keeps_cursor() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert(products(3));
    engine.sync_entity(EntityType::Product).await;

    let report = engine.sync_entity(EntityType::Product).await;
    assert_eq!(report.cursor, Some(ts(3)));
    assert_eq!(
        CheckpointManager::new(store).get_cursor(EntityType::Product).unwrap(),
        Some(ts(3))
    );
}

// ── Failure and resume ───────────────────────────────────────────

#[tokio::test]
async fn failure_after_second_page_resumes_from_checkpoint() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert(products(250));
    remote.fail_fetches_after(EntityType::Product, 2);

    let failed = engine.full_sync_entity(EntityType::Product).await;
    assert!(failed.error.is_some());
    assert_eq!(failed.cursor, Some(ts(200)));
    assert_eq!(store.count(EntityType::Product).unwrap(), 200);
    assert_eq!(
        CheckpointManager::new(store.clone()).get_cursor(EntityType::Product).unwrap(),
        Some(ts(200))
    );

    remote.heal();
    remote.reset_calls();
    let resumed = engine.sync_entity(EntityType::Product).await;

    assert!(resumed.is_ok());
    assert_eq!(resumed.mode, SyncMode::Incremental);
    assert_eq!(sinces(&remote, EntityType::Product), vec![Some(200)]);
    assert_eq!(returned(&remote, EntityType::Product), vec![Some(50)]);
    assert_eq!(store.count(EntityType::Product).unwrap(), 250);
}

#[tokio::test]
async fn one_failing_type_does_not_abort_the_others() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert([category("c1", 1)]);
    remote.upsert(products(3));
    remote.upsert([table("t1", 1)]);
    remote.fail_fetches_after(EntityType::Category, 0);

    let outcome = engine.sync_all_entities().await.unwrap();
    let report = outcome.report().unwrap();

    assert!(report.entity(EntityType::Category).unwrap().error.is_some());
    assert!(report.entity(EntityType::Product).unwrap().is_ok());
    assert!(report.entity(EntityType::Table).unwrap().is_ok());
    assert_eq!(store.count(EntityType::Product).unwrap(), 3);
    assert_eq!(store.count(EntityType::Table).unwrap(), 1);

    let status = engine.snapshot_reader().sync_status().await.unwrap();
    assert_eq!(status.per_entity_error.len(), 1);
    assert!(status.per_entity_error.contains_key(&EntityType::Category));
}

#[tokio::test]
async fn successful_retry_clears_last_error() {
    let (engine, _store, remote) = make_engine(100);
    remote.upsert([category("c1", 1)]);
    remote.set_offline(true);
    engine.sync_all_entities().await.unwrap();
    let status = engine.snapshot_reader().sync_status().await.unwrap();
    assert_eq!(status.per_entity_error.len(), EntityType::ALL.len());

    remote.set_offline(false);
    engine.sync_all_entities().await.unwrap();
    let status = engine.snapshot_reader().sync_status().await.unwrap();
    assert!(status.per_entity_error.is_empty());
}

// ── Page-boundary ties ───────────────────────────────────────────

#[tokio::test]
async fn ties_at_page_boundary_are_reread_not_skipped() {
    let (engine, store, remote) = make_engine(3);
    remote.upsert([
        product("a", 1, 1),
        product("b", 2, 1),
        product("c", 2, 1),
        product("d", 2, 1),
        product("e", 3, 1),
    ]);

    let report = engine.full_sync_entity(EntityType::Product).await;

    assert!(report.is_ok());
    assert_eq!(sinces(&remote, EntityType::Product), vec![None, Some(1), Some(2)]);
    assert_eq!(report.cursor, Some(ts(3)));
    assert_eq!(store.count(EntityType::Product).unwrap(), 5);
}

// ── Stock authority ──────────────────────────────────────────────

#[tokio::test]
async fn remote_stock_overrides_optimistic_adjustment() {
    let (engine, store, remote) = make_engine(100);
    let p1 = RecordId::new("p1");
    remote.upsert([product("p1", 1, 10)]);
    engine.sync_all_entities().await.unwrap();

    assert_eq!(store.adjust_stock(&p1, -1).unwrap(), Some(9));

    remote.upsert([product("p1", 2, 7)]);
    engine.sync_all_entities().await.unwrap();

    let stored = store.get_one(EntityType::Product, &p1).unwrap().unwrap();
    assert_eq!(stored.as_product().unwrap().current_stock, 7);
    assert_eq!(stored.as_product().unwrap().stock_synced_at, Some(ts(2)));
}

// ── Passes ───────────────────────────────────────────────────────

#[tokio::test]
async fn initialize_runs_full_sync_when_never_synced() {
    let (engine, _store, remote) = make_engine(100);
    remote.upsert(products(2));

    let report = engine.initialize().await.unwrap().into_report().unwrap();

    assert!(report.was_full());
    assert_eq!(
        engine.checkpoints().get_last_full_sync_at().unwrap(),
        Some(report.started_at)
    );
    assert_eq!(engine.checkpoints().get_last_sync_at().unwrap(), Some(report.finished_at));
}

#[tokio::test]
async fn initialize_runs_full_sync_when_last_full_sync_is_stale() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert(products(2));
    remote.upsert([category("c1", 1)]);
    engine.sync_all_entities().await.unwrap();

    let checkpoints = CheckpointManager::new(store.clone());
    assert!(checkpoints.get_cursor(EntityType::Product).unwrap().is_some());
    checkpoints
        .set_last_full_sync_at(Timestamp::now().saturating_sub(Duration::from_secs(25 * 3600)))
        .unwrap();

    let report = engine.initialize().await.unwrap().into_report().unwrap();

    for entity in &report.entities {
        assert_eq!(entity.mode, SyncMode::Full, "{}", entity.entity_type);
    }
    assert_eq!(sinces(&remote, EntityType::Product).last(), Some(&None));
}

#[tokio::test]
async fn due_full_sync_while_offline_keeps_replica() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert(products(2));
    engine.sync_all_entities().await.unwrap();
    let checkpoints = CheckpointManager::new(store.clone());
    let stale = Timestamp::now().saturating_sub(Duration::from_secs(25 * 3600));
    checkpoints.set_last_full_sync_at(stale).unwrap();

    remote.set_offline(true);
    let report = engine.initialize().await.unwrap().into_report().unwrap();

    assert!(report.entity(EntityType::Product).unwrap().error.is_some());
    assert!(!report.changed());
    assert_eq!(engine.snapshot_reader().get_snapshot(EntityType::Product).len(), 2);
    assert_eq!(checkpoints.get_cursor(EntityType::Product).unwrap(), Some(ts(2)));
    assert_eq!(checkpoints.get_last_full_sync_at().unwrap(), Some(stale));
    assert!(engine.needs_full_sync(Timestamp::now()).unwrap());
}

#[tokio::test]
async fn forced_full_sync_while_offline_keeps_replica() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert(products(3));
    engine.sync_all_entities().await.unwrap();

    remote.set_offline(true);
    let report = engine.force_full_sync().await.unwrap().into_report().unwrap();

    assert_eq!(report.failed().count(), EntityType::ALL.len());
    assert_eq!(store.count(EntityType::Product).unwrap(), 3);
    assert_eq!(
        engine.checkpoints().get_cursor(EntityType::Product).unwrap(),
        Some(ts(3))
    );
}

#[tokio::test]
async fn initialize_runs_incremental_within_interval() {
    let (engine, _store, remote) = make_engine(100);
    remote.upsert(products(2));
    engine.initialize().await.unwrap();

    let report = engine.initialize().await.unwrap().into_report().unwrap();

    assert_eq!(
        report.entity(EntityType::Product).unwrap().mode,
        SyncMode::Incremental
    );
    assert!(!report.was_full());
    assert_eq!(sinces(&remote, EntityType::Product), vec![None, Some(2)]);
}

#[tokio::test]
async fn force_full_sync_clears_cursors() {
    let (engine, store, remote) = make_engine(100);
    remote.upsert(products(3));
    engine.sync_all_entities().await.unwrap();
    remote.reset_calls();

    let report = engine.force_full_sync().await.unwrap().into_report().unwrap();

    assert!(report.was_full());
    assert_eq!(sinces(&remote, EntityType::Product), vec![None]);
    assert_eq!(store.count(EntityType::Product).unwrap(), 3);
    assert!(engine.checkpoints().get_last_full_sync_at().unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn concurrent_passes_collapse_into_one() {
    let (engine, _store, remote) = make_engine(100);
    remote.upsert(products(3));
    remote.set_fetch_delay(Some(Duration::from_millis(50)));

    let (first, second) = tokio::join!(engine.sync_all_entities(), engine.sync_all_entities());
    let outcomes = [first.unwrap(), second.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Completed(_)))
        .count();
    let coalesced = outcomes.iter().filter(|o| o.is_coalesced()).count();
    assert_eq!((completed, coalesced), (1, 1));
    assert_eq!(remote.fetch_calls_for(EntityType::Product).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn pass_during_single_type_sync_waits_and_coalesces() {
    let (engine, _store, remote) = make_engine(100);
    remote.upsert(products(2));
    remote.upsert([category("c1", 1)]);
    remote.set_fetch_delay(Some(Duration::from_millis(50)));

    let (single, pass) = tokio::join!(
        engine.sync_entity(EntityType::Product),
        engine.sync_all_entities()
    );

    assert_eq!(single.records_applied, 2);
    assert!(pass.unwrap().is_coalesced());
    // Only the single-type sync ran, so categories were never fetched.
    assert!(remote.fetch_calls_for(EntityType::Category).is_empty());
    assert_eq!(
        engine.snapshot_reader().get_snapshot(EntityType::Product).len(),
        2
    );
}

// ── Notification ─────────────────────────────────────────────────

#[tokio::test]
async fn notifies_once_per_pass_that_changed_data() {
    let (engine, _store, remote) = make_engine(2);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let _subscription = engine.notifier().subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    remote.upsert(products(5));
    remote.upsert([category("c1", 1)]);
    engine.sync_all_entities().await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    engine.sync_all_entities().await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    remote.upsert([product("p001", 100, 1)]);
    engine.sync_all_entities().await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn single_type_sync_notifies_when_it_changes_data() {
    let (engine, _store, remote) = make_engine(100);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let _subscription = engine.notifier().subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    remote.upsert([product("p1", 1, 4)]);
    let report = engine.sync_entity(EntityType::Product).await;
    assert_eq!(report.records_applied, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    engine.incremental_sync_entity(EntityType::Product, ts(1)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    engine.full_sync_entity(EntityType::Product).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

// ── Properties ───────────────────────────────────────────────────

mod properties {
    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;
    use std::collections::BTreeMap;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn cursor_never_regresses_across_attempts_and_replica_converges(
            rounds in prop::collection::vec(
                (prop::collection::vec((0u8..12, 1u64..4), 0..8), any::<bool>()),
                1..6,
            ),
            batch_size in 1usize..5,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            runtime.block_on(async {
                let (engine, store, remote) = make_engine(batch_size);
                let checkpoints = CheckpointManager::new(store.clone());
                let mut authoritative = BTreeMap::new();
                let mut clock = 0u64;
                let mut last_cursor = None;

                for (round, offline) in rounds {
                    for (id, step) in round {
                        clock += step;
                        let id = format!("p{id:02}");
                        remote.upsert([product(&id, clock, clock as i64)]);
                        authoritative.insert(id, clock);
                    }

                    remote.set_offline(offline);
                    engine.sync_entity(EntityType::Product).await;
                    remote.set_offline(false);
                    let cursor = checkpoints.get_cursor(EntityType::Product).unwrap();
                    prop_assert!(cursor >= last_cursor);
                    last_cursor = cursor;
                }
                engine.sync_entity(EntityType::Product).await;

                let local: BTreeMap<String, u64> = store
                    .get_all(EntityType::Product)
                    .unwrap()
                    .into_iter()
                    .map(|r| (r.id.to_string(), r.updated_at.as_millis()))
                    .collect();
                prop_assert_eq!(local, authoritative);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
