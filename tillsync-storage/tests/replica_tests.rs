use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tillsync_storage::ReplicaStore;
use tillsync_types::{
    CategoryPayload, EntityRecord, EntityType, ProductPayload, RecordId, RecordPayload, Timestamp,
};

fn product(id: &str, updated_at: u64, stock: i64) -> EntityRecord {
    EntityRecord::new(
        id,
        Timestamp::from_millis(updated_at),
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
        Timestamp::from_millis(updated_at),
        RecordPayload::Category(CategoryPayload {
            name: format!("Category {id}"),
            ..Default::default()
        }),
    )
}

// ── upsert_many / get ────────────────────────────────────────────

#[test]
fn upsert_and_get_all() {
    let store = ReplicaStore::open_in_memory().unwrap();
    let written = store
        .upsert_many(EntityType::Product, &[product("b", 20, 1), product("a", 10, 2)])
        .unwrap();
    assert_eq!(written, 2);

    let all = store.get_all(EntityType::Product).unwrap();
    assert_eq!(all.len(), 2);
    // Ordered by updated_at
    assert_eq!(all[0].id, RecordId::new("a"));
    assert_eq!(all[1].id, RecordId::new("b"));
}

#[test]
fn upsert_empty_batch_is_noop() {
    let store = ReplicaStore::open_in_memory().unwrap();
    assert_eq!(store.upsert_many(EntityType::Table, &[]).unwrap(), 0);
    assert_eq!(store.count(EntityType::Table).unwrap(), 0);
}

#[test]
fn upsert_replaces_by_id() {
    let store = ReplicaStore::open_in_memory().unwrap();
    store.upsert_many(EntityType::Product, &[product("p", 10, 5)]).unwrap();
    store.upsert_many(EntityType::Product, &[product("p", 20, 3)]).unwrap();

    let all = store.get_all(EntityType::Product).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].updated_at, Timestamp::from_millis(20));
    assert_eq!(all[0].as_product().unwrap().current_stock, 3);
}

#[test]
fn upsert_rejects_mismatched_partition() {
    let store = ReplicaStore::open_in_memory().unwrap();
    let result = store.upsert_many(EntityType::Product, &[category("c", 1)]);
    assert!(result.is_err());
    assert_eq!(store.count(EntityType::Product).unwrap(), 0);
}

#[test]
fn upsert_rejects_updated_at_beyond_column_range() {
    let store = ReplicaStore::open_in_memory().unwrap();
    let mut far = product("p2", 0, 1);
    far.updated_at = Timestamp::from_millis(u64::MAX);

    let result = store.upsert_many(EntityType::Product, &[product("p1", 1, 1), far]);

    assert!(result.is_err());
    assert_eq!(store.count(EntityType::Product).unwrap(), 0);
}

#[test]
fn get_one_found_and_missing() {
    let store = ReplicaStore::open_in_memory().unwrap();
    store.upsert_many(EntityType::Category, &[category("c1", 1)]).unwrap();

    let found = store.get_one(EntityType::Category, &RecordId::new("c1")).unwrap();
    assert_eq!(found, Some(category("c1", 1)));
    assert!(store.get_one(EntityType::Category, &RecordId::new("nope")).unwrap().is_none());
}

#[test]
fn partitions_are_isolated() {
    let store = ReplicaStore::open_in_memory().unwrap();
    store.upsert_many(EntityType::Product, &[product("x", 1, 1)]).unwrap();
    store.upsert_many(EntityType::Category, &[category("x", 1)]).unwrap();

    assert_eq!(store.count(EntityType::Product).unwrap(), 1);
    assert_eq!(store.count(EntityType::Category).unwrap(), 1);
    assert!(store.get_one(EntityType::Package, &RecordId::new("x")).unwrap().is_none());

    let counts = store.counts().unwrap();
    assert_eq!(counts.len(), 4);
    assert_eq!(counts[&EntityType::Table], 0);
}

// ── clear ────────────────────────────────────────────────────────

#[test]
fn clear_only_touches_one_partition() {
    let store = ReplicaStore::open_in_memory().unwrap();
    store
        .upsert_many(EntityType::Product, &[product("a", 1, 1), product("b", 2, 1)])
        .unwrap();
    store.upsert_many(EntityType::Category, &[category("c", 1)]).unwrap();

    assert_eq!(store.clear(EntityType::Product).unwrap(), 2);
    assert!(store.get_all(EntityType::Product).unwrap().is_empty());
    assert_eq!(store.count(EntityType::Category).unwrap(), 1);
}

// ── adjust_stock ─────────────────────────────────────────────────

#[test]
fn adjust_stock_patches_current_stock_only() {
    let store = ReplicaStore::open_in_memory().unwrap();
    store.upsert_many(EntityType::Product, &[product("p", 50, 10)]).unwrap();

    let adjusted = store.adjust_stock(&RecordId::new("p"), -1).unwrap();
    assert_eq!(adjusted, Some(9));

    let record = store.get_one(EntityType::Product, &RecordId::new("p")).unwrap().unwrap();
    assert_eq!(record.updated_at, Timestamp::from_millis(50));
    assert_eq!(record.as_product().unwrap().current_stock, 9);
    assert_eq!(record.as_product().unwrap().name, "Product p");
}

#[test]
fn adjust_stock_unknown_product() {
    let store = ReplicaStore::open_in_memory().unwrap();
    assert_eq!(store.adjust_stock(&RecordId::new("ghost"), -1).unwrap(), None);
}

// ── Durability ───────────────────────────────────────────────────

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    {
        let store = ReplicaStore::open(&path).unwrap();
        store.upsert_many(EntityType::Table, &[
            EntityRecord::from_json(
                EntityType::Table,
                serde_json::json!({"id": "t1", "updated_at": 3, "name": "Patio 1", "seats": 4}),
            )
            .unwrap(),
        ])
        .unwrap();
    }

    let store = ReplicaStore::open(&path).unwrap();
    let tables = store.get_all(EntityType::Table).unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].payload.name(), "Patio 1");
}

#[test]
fn open_creates_missing_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("replica.db");
    ReplicaStore::open(&path).unwrap();
    assert!(path.exists());
}

// ── Idempotence ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn applying_a_page_twice_equals_applying_it_once(
        rows in prop::collection::vec((0u8..20, 0u64..1_000, -50i64..50), 0..40)
    ) {
        let page: Vec<EntityRecord> = rows
            .iter()
            .map(|(id, ts, stock)| product(&format!("p{id}"), *ts, *stock))
            .collect();

        let once = ReplicaStore::open_in_memory().unwrap();
        once.upsert_many(EntityType::Product, &page).unwrap();

        let twice = ReplicaStore::open_in_memory().unwrap();
        twice.upsert_many(EntityType::Product, &page).unwrap();
        twice.upsert_many(EntityType::Product, &page).unwrap();

        prop_assert_eq!(
            once.get_all(EntityType::Product).unwrap(),
            twice.get_all(EntityType::Product).unwrap()
        );
    }
}
