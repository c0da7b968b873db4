//! Integration tests for the PostgreSQL durable store.
//!
//! These tests require a running PostgreSQL database and the `DATABASE_URL`
//! environment variable to be set. Run with:
//!
//! ```bash
//! DATABASE_URL="postgresql://..." cargo test -p loom-engine --test postgres -- --ignored --nocapture
//! ```

use std::collections::BTreeMap;

use serde_json::json;
use sqlx::PgPool;

use loom_common::types::{DynamicContract, pack_event_id};
use loom_engine::durable::{CommitBatch, DurableStore, RawEventRow};
use loom_engine::postgres::PgStore;

async fn setup(pool: &PgPool) -> PgStore {
    sqlx::migrate!("../../migrations").run(pool).await.unwrap();

    for table in ["entities", "raw_events", "dynamic_contracts", "indexer_state"] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(pool)
            .await
            .unwrap();
    }

    PgStore::new(pool.clone())
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL — run explicitly with --ignored
async fn apply_upserts_and_reads_back(pool: PgPool) {
    let store = setup(&pool).await;

    let mut batch = CommitBatch::default();
    batch.entity_upserts.insert(
        "Account".into(),
        vec![
            ("0xAAA".into(), json!({"id": "0xAAA", "balance": "2"})),
            ("0xBBB".into(), json!({"id": "0xBBB", "balance": "3"})),
        ],
    );
    store.apply(&batch).await.unwrap();

    let rows = store
        .batch_read("Account", &["0xAAA".into(), "0xBBB".into(), "0xCCC".into()])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2, "missing ids are absent, not errors");

    // Upsert overwrites in place.
    let mut update = CommitBatch::default();
    update.entity_upserts.insert(
        "Account".into(),
        vec![("0xAAA".into(), json!({"id": "0xAAA", "balance": "7"}))],
    );
    store.apply(&update).await.unwrap();
    let rows = store.batch_read("Account", &["0xAAA".into()]).await.unwrap();
    assert_eq!(rows[0]["balance"], "7");
}

#[sqlx::test]
#[ignore]
async fn apply_deletes_before_upserts(pool: PgPool) {
    let store = setup(&pool).await;

    let mut seed = CommitBatch::default();
    seed.entity_upserts.insert(
        "Gravatar".into(),
        vec![("1001".into(), json!({"id": "1001", "updatesCount": 1}))],
    );
    store.apply(&seed).await.unwrap();

    let mut batch = CommitBatch::default();
    batch
        .entity_deletes
        .insert("Gravatar".into(), vec!["1001".into()]);
    store.apply(&batch).await.unwrap();

    let rows = store.batch_read("Gravatar", &["1001".into()]).await.unwrap();
    assert!(rows.is_empty());
}

#[sqlx::test]
#[ignore]
async fn checkpoint_is_monotone(pool: PgPool) {
    let store = setup(&pool).await;

    for to_block in [100u64, 90, 120] {
        let mut batch = CommitBatch::default();
        batch.checkpoints = BTreeMap::from([(7u64, to_block)]);
        store.apply(&batch).await.unwrap();
    }

    assert_eq!(store.latest_processed_block(7).await.unwrap(), Some(120));
    assert_eq!(store.latest_processed_block(8).await.unwrap(), None);
}

#[sqlx::test]
#[ignore]
async fn raw_events_and_dynamic_contracts_round_trip(pool: PgPool) {
    let store = setup(&pool).await;

    let mut batch = CommitBatch::default();
    batch.raw_events.push(RawEventRow {
        chain_id: 1,
        event_id: pack_event_id(500, 0),
        block_number: 500,
        data: json!({"event_name": "NftCreated"}),
    });
    batch.dynamic_contracts.push(DynamicContract {
        chain_id: 1,
        address: "0x4e4e".into(),
        contract_type: "Nft".into(),
        registering_event_id: pack_event_id(500, 0),
    });
    store.apply(&batch).await.unwrap();

    // Idempotent on re-apply (retry after a connection loss).
    store.apply(&batch).await.unwrap();

    let contracts = store.dynamic_contracts().await.unwrap();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0].address, "0x4e4e");
    assert_eq!(contracts[0].registering_block(), 500);

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM raw_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 1);
}
