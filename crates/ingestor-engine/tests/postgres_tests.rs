//! Runs against a real PostgreSQL instance
//!
//! These tests require Docker. Run with:
//!
//! ```bash
//! cargo test -p ingestor-engine --test postgres_tests -- --ignored --nocapture
//! ```

mod common;

use std::sync::Arc;

use common::{config, init_test_tracing, scan, scan_with_fnumbers, scans, scans_schema, TestPostgres, TABLE};
use ingestor_engine::error::RowError;
use ingestor_engine::store::DbConfig;
use ingestor_engine::{Decision, IngestError, IngestPipeline, PgStore, Record, Schema, StoreError};
use serial_test::serial;

async fn setup() -> (TestPostgres, PgStore) {
    init_test_tracing();
    let pg = TestPostgres::start()
        .await
        .expect("Failed to start PostgreSQL container");
    pg.create_scans_table()
        .await
        .expect("Failed to create table");
    let store = PgStore::new(pg.pool_clone());
    (pg, store)
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_committed_run_is_visible() {
    let (pg, store) = setup().await;
    let mut records = scans(8);
    records.push(scan_with_fnumbers("carol", 3));

    let result = IngestPipeline::new(Arc::new(store), scans_schema(), config(3))
        .run_bulk(records)
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.rows_committed(), 11);
    assert_eq!(pg.count(TABLE).await.unwrap(), 11);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_constraint_violation_rolls_back_every_worker() {
    let (pg, store) = setup().await;
    let mut records = scans(12);
    records[7] = Record::new().with_scalar("time", "no user");

    let result = IngestPipeline::new(Arc::new(store), scans_schema(), config(4))
        .run_bulk(records)
        .await
        .unwrap();

    assert_eq!(result.decision, Some(Decision::Rollback));
    assert!(matches!(
        result.error(),
        Some(IngestError::Row {
            record_index: 7,
            source: RowError::Store(StoreError::Database(_)),
            ..
        })
    ));
    assert_eq!(pg.count(TABLE).await.unwrap(), 0);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_hostile_values_are_stored_verbatim() {
    let (pg, store) = setup().await;
    let hostile = "x'); DROP TABLE scans; --";
    let records = vec![scan(1).with_scalar("user", hostile)];

    let result = IngestPipeline::new(Arc::new(store), scans_schema(), config(1))
        .run_bulk(records)
        .await
        .unwrap();

    assert!(result.success());
    let (user,): (String,) = sqlx::query_as(r#"SELECT "user" FROM scans"#)
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(user, hostile);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_typed_column_cast_and_nulls() {
    let (pg, _) = setup().await;
    sqlx::query("CREATE TABLE readings (sensor TEXT NOT NULL, value BIGINT, note TEXT)")
        .execute(pg.pool())
        .await
        .unwrap();

    let schema = Arc::new(
        Schema::builder("readings")
            .column("sensor")
            .column("value")
            .cast("bigint")
            .column("note")
            .build()
            .unwrap(),
    );
    let records = vec![
        Record::new().with_scalar("sensor", "a").with_scalar("value", "42"),
        Record::new()
            .with_scalar("sensor", "b")
            .with_scalar("value", ingestor_engine::Scalar::Null)
            .with_scalar("note", "missing"),
    ];

    let store = PgStore::connect(&DbConfig {
        url: pg.connection_string().to_string(),
        ..DbConfig::default()
    })
    .await
    .unwrap();
    let result = IngestPipeline::new(Arc::new(store), schema, config(2))
        .run_bulk(records)
        .await
        .unwrap();

    assert!(result.success());
    let (total,): (Option<i64>,) = sqlx::query_as("SELECT SUM(value)::BIGINT FROM readings")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(total, Some(42));
}
