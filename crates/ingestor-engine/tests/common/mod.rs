//! Shared fixtures for ingestor integration tests
//!
//! Memory-store helpers are used by every test file. [`TestPostgres`] spins up a
//! throwaway PostgreSQL container and needs Docker, so tests using it are `#[ignore]`d.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ingestor_engine::store::MemoryTable;
use ingestor_engine::{MemoryStore, PipelineConfig, Record, Schema};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

pub const TABLE: &str = "scans";

/// Install a test subscriber once; safe to call from every test
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ingestor_engine=debug")
        .with_test_writer()
        .try_init();
}

/// `scans(user, fNumber, time)`
pub fn scans_schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder(TABLE)
            .column("user")
            .column("fNumber")
            .column("time")
            .build()
            .expect("valid schema"),
    )
}

/// Memory store whose `scans` table rejects a missing `user`
pub fn strict_store() -> MemoryStore {
    MemoryStore::new().with_table(
        TABLE,
        MemoryTable::new(["user", "fNumber", "time"]).not_null("user"),
    )
}

/// A flat record identified by `n`
pub fn scan(n: usize) -> Record {
    Record::new()
        .with_scalar("user", format!("user-{}", n))
        .with_scalar("time", format!("2024-01-01T00:00:{:02}", n % 60))
}

/// A record with one collection of `count` fNumber elements
pub fn scan_with_fnumbers(user: &str, count: usize) -> Record {
    let elements = (0..count)
        .map(|i| {
            Record::new()
                .with_scalar("fNumber", format!("F{}", i))
                .with_scalar("time", format!("t{}", i))
        })
        .collect();
    Record::new()
        .with_scalar("user", user)
        .with_collection("fnumbers", elements)
}

pub fn scans(n: usize) -> Vec<Record> {
    (0..n).map(scan).collect()
}

pub fn config(workers: usize) -> PipelineConfig {
    PipelineConfig {
        workers,
        ..PipelineConfig::default()
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with a connected pool
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Create the `scans` table used by the fixtures
    pub async fn create_scans_table(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE scans (
                id BIGSERIAL PRIMARY KEY,
                "user" TEXT NOT NULL,
                "fNumber" TEXT,
                "time" TEXT
            )"#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create scans table")?;
        Ok(())
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .context("Failed to count rows")?;
        Ok(count)
    }
}
