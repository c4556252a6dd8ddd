//! Ingestor Engine
//!
//! Transactional batch ingestion of nested records into a relational table.
//!
//! # Architecture
//!
//! ```text
//! RecordSource ─▶ Dispatcher ─▶ bounded queue (W) ─▶ Worker × W ─▶ TransactionCoordinator
//!                                                    flatten → INSERT    commit all | rollback all
//! ```
//!
//! - **Dispatcher** ([`dispatch`]): partitions records into contiguous batches, in bulk
//!   (`ceil(N/W)` per batch) or streaming (fixed threshold) mode, with backpressure
//! - **Worker** ([`worker`]): owns one transaction for the whole run, fails fast
//! - **Flattener** ([`flatten`]): expands nested collections into schema-filtered rows
//! - **SQL generator** ([`sql`]): parameterized multi-row INSERTs, values always bound
//! - **Coordinator** ([`coordinator`]): the barrier deciding commit-all or rollback-all
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ingestor_engine::{IngestPipeline, MemoryStore, PipelineConfig, Record, Schema};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let schema = Arc::new(Schema::builder("scans").column("user").column("fNumber").build()?);
//!     let store = MemoryStore::for_schema(&schema);
//!
//!     let records = vec![Record::new().with_scalar("user", "alice")];
//!     let result = IngestPipeline::new(Arc::new(store), schema, PipelineConfig::default())
//!         .run_bulk(records)
//!         .await?;
//!
//!     assert!(result.success());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod flatten;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod schema;
pub mod source;
pub mod sql;
pub mod store;
pub mod worker;

pub use config::{IngestConfig, IngestMode, PipelineConfig};
pub use coordinator::{Decision, TransactionCoordinator};
pub use error::{IngestError, IngestResult, SourceError, StoreError};
pub use pipeline::{IngestPipeline, RunPhase, RunResult, RunSummary};
pub use record::{FieldValue, Record, Scalar};
pub use schema::Schema;
pub use source::{open_file, RecordSource};
pub use store::{MemoryStore, PgStore, Store, Transaction};
