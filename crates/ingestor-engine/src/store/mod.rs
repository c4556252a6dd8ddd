//! Relational store boundary
//!
//! A [`Store`] hands out [`Transaction`]s. Each worker owns exactly one transaction for
//! the whole run; only the coordinator finalizes it. Finalization consumes the
//! transaction, so it can happen at most once.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::sql::InsertStatement;

pub use memory::{MemoryStore, MemoryStoreStats, MemoryTable, StoredRow};
pub use postgres::{create_pool, DbConfig, PgStore};

/// Source of transactions
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a new transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// One open transaction
#[async_trait]
pub trait Transaction: Send {
    /// Execute a parameterized INSERT, returning the number of affected rows
    async fn exec(&mut self, statement: &InsertStatement) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
