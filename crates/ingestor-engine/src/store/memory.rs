//! In-process store for dry runs and tests
//!
//! Tables are declared up front with their columns and NOT NULL constraints. Rows
//! inserted by a transaction stay staged inside it and only become visible in the
//! table after commit; rollback discards them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{Store, Transaction};
use crate::error::StoreError;
use crate::record::Scalar;
use crate::schema::Schema;
use crate::sql::InsertStatement;

/// One committed row, keyed by column
pub type StoredRow = BTreeMap<String, Scalar>;

/// Column definition and committed contents of one table
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    columns: BTreeSet<String>,
    not_null: BTreeSet<String>,
    rows: Vec<StoredRow>,
}

impl MemoryTable {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Mark a column NOT NULL
    pub fn not_null(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.columns.insert(column.clone());
        self.not_null.insert(column);
        self
    }

    pub fn rows(&self) -> &[StoredRow] {
        &self.rows
    }

    fn check(&self, table: &str, row: &StoredRow) -> Result<(), StoreError> {
        if let Some(column) = row.keys().find(|column| !self.columns.contains(*column)) {
            return Err(StoreError::UnknownColumn {
                table: table.to_string(),
                column: column.clone(),
            });
        }

        for column in &self.not_null {
            if row.get(column).map_or(true, Scalar::is_null) {
                return Err(StoreError::NotNull {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Counters of store activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub statements: usize,
}

#[derive(Debug, Default)]
struct Faults {
    failing_begins: usize,
    failing_commits: HashSet<usize>,
    exec_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: Mutex<HashMap<String, MemoryTable>>,
    faults: Mutex<Faults>,
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    statements: AtomicUsize,
    commit_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
}

/// Cloneable handle to a shared in-memory database
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with one nullable table covering every column of `schema`
    pub fn for_schema(schema: &Schema) -> Self {
        let store = Self::new();
        store.define_table(
            schema.table(),
            MemoryTable::new(schema.columns().iter().map(|mapping| mapping.column.clone())),
        );
        store
    }

    /// Declare (or replace) a table
    pub fn define_table(&self, name: impl Into<String>, table: MemoryTable) {
        if let Ok(mut tables) = self.inner.tables.lock() {
            tables.insert(name.into(), table);
        }
    }

    /// Builder form of [`define_table`](Self::define_table)
    pub fn with_table(self, name: impl Into<String>, table: MemoryTable) -> Self {
        self.define_table(name, table);
        self
    }

    /// Make the next `count` calls to `begin` fail
    pub fn fail_next_begins(&self, count: usize) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.failing_begins = count;
        }
    }

    /// Make the `nth` commit call (1-based, counted across all transactions) fail
    pub fn fail_commit_call(&self, nth: usize) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.failing_commits.insert(nth);
        }
    }

    /// Sleep this long inside every `exec`
    pub fn set_exec_delay(&self, delay: Duration) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.exec_delay = Some(delay);
        }
    }

    /// Committed rows of `table`; empty if the table is unknown
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.inner
            .tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(table).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            begun: self.inner.begun.load(Ordering::SeqCst),
            committed: self.inner.committed.load(Ordering::SeqCst),
            rolled_back: self.inner.rolled_back.load(Ordering::SeqCst),
            statements: self.inner.statements.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        {
            let mut faults = lock(&self.inner.faults)?;
            if faults.failing_begins > 0 {
                faults.failing_begins -= 1;
                return Err(StoreError::Unavailable(
                    "connection refused (injected)".to_string(),
                ));
            }
        }

        self.inner.begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    staged: Vec<(String, StoredRow)>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn exec(&mut self, statement: &InsertStatement) -> Result<u64, StoreError> {
        let delay = lock(&self.inner.faults)?.exec_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let width = statement.columns.len();
        if width == 0 || statement.values.len() != width * statement.row_count {
            return Err(StoreError::Unavailable(format!(
                "statement binds {} values for {} rows of {} columns",
                statement.values.len(),
                statement.row_count,
                width
            )));
        }

        let rows: Vec<StoredRow> = statement
            .values
            .chunks(width)
            .map(|values| {
                statement
                    .columns
                    .iter()
                    .cloned()
                    .zip(values.iter().cloned())
                    .collect()
            })
            .collect();

        {
            let tables = lock(&self.inner.tables)?;
            let table = tables
                .get(&statement.table)
                .ok_or_else(|| StoreError::UnknownTable(statement.table.clone()))?;
            for row in &rows {
                table.check(&statement.table, row)?;
            }
        }

        self.inner.statements.fetch_add(1, Ordering::SeqCst);
        let affected = rows.len() as u64;
        self.staged
            .extend(rows.into_iter().map(|row| (statement.table.clone(), row)));
        Ok(affected)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { inner, staged } = *self;

        let call = inner.commit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if lock(&inner.faults)?.failing_commits.contains(&call) {
            return Err(StoreError::Unavailable(format!(
                "commit {} failed (injected)",
                call
            )));
        }

        {
            let mut tables = lock(&inner.tables)?;
            for (name, row) in staged {
                match tables.get_mut(&name) {
                    Some(table) => table.rows.push(row),
                    None => return Err(StoreError::UnknownTable(name)),
                }
            }
        }
        inner.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::flatten::FlattenedRow;
    use crate::sql::InsertBuilder;

    fn schema() -> Schema {
        Schema::builder("people").column("name").column("city").build().unwrap()
    }

    fn statement(schema: &Schema, rows: &[FlattenedRow]) -> InsertStatement {
        InsertBuilder::new(schema).build(rows).unwrap()
    }

    #[tokio::test]
    async fn test_rows_visible_only_after_commit() {
        let schema = schema();
        let store = MemoryStore::for_schema(&schema);
        let mut tx = store.begin().await.unwrap();

        let affected = tx
            .exec(&statement(
                &schema,
                &[
                    FlattenedRow::from_pairs([("name", "ana"), ("city", "Lima")]),
                    FlattenedRow::from_pairs([("name", "bo"), ("city", "Oslo")]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(affected, 2);
        assert_eq!(store.row_count("people"), 0);

        tx.commit().await.unwrap();
        assert_eq!(store.row_count("people"), 2);
        assert_eq!(store.rows("people")[1].get("city"), Some(&Scalar::from("Oslo")));
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_rows() {
        let schema = schema();
        let store = MemoryStore::for_schema(&schema);
        let mut tx = store.begin().await.unwrap();
        tx.exec(&statement(&schema, &[FlattenedRow::from_pairs([("name", "ana")])]))
            .await
            .unwrap();

        tx.rollback().await.unwrap();

        assert_eq!(store.row_count("people"), 0);
        assert_eq!(store.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_not_null_violation() {
        let schema = schema();
        let store = MemoryStore::new().with_table(
            "people",
            MemoryTable::new(["city"]).not_null("name"),
        );
        let mut tx = store.begin().await.unwrap();

        let err = tx
            .exec(&statement(&schema, &[FlattenedRow::from_pairs([("city", "Lima")])]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotNull { ref column, .. } if column == "name"));

        let err = tx
            .exec(&statement(
                &schema,
                &[FlattenedRow::from_pairs([("name", Scalar::Null), ("city", Scalar::from("x"))])],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotNull { .. }));
    }

    #[tokio::test]
    async fn test_unknown_table_and_column() {
        let schema = schema();
        let store = MemoryStore::new().with_table("people", MemoryTable::new(["name"]));
        let mut tx = store.begin().await.unwrap();

        let err = tx
            .exec(&statement(&schema, &[FlattenedRow::from_pairs([("city", "Lima")])]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { .. }));

        let other = Schema::builder("pets").column("name").build().unwrap();
        let err = tx
            .exec(&statement(&other, &[FlattenedRow::from_pairs([("name", "rex")])]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownTable(_)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::for_schema(&schema());
        store.fail_next_begins(1);
        store.fail_commit_call(2);

        assert!(store.begin().await.is_err());
        let first = store.begin().await.unwrap();
        let second = store.begin().await.unwrap();

        assert!(first.commit().await.is_ok());
        assert!(second.commit().await.is_err());
        assert_eq!(
            store.stats(),
            MemoryStoreStats {
                begun: 2,
                committed: 1,
                rolled_back: 0,
                statements: 0,
            }
        );
    }
}
