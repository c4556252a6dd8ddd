//! Map-stage worker
//!
//! A worker opens one transaction when it starts and keeps it until the barrier. It
//! pulls batches until the queue closes, flattening each record and executing its
//! INSERTs inside that transaction. The first failure stops the worker; the
//! transaction is handed to the coordinator either way.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::dispatch::{Batch, BatchQueue};
use crate::error::{IngestError, RowError};
use crate::flatten::Flattener;
use crate::metrics::RunMetrics;
use crate::schema::Schema;
use crate::sql::InsertBuilder;
use crate::store::{Store, Transaction};

/// What one worker did before it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches: usize,
    pub records: usize,
    pub rows_inserted: u64,
    pub statements: usize,
}

/// Exactly one per worker, consumed by the coordinator
pub struct WorkerResult {
    pub worker_id: usize,
    pub error: Option<IngestError>,
    /// `None` only if the worker never obtained a transaction
    pub transaction: Option<Box<dyn Transaction>>,
    pub stats: WorkerStats,
}

impl WorkerResult {
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.transaction.is_some()
    }
}

impl fmt::Debug for WorkerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerResult")
            .field("worker_id", &self.worker_id)
            .field("error", &self.error)
            .field("has_transaction", &self.transaction.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

pub struct Worker {
    id: usize,
    store: Arc<dyn Store>,
    schema: Arc<Schema>,
    queue: BatchQueue,
    metrics: Arc<RunMetrics>,
    cancel: CancellationToken,
    abort_on_failure: bool,
}

impl Worker {
    pub fn new(
        id: usize,
        store: Arc<dyn Store>,
        schema: Arc<Schema>,
        queue: BatchQueue,
        metrics: Arc<RunMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            store,
            schema,
            queue,
            metrics,
            cancel,
            abort_on_failure: false,
        }
    }

    /// Cancel the whole run when this worker fails
    pub fn abort_on_failure(mut self, enabled: bool) -> Self {
        self.abort_on_failure = enabled;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub async fn run(self) -> WorkerResult {
        let mut transaction = match self.store.begin().await {
            Ok(transaction) => transaction,
            Err(source) => {
                error!(worker_id = self.id, error = %source, "Worker could not open a transaction");
                self.signal_failure();
                return WorkerResult {
                    worker_id: self.id,
                    error: Some(IngestError::TransactionOpen {
                        worker_id: self.id,
                        source,
                    }),
                    transaction: None,
                    stats: WorkerStats::default(),
                };
            }
        };
        debug!(worker_id = self.id, store = self.store.name(), "Worker transaction opened");

        let mut stats = WorkerStats::default();
        let error = self.drain(transaction.as_mut(), &mut stats).await.err();

        match &error {
            None => info!(
                worker_id = self.id,
                batches = stats.batches,
                records = stats.records,
                rows = stats.rows_inserted,
                "Worker finished"
            ),
            Some(err) => {
                error!(
                    worker_id = self.id,
                    batches = stats.batches,
                    error = %err,
                    "Worker stopped on failure"
                );
                self.signal_failure();
            }
        }

        WorkerResult {
            worker_id: self.id,
            error,
            transaction: Some(transaction),
            stats,
        }
    }

    fn signal_failure(&self) {
        if self.abort_on_failure && !self.cancel.is_cancelled() {
            debug!(worker_id = self.id, "Cancelling run after worker failure");
            self.cancel.cancel();
        }
    }

    async fn drain(
        &self,
        transaction: &mut dyn Transaction,
        stats: &mut WorkerStats,
    ) -> Result<(), IngestError> {
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(IngestError::Cancelled { worker_id: self.id });
                }
                batch = self.queue.next() => batch,
            };

            let Some(batch) = batch else {
                return Ok(());
            };

            self.process_batch(transaction, &batch, stats).await?;
            stats.batches += 1;
        }
    }

    async fn process_batch(
        &self,
        transaction: &mut dyn Transaction,
        batch: &Batch,
        stats: &mut WorkerStats,
    ) -> Result<(), IngestError> {
        let flattener = Flattener::new(&self.schema);
        let builder = InsertBuilder::new(&self.schema);
        trace!(worker_id = self.id, batch_id = batch.id, records = batch.len(), "Processing batch");

        for (offset, record) in batch.records.iter().enumerate() {
            let record_index = batch.first_index + offset;
            let row_error = |source: RowError| IngestError::Row {
                worker_id: self.id,
                batch_id: batch.id,
                record_index,
                source,
            };

            let flattened = flattener.flatten(record);
            self.metrics
                .record_processed(flattened.rows.len(), flattened.dropped.len());
            if !flattened.dropped.is_empty() {
                trace!(
                    worker_id = self.id,
                    record_index,
                    dropped = ?flattened.dropped,
                    "Fields outside the schema dropped"
                );
            }

            let statements = builder
                .build_all(&flattened.rows)
                .map_err(|err| row_error(err.into()))?;

            for statement in &statements {
                let executed = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        return Err(IngestError::Cancelled { worker_id: self.id });
                    }
                    executed = transaction.exec(statement) => executed,
                };

                let affected = executed.map_err(|err| row_error(err.into()))?;
                self.metrics.record_statement(affected);
                stats.rows_inserted += affected;
                stats.statements += 1;
            }

            stats.records += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dispatch::{batch_queue, partition};
    use crate::record::{Record, Scalar};
    use crate::store::{MemoryStore, MemoryTable};

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::builder("scans").column("user").column("fNumber").build().unwrap())
    }

    fn worker(store: &MemoryStore, queue: BatchQueue, cancel: CancellationToken) -> Worker {
        Worker::new(
            0,
            Arc::new(store.clone()),
            schema(),
            queue,
            Arc::new(RunMetrics::new()),
            cancel,
        )
    }

    #[tokio::test]
    async fn test_worker_inserts_inside_its_transaction() {
        let store = MemoryStore::for_schema(&schema());
        let (tx, queue) = batch_queue(4);
        let records = vec![
            Record::new().with_scalar("user", "a"),
            Record::new().with_scalar("user", "b").with_collection(
                "fnumbers",
                vec![
                    Record::new().with_scalar("fNumber", "1"),
                    Record::new().with_scalar("fNumber", "2"),
                ],
            ),
        ];
        for batch in partition(records, 1) {
            tx.send(batch).await.unwrap();
        }
        drop(tx);

        let result = worker(&store, queue, CancellationToken::new()).run().await;

        assert!(result.is_clean());
        assert_eq!(
            result.stats,
            WorkerStats {
                batches: 2,
                records: 2,
                rows_inserted: 3,
                statements: 2,
            }
        );
        assert_eq!(store.row_count("scans"), 0);

        result.transaction.unwrap().commit().await.unwrap();
        assert_eq!(store.row_count("scans"), 3);
    }

    #[tokio::test]
    async fn test_worker_stops_at_first_row_error() {
        let store = MemoryStore::new().with_table(
            "scans",
            MemoryTable::new(["fNumber"]).not_null("user"),
        );
        let (tx, queue) = batch_queue(4);
        let records = vec![
            Record::new().with_scalar("user", "a"),
            Record::new().with_scalar("user", Scalar::Null),
            Record::new().with_scalar("user", "c"),
        ];
        for batch in partition(records, 1) {
            tx.send(batch).await.unwrap();
        }
        drop(tx);

        let remaining = queue.clone();
        let result = worker(&store, queue, CancellationToken::new()).run().await;

        match &result.error {
            Some(IngestError::Row { batch_id, record_index, .. }) => {
                assert_eq!(*batch_id, 1);
                assert_eq!(*record_index, 1);
            }
            other => panic!("expected row error, got {:?}", other),
        }
        assert!(result.transaction.is_some());
        assert_eq!(result.stats.batches, 1);
        // The third batch was never pulled.
        assert!(remaining.next().await.is_some());
    }

    #[tokio::test]
    async fn test_worker_without_transaction() {
        let store = MemoryStore::for_schema(&schema());
        store.fail_next_begins(1);
        let (_tx, queue) = batch_queue(1);
        let cancel = CancellationToken::new();

        let result = worker(&store, queue, cancel.clone())
            .abort_on_failure(true)
            .run()
            .await;

        assert!(matches!(result.error, Some(IngestError::TransactionOpen { .. })));
        assert!(result.transaction.is_none());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_worker_observes_cancellation() {
        let store = MemoryStore::for_schema(&schema());
        let (_tx, queue) = batch_queue(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = worker(&store, queue, cancel).run().await;

        assert!(matches!(result.error, Some(IngestError::Cancelled { worker_id: 0 })));
        assert!(result.transaction.is_some());
    }
}
