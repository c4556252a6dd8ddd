//! Batch partitioning and the bounded dispatch queue
//!
//! Batches are emitted in record arrival order onto a queue holding at most one batch
//! per worker. A full queue suspends the dispatcher until a worker pulls, which is the
//! only backpressure in the system.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::metrics::RunMetrics;
use crate::record::Record;
use crate::source::RecordStream;

/// A contiguous group of records handled by one worker inside its transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: usize,
    /// Input position of the first record
    pub first_index: usize,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Input positions covered by this batch
    pub fn indices(&self) -> std::ops::Range<usize> {
        self.first_index..self.first_index + self.records.len()
    }
}

/// Bulk batch size: `ceil(records / workers)`, never below one
pub fn bulk_batch_size(records: usize, workers: usize) -> usize {
    records.div_ceil(workers.max(1)).max(1)
}

/// Split `records` into contiguous batches of `size` (the last may be shorter)
pub fn partition(records: Vec<Record>, size: usize) -> Vec<Batch> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(records.len().div_ceil(size));
    let mut records = records.into_iter().peekable();
    let mut first_index = 0;

    while records.peek().is_some() {
        let chunk: Vec<Record> = records.by_ref().take(size).collect();
        let len = chunk.len();
        batches.push(Batch {
            id: batches.len(),
            first_index,
            records: chunk,
        });
        first_index += len;
    }

    batches
}

/// Receiving side of the dispatch queue, shared by every worker
#[derive(Debug, Clone)]
pub struct BatchQueue {
    rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
}

impl BatchQueue {
    /// Next batch, or `None` once the dispatcher is done and the queue is drained
    pub async fn next(&self) -> Option<Batch> {
        self.rx.lock().await.recv().await
    }
}

/// Bounded queue of `capacity` batches
pub fn batch_queue(capacity: usize) -> (mpsc::Sender<Batch>, BatchQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        tx,
        BatchQueue {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// What the dispatcher emitted before the queue closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub batches: usize,
    pub records: usize,
}

/// Feeds batches into the dispatch queue
///
/// The queue stays open until the dispatcher is closed or dropped. Its summary keeps
/// counting what was handed out even when a dispatch method fails.
pub struct Dispatcher {
    tx: mpsc::Sender<Batch>,
    metrics: Arc<RunMetrics>,
    cancel: CancellationToken,
    summary: DispatchSummary,
}

impl Dispatcher {
    pub fn new(tx: mpsc::Sender<Batch>, metrics: Arc<RunMetrics>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            metrics,
            cancel,
            summary: DispatchSummary::default(),
        }
    }

    /// Batches and records handed to workers so far
    pub fn summary(&self) -> DispatchSummary {
        self.summary
    }

    /// Close the queue so workers drain and stop, returning the final summary
    pub fn close(self) -> DispatchSummary {
        self.summary
    }

    /// Emit a materialized record set as `ceil(N/W)`-sized batches
    pub async fn dispatch_bulk(
        &mut self,
        records: Vec<Record>,
        workers: usize,
    ) -> Result<DispatchSummary, DispatchError> {
        let size = bulk_batch_size(records.len(), workers);
        debug!(records = records.len(), workers, batch_size = size, "Dispatching in bulk mode");

        for batch in partition(records, size) {
            self.emit(batch).await?;
        }

        Ok(self.summary)
    }

    /// Emit a lazy record stream in batches of `threshold`, flushing the remainder at the end
    pub async fn dispatch_stream(
        &mut self,
        mut stream: RecordStream,
        threshold: usize,
    ) -> Result<DispatchSummary, DispatchError> {
        let threshold = threshold.max(1);
        let mut buffer = Vec::with_capacity(threshold);
        debug!(threshold, "Dispatching in streaming mode");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DispatchError::Cancelled),
                next = stream.next() => next,
            };

            match next {
                Ok(Some(record)) => {
                    buffer.push(record);
                    if buffer.len() >= threshold {
                        let records = std::mem::replace(&mut buffer, Vec::with_capacity(threshold));
                        self.emit_records(records).await?;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        error = %err,
                        buffered = buffer.len(),
                        "Record source failed, aborting dispatch"
                    );
                    return Err(DispatchError::Source(err));
                }
            }
        }

        if !buffer.is_empty() {
            self.emit_records(buffer).await?;
        }

        Ok(self.summary)
    }

    async fn emit_records(&mut self, records: Vec<Record>) -> Result<(), DispatchError> {
        let batch = Batch {
            id: self.summary.batches,
            first_index: self.summary.records,
            records,
        };
        self.emit(batch).await
    }

    async fn emit(&mut self, batch: Batch) -> Result<(), DispatchError> {
        let batch_id = batch.id;
        let len = batch.len();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DispatchError::Cancelled),
            sent = self.tx.send(batch) => {
                if sent.is_err() {
                    return Err(DispatchError::QueueClosed { batch_id });
                }
            }
        }

        self.metrics.record_batch(len);
        self.summary.batches += 1;
        self.summary.records += len;
        debug!(batch_id, records = len, "Batch dispatched");
        Ok(())
    }
}
