//! Per-run counters shared by the dispatcher and workers

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RunMetrics {
    records_dispatched: AtomicU64,
    batches_dispatched: AtomicU64,
    records_processed: AtomicU64,
    rows_flattened: AtomicU64,
    rows_inserted: AtomicU64,
    fields_dropped: AtomicU64,
    statements_executed: AtomicU64,
}

/// Point-in-time copy of [`RunMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub records_dispatched: u64,
    pub batches_dispatched: u64,
    pub records_processed: u64,
    pub rows_flattened: u64,
    /// Rows executed inside transactions; durable only if the run committed
    pub rows_inserted: u64,
    pub fields_dropped: u64,
    pub statements_executed: u64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, records: usize) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.records_dispatched
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_processed(&self, rows: usize, dropped_fields: usize) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
        self.rows_flattened.fetch_add(rows as u64, Ordering::Relaxed);
        self.fields_dropped
            .fetch_add(dropped_fields as u64, Ordering::Relaxed);
    }

    pub fn record_statement(&self, rows_affected: u64) {
        self.statements_executed.fetch_add(1, Ordering::Relaxed);
        self.rows_inserted.fetch_add(rows_affected, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_dispatched: self.records_dispatched.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            rows_flattened: self.rows_flattened.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            fields_dropped: self.fields_dropped.load(Ordering::Relaxed),
            statements_executed: self.statements_executed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_counters_from_many_tasks() {
        let metrics = Arc::new(RunMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        metrics.record_processed(2, 1);
                        metrics.record_statement(2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_processed, 800);
        assert_eq!(snapshot.rows_flattened, 1600);
        assert_eq!(snapshot.rows_inserted, 1600);
        assert_eq!(snapshot.fields_dropped, 800);
        assert_eq!(snapshot.statements_executed, 800);
    }
}
