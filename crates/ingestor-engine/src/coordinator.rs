//! Commit-all-or-rollback-all barrier
//!
//! Runs once every worker has finished. If the map stage was clean (no upstream
//! failure, every worker error-free and holding a transaction) all transactions are
//! committed; otherwise every transaction that exists is rolled back, including those
//! of workers that did nothing wrong. Finalization is attempted on every transaction
//! regardless of earlier finalization failures.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::IngestError;
use crate::worker::{WorkerResult, WorkerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Commit,
    Rollback,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Commit => "commit",
            Decision::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A worker that ended with an error or without a transaction
#[derive(Debug)]
pub struct WorkerFailure {
    pub worker_id: usize,
    pub error: IngestError,
    /// Batches the worker finished before failing
    pub batches_completed: usize,
}

/// What the barrier decided and what actually happened to each transaction
#[derive(Debug)]
pub struct BarrierReport {
    pub decision: Decision,
    pub worker_failures: Vec<WorkerFailure>,
    /// Workers whose transaction finalized as decided
    pub finalized: Vec<usize>,
    /// Commit or rollback failures, in worker order
    pub finalization_errors: Vec<IngestError>,
    pub worker_stats: Vec<(usize, WorkerStats)>,
}

impl BarrierReport {
    /// Some transactions committed while others did not, so the store holds part of
    /// the run. Rollback failures also leave the store state unknown.
    pub fn partial_durability(&self) -> bool {
        match self.decision {
            Decision::Commit => !self.finalization_errors.is_empty() && !self.finalized.is_empty(),
            Decision::Rollback => !self.finalization_errors.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionCoordinator;

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Commit only if nothing upstream failed and every worker is clean
    pub fn decide(results: &[WorkerResult], upstream_failed: bool) -> Decision {
        if upstream_failed || results.is_empty() || !results.iter().all(WorkerResult::is_clean) {
            Decision::Rollback
        } else {
            Decision::Commit
        }
    }

    /// Apply the barrier decision to every transaction, in ascending worker order
    pub async fn finalize(&self, mut results: Vec<WorkerResult>, upstream_failed: bool) -> BarrierReport {
        results.sort_by_key(|result| result.worker_id);
        let decision = Self::decide(&results, upstream_failed);

        info!(
            decision = %decision,
            workers = results.len(),
            upstream_failed,
            "Barrier reached"
        );

        let mut report = BarrierReport {
            decision,
            worker_failures: Vec::new(),
            finalized: Vec::new(),
            finalization_errors: Vec::new(),
            worker_stats: Vec::with_capacity(results.len()),
        };

        for result in results {
            let worker_id = result.worker_id;
            report.worker_stats.push((worker_id, result.stats));

            if let Some(error) = result.error {
                report.worker_failures.push(WorkerFailure {
                    worker_id,
                    error,
                    batches_completed: result.stats.batches,
                });
            }

            let Some(transaction) = result.transaction else {
                continue;
            };

            let outcome = match decision {
                Decision::Commit => transaction
                    .commit()
                    .await
                    .map_err(|source| IngestError::Commit { worker_id, source }),
                Decision::Rollback => transaction
                    .rollback()
                    .await
                    .map_err(|source| IngestError::Rollback { worker_id, source }),
            };

            match outcome {
                Ok(()) => report.finalized.push(worker_id),
                Err(err) => {
                    error!(worker_id, decision = %decision, error = %err, "Transaction finalization failed");
                    report.finalization_errors.push(err);
                }
            }
        }

        if report.partial_durability() {
            error!(
                decision = %decision,
                finalized = ?report.finalized,
                failed = report.finalization_errors.len(),
                "Store state is partially finalized; inspect the target table before resubmitting"
            );
        } else if decision == Decision::Rollback {
            warn!(
                rolled_back = report.finalized.len(),
                failed_workers = report.worker_failures.len(),
                "Run rolled back"
            );
        }

        report
    }
}
