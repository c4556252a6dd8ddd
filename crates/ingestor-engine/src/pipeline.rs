//! Run orchestration
//!
//! One run walks INIT → DISPATCHING → DRAINING → BARRIER → TERMINAL. Workers start
//! before dispatch so the bounded queue always has consumers. Every failure before the
//! barrier (source, dispatch, worker, cancellation, deadline) ends in the same place:
//! the coordinator rolls back every open transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{IngestMode, PipelineConfig};
use crate::coordinator::{BarrierReport, Decision, TransactionCoordinator, WorkerFailure};
use crate::dispatch::{batch_queue, DispatchSummary, Dispatcher};
use crate::error::{IngestError, IngestResult};
use crate::metrics::{MetricsSnapshot, RunMetrics};
use crate::record::Record;
use crate::schema::Schema;
use crate::source::{spawn_source, RecordSource};
use crate::store::Store;
use crate::worker::{Worker, WorkerResult, WorkerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Dispatching,
    /// Dispatch finished; waiting for every worker to stop
    Draining,
    Barrier,
    Terminal,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Init => "init",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Draining => "draining",
            RunPhase::Barrier => "barrier",
            RunPhase::Terminal => "terminal",
        }
    }
}

/// Which stage a failed run failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Mapping,
    Finalization,
}

/// Aggregate outcome of one run
#[derive(Debug)]
pub struct RunResult {
    pub run_id: Uuid,
    pub table: String,
    pub mode: IngestMode,
    pub workers: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<RunPhase>,
    /// `None` if the run never reached the barrier
    pub decision: Option<Decision>,
    pub dispatch: DispatchSummary,
    /// Source or dispatch failure
    pub upstream_error: Option<IngestError>,
    pub failed_workers: Vec<WorkerFailure>,
    pub finalized: Vec<usize>,
    pub finalization_errors: Vec<IngestError>,
    pub worker_stats: Vec<(usize, WorkerStats)>,
    pub metrics: MetricsSnapshot,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.decision == Some(Decision::Commit) && self.finalization_errors.is_empty()
    }

    pub fn failure_stage(&self) -> Option<FailureStage> {
        if self.success() {
            None
        } else if self.upstream_error.is_some() || !self.failed_workers.is_empty() {
            Some(FailureStage::Mapping)
        } else if !self.finalization_errors.is_empty() {
            Some(FailureStage::Finalization)
        } else {
            Some(FailureStage::Mapping)
        }
    }

    /// The run's error: the map-stage failure if there was one, otherwise the first
    /// finalization failure
    ///
    /// Cancellations and a dispatcher that lost its workers are only reported when
    /// nothing else failed, since another failure usually caused them.
    pub fn error(&self) -> Option<&IngestError> {
        let map_stage = || {
            self.upstream_error
                .iter()
                .chain(self.failed_workers.iter().map(|failure| &failure.error))
        };

        map_stage()
            .find(|err| !err.is_consequence())
            .or_else(|| map_stage().next())
            .or_else(|| self.finalization_errors.first())
    }

    /// Rows made durable by this run
    pub fn rows_committed(&self) -> u64 {
        if self.decision != Some(Decision::Commit) {
            return 0;
        }
        self.worker_stats
            .iter()
            .filter(|(worker_id, _)| self.finalized.contains(worker_id))
            .map(|(_, stats)| stats.rows_inserted)
            .sum()
    }

    /// Some of the run's transactions finalized and others did not
    pub fn partial_durability(&self) -> bool {
        !self.finalization_errors.is_empty()
            && (self.decision == Some(Decision::Rollback) || !self.finalized.is_empty())
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            table: self.table.clone(),
            mode: self.mode,
            workers: self.workers,
            success: self.success(),
            decision: self.decision,
            failure_stage: self.failure_stage(),
            error: self.error().map(ToString::to_string),
            failed_workers: self.failed_workers.iter().map(|f| f.worker_id).collect(),
            finalization_errors: self
                .finalization_errors
                .iter()
                .map(ToString::to_string)
                .collect(),
            partial_durability: self.partial_durability(),
            batches: self.dispatch.batches,
            records: self.dispatch.records,
            rows_committed: self.rows_committed(),
            phases: self.phases.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            metrics: self.metrics,
        }
    }
}

/// Serializable view of a [`RunResult`] for reports and external metrics sinks
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub table: String,
    pub mode: IngestMode,
    pub workers: usize,
    pub success: bool,
    pub decision: Option<Decision>,
    pub failure_stage: Option<FailureStage>,
    pub error: Option<String>,
    pub failed_workers: Vec<usize>,
    pub finalization_errors: Vec<String>,
    pub partial_durability: bool,
    pub batches: usize,
    pub records: usize,
    pub rows_committed: u64,
    pub phases: Vec<RunPhase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
}

enum Feed {
    Records(Vec<Record>),
    Source(Arc<dyn RecordSource>),
}

struct RunState {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    phases: Vec<RunPhase>,
    metrics: Arc<RunMetrics>,
}

impl RunState {
    fn enter(&mut self, phase: RunPhase) {
        info!(run_id = %self.run_id, phase = phase.as_str(), "Run phase");
        self.phases.push(phase);
    }
}

/// Drives one batch ingestion run per call
pub struct IngestPipeline {
    store: Arc<dyn Store>,
    schema: Arc<Schema>,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn Store>, schema: Arc<Schema>, config: PipelineConfig) -> Self {
        Self {
            store,
            schema,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned token; cancelling it aborts the current run
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `source` in the configured mode
    pub async fn run(&self, source: Arc<dyn RecordSource>) -> IngestResult<RunResult> {
        match self.config.mode {
            IngestMode::Bulk => {
                self.config.validate()?;
                let mut state = self.start();
                match source.records().await {
                    Ok(records) => {
                        self.execute(state, Feed::Records(records), IngestMode::Bulk)
                            .await
                    }
                    Err(err) => {
                        error!(
                            run_id = %state.run_id,
                            error = %err,
                            "Record source failed before dispatch"
                        );
                        state.enter(RunPhase::Terminal);
                        Ok(self.finish(
                            state,
                            IngestMode::Bulk,
                            DispatchSummary::default(),
                            Some(IngestError::Source(err)),
                            None,
                        ))
                    }
                }
            }
            IngestMode::Stream => self.run_stream(source).await,
        }
    }

    /// Bulk mode over an already materialized record set
    pub async fn run_bulk(&self, records: Vec<Record>) -> IngestResult<RunResult> {
        self.config.validate()?;
        let state = self.start();
        self.execute(state, Feed::Records(records), IngestMode::Bulk).await
    }

    /// Streaming mode: records are batched as `source` produces them
    pub async fn run_stream(&self, source: Arc<dyn RecordSource>) -> IngestResult<RunResult> {
        self.config.validate()?;
        let state = self.start();
        self.execute(state, Feed::Source(source), IngestMode::Stream).await
    }

    fn start(&self) -> RunState {
        let mut state = RunState {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            phases: Vec::new(),
            metrics: Arc::new(RunMetrics::new()),
        };
        info!(
            run_id = %state.run_id,
            table = self.schema.table(),
            workers = self.config.workers,
            store = self.store.name(),
            "Starting ingestion run"
        );
        state.enter(RunPhase::Init);
        state
    }

    async fn execute(
        &self,
        mut state: RunState,
        feed: Feed,
        mode: IngestMode,
    ) -> IngestResult<RunResult> {
        let span = tracing::info_span!("ingest_run", run_id = %state.run_id);
        let cancel = self.cancel.child_token();
        let deadline = self
            .config
            .timeout
            .map(|timeout| spawn_deadline(timeout, cancel.clone()));

        let workers = self.config.workers;
        let (tx, queue) = batch_queue(workers);
        let handles: Vec<(usize, JoinHandle<WorkerResult>)> = (0..workers)
            .map(|worker_id| {
                let worker = Worker::new(
                    worker_id,
                    Arc::clone(&self.store),
                    Arc::clone(&self.schema),
                    queue.clone(),
                    Arc::clone(&state.metrics),
                    cancel.clone(),
                )
                .abort_on_failure(self.config.abort_on_failure);
                (worker_id, tokio::spawn(worker.run().instrument(span.clone())))
            })
            .collect();
        // Only workers may keep the queue open, so a dead pool fails the dispatcher.
        drop(queue);

        state.enter(RunPhase::Dispatching);
        let mut dispatcher = Dispatcher::new(tx, Arc::clone(&state.metrics), cancel.clone());
        let dispatched = match feed {
            Feed::Records(records) => {
                dispatcher
                    .dispatch_bulk(records, workers)
                    .instrument(span.clone())
                    .await
            }
            Feed::Source(source) => {
                let threshold = self.config.batch_threshold();
                let (stream, producer) = spawn_source(source, threshold, cancel.clone());
                let dispatched = dispatcher
                    .dispatch_stream(stream, threshold)
                    .instrument(span.clone())
                    .await;
                if dispatched.is_err() {
                    producer.abort();
                }
                dispatched
            }
        };
        // Closing the queue lets the workers drain what was handed out and stop.
        let summary = dispatcher.close();

        let upstream_error = match dispatched {
            Ok(_) => None,
            Err(err) => {
                let err = IngestError::from(err);
                error!(
                    run_id = %state.run_id,
                    error = %err,
                    batches = summary.batches,
                    records = summary.records,
                    "Dispatch aborted, cancelling workers"
                );
                cancel.cancel();
                Some(err)
            }
        };

        state.enter(RunPhase::Draining);
        let (worker_ids, handles): (Vec<usize>, Vec<_>) = handles.into_iter().unzip();
        let results: Vec<WorkerResult> = futures::future::join_all(handles)
            .await
            .into_iter()
            .zip(worker_ids)
            .map(|(joined, worker_id)| match joined {
                Ok(result) => result,
                Err(join_error) => {
                    error!(worker_id, error = %join_error, "Worker task died");
                    WorkerResult {
                        worker_id,
                        error: Some(IngestError::WorkerPanicked {
                            worker_id,
                            message: join_error.to_string(),
                        }),
                        transaction: None,
                        stats: WorkerStats::default(),
                    }
                }
            })
            .collect();

        if let Some(deadline) = deadline {
            deadline.abort();
        }

        state.enter(RunPhase::Barrier);
        let report = TransactionCoordinator::new()
            .finalize(results, upstream_error.is_some())
            .instrument(span)
            .await;

        state.enter(RunPhase::Terminal);
        Ok(self.finish(state, mode, summary, upstream_error, Some(report)))
    }

    fn finish(
        &self,
        state: RunState,
        mode: IngestMode,
        dispatch: DispatchSummary,
        upstream_error: Option<IngestError>,
        report: Option<BarrierReport>,
    ) -> RunResult {
        let (decision, failed_workers, finalized, finalization_errors, worker_stats) = match report
        {
            Some(report) => (
                Some(report.decision),
                report.worker_failures,
                report.finalized,
                report.finalization_errors,
                report.worker_stats,
            ),
            None => (None, Vec::new(), Vec::new(), Vec::new(), Vec::new()),
        };

        let result = RunResult {
            run_id: state.run_id,
            table: self.schema.table().to_string(),
            mode,
            workers: self.config.workers,
            started_at: state.started_at,
            finished_at: Utc::now(),
            phases: state.phases,
            decision,
            dispatch,
            upstream_error,
            failed_workers,
            finalized,
            finalization_errors,
            worker_stats,
            metrics: state.metrics.snapshot(),
        };

        if result.success() {
            info!(
                run_id = %result.run_id,
                records = result.dispatch.records,
                rows = result.rows_committed(),
                elapsed_ms = result.duration().num_milliseconds(),
                "Ingestion run committed"
            );
        } else {
            warn!(
                run_id = %result.run_id,
                stage = ?result.failure_stage(),
                error = ?result.error().map(ToString::to_string),
                "Ingestion run failed"
            );
        }

        result
    }
}

fn spawn_deadline(timeout: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_secs = timeout.as_secs_f64(), "Run deadline reached, cancelling");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::builder("events").column("id").build().unwrap())
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| Record::new().with_scalar("id", i as i64)).collect()
    }

    #[tokio::test]
    async fn test_phases_of_successful_run() {
        let store = MemoryStore::for_schema(&schema());
        let pipeline = IngestPipeline::new(
            Arc::new(store.clone()),
            schema(),
            PipelineConfig {
                workers: 3,
                ..PipelineConfig::default()
            },
        );

        let result = pipeline.run_bulk(records(7)).await.unwrap();

        assert!(result.success());
        assert_eq!(
            result.phases,
            vec![
                RunPhase::Init,
                RunPhase::Dispatching,
                RunPhase::Draining,
                RunPhase::Barrier,
                RunPhase::Terminal,
            ]
        );
        assert_eq!(result.dispatch, DispatchSummary { batches: 3, records: 7 });
        assert_eq!(result.rows_committed(), 7);
        assert_eq!(store.row_count("events"), 7);
        assert!(result.error().is_none());
        assert_eq!(result.failure_stage(), None);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_running() {
        let store = MemoryStore::for_schema(&schema());
        let pipeline = IngestPipeline::new(
            Arc::new(store.clone()),
            schema(),
            PipelineConfig {
                workers: 0,
                ..PipelineConfig::default()
            },
        );

        assert!(matches!(
            pipeline.run_bulk(records(1)).await,
            Err(IngestError::Config(_))
        ));
        assert_eq!(store.stats().begun, 0);
    }

    #[tokio::test]
    async fn test_summary_serializes() {
        let store = MemoryStore::for_schema(&schema());
        let pipeline = IngestPipeline::new(Arc::new(store), schema(), PipelineConfig::default());
        let result = pipeline.run_bulk(records(2)).await.unwrap();

        let json = serde_json::to_value(result.summary()).unwrap();
        assert_eq!(json["success"], serde_json::json!(true));
        assert_eq!(json["decision"], serde_json::json!("commit"));
        assert_eq!(json["rows_committed"], serde_json::json!(2));
    }
}
