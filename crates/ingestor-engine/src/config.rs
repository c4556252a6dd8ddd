//! Configuration management

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ingestor_common::{IngestorError, Result};
use serde::{Deserialize, Serialize};

use crate::store::postgres::{
    DbConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DATABASE_URL, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_MAX_CONNECTIONS,
};

// ============================================================================
// Run Configuration Constants
// ============================================================================

/// Default number of workers (and transactions) per run.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default dispatch mode.
pub const DEFAULT_MODE: IngestMode = IngestMode::Stream;

/// How records reach the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Materialize every record, then split into `ceil(N/W)`-sized batches
    Bulk,
    /// Batch records as they arrive, `batch_size` at a time
    Stream,
}

impl IngestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestMode::Bulk => "bulk",
            IngestMode::Stream => "stream",
        }
    }
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IngestMode {
    type Err = IngestorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bulk" => Ok(IngestMode::Bulk),
            "stream" | "streaming" => Ok(IngestMode::Stream),
            other => Err(IngestorError::config(format!(
                "Invalid ingest mode '{}', expected bulk or stream",
                other
            ))),
        }
    }
}

/// Parameters of one ingestion run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Streaming batch threshold; defaults to the worker count
    pub batch_size: Option<usize>,
    pub mode: IngestMode,
    /// Cancel the run if it has not reached the barrier by then
    pub timeout: Option<Duration>,
    /// Cancel the remaining workers as soon as one fails
    pub abort_on_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKER_COUNT,
            batch_size: None,
            mode: DEFAULT_MODE,
            timeout: None,
            abort_on_failure: false,
        }
    }
}

impl PipelineConfig {
    pub fn batch_threshold(&self) -> usize {
        self.batch_size.unwrap_or(self.workers)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(IngestorError::config("Worker count must be greater than 0"));
        }
        if self.batch_size == Some(0) {
            return Err(IngestorError::config("Batch size must be greater than 0"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(IngestorError::config("Run timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Full configuration of the `ingestor` binary
#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub database: DbConfig,
    pub pipeline: PipelineConfig,
    /// Where input files are moved after a committed run
    pub archive_dir: Option<PathBuf>,
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IngestorError::config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

impl IngestConfig {
    /// Load configuration from the environment (and `.env`) over defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read configuration from process environment variables without validating
    pub fn from_env() -> Result<Self> {
        let database = DbConfig {
            url: std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            max_connections: env_parse("DB_MAX_CONNECTIONS")?.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            min_connections: env_parse("DB_MIN_CONNECTIONS")?.unwrap_or(0),
            connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT")?
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT")?.or(Some(DEFAULT_IDLE_TIMEOUT_SECS)),
        };

        let pipeline = PipelineConfig {
            workers: env_parse("INGEST_WORKER_COUNT")?.unwrap_or(DEFAULT_WORKER_COUNT),
            batch_size: env_parse("INGEST_BATCH_SIZE")?,
            mode: env_parse("INGEST_MODE")?.unwrap_or(DEFAULT_MODE),
            timeout: env_parse::<u64>("INGEST_TIMEOUT_SECS")?.map(Duration::from_secs),
            abort_on_failure: env_parse("INGEST_ABORT_ON_FAILURE")?.unwrap_or(false),
        };

        Ok(Self {
            database,
            pipeline,
            archive_dir: std::env::var_os("INGEST_ARCHIVE_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;

        if self.database.url.is_empty() {
            return Err(IngestorError::config("Database URL cannot be empty"));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(IngestorError::config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        // Every worker holds one connection until the barrier.
        if (self.database.max_connections as usize) < self.pipeline.workers {
            return Err(IngestorError::config(format!(
                "Database pool ({} connections) is smaller than the worker count ({})",
                self.database.max_connections, self.pipeline.workers
            )));
        }

        Ok(())
    }
}
