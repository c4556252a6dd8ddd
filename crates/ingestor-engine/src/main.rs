//! Ingestor - transactional batch ingestion of JSON and XML record files

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ingestor_common::logging::{init_logging, LogConfig};
use ingestor_engine::archive::archive_input;
use ingestor_engine::{
    open_file, IngestConfig, IngestMode, IngestPipeline, MemoryStore, PgStore, Schema, Store,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "ingestor")]
#[command(author, version, about = "Transactional batch ingestion of nested records")]
struct Cli {
    /// Input file (.json, .jsonl, .ndjson or .xml)
    #[arg(short, long)]
    file: PathBuf,

    /// Schema definition (TOML)
    #[arg(short, long)]
    schema: PathBuf,

    /// Target table, overriding the schema file
    #[arg(short, long)]
    table: Option<String>,

    /// Number of workers, one transaction each
    #[arg(short, long)]
    workers: Option<usize>,

    /// Streaming batch size (defaults to the worker count)
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Dispatch mode
    #[arg(short, long, value_enum)]
    mode: Option<IngestMode>,

    /// Cancel and roll back the run after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Move the input file here after a committed run
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Run against an in-memory store instead of the database
    #[arg(long)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Apply command line overrides on top of environment configuration
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(workers) = self.workers {
            config.pipeline.workers = workers;
        }
        if let Some(batch_size) = self.batch_size {
            config.pipeline.batch_size = Some(batch_size);
        }
        if let Some(mode) = self.mode {
            config.pipeline.mode = mode;
        }
        if let Some(secs) = self.timeout_secs {
            config.pipeline.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(dir) = &self.archive_dir {
            config.archive_dir = Some(dir.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let log_config = LogConfig::new(log_level).merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;
    cli.apply(&mut config);
    config.validate()?;

    let mut schema = Schema::load(&cli.schema)
        .with_context(|| format!("Failed to load schema {}", cli.schema.display()))?;
    if let Some(table) = &cli.table {
        schema = schema.with_table(table.as_str())?;
    }
    let schema = Arc::new(schema);

    let source = open_file(&cli.file, &schema)?;

    let store: Arc<dyn Store> = if cli.dry_run {
        info!("Dry run: using in-memory store");
        Arc::new(MemoryStore::for_schema(&schema))
    } else {
        Arc::new(
            PgStore::connect(&config.database)
                .await
                .context("Failed to connect to database")?,
        )
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        }
    });

    info!(
        file = %cli.file.display(),
        table = schema.table(),
        mode = %config.pipeline.mode,
        workers = config.pipeline.workers,
        "Ingesting"
    );

    let pipeline = IngestPipeline::new(store, Arc::clone(&schema), config.pipeline.clone())
        .with_cancellation(cancel);
    let result = pipeline.run(source).await?;

    println!("{}", serde_json::to_string_pretty(&result.summary())?);

    if !result.success() {
        let reason = result
            .error()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown failure".to_string());
        anyhow::bail!("Ingestion run {} failed: {}", result.run_id, reason);
    }

    match (&config.archive_dir, cli.dry_run) {
        (Some(dir), false) => {
            archive_input(&cli.file, dir).await?;
        }
        (Some(_), true) => info!("Dry run: input file left in place"),
        (None, _) => {}
    }

    info!("Ingestion complete");
    Ok(())
}
