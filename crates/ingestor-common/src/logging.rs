//! Logging configuration and initialization
//!
//! Every ingestor binary installs its `tracing` subscriber through this module. Runs
//! log to the console, to a daily rolling file, or both, as text or JSON.
//!
//! Log with fields rather than formatted strings:
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! let worker_id = 2;
//! info!(worker_id, rows = 40, "Batch inserted");
//! warn!(worker_id, field = "comment", "Field not in schema, dropped");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ingestor_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> ingestor_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("Ingestor started");
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::{IngestorError, Result};

/// Default prefix of rolling log files, e.g. `ingestor.2025-01-18`.
pub const DEFAULT_LOG_FILE_PREFIX: &str = "ingestor";

/// Line format of every log output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = IngestorError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("json") {
            Ok(LogFormat::Json)
        } else if s.eq_ignore_ascii_case("text") || s.eq_ignore_ascii_case("pretty") {
            Ok(LogFormat::Text)
        } else {
            Err(IngestorError::config(format!("Unknown log format '{}'", s)))
        }
    }
}

/// Where and how run logs are written
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub console: bool,
    /// Directory of the daily rolling log file; `None` disables file output
    pub file_dir: Option<PathBuf>,
    pub file_prefix: String,
    /// Extra directives such as `sqlx=warn,ingestor_engine::worker=trace`
    pub directives: Option<String>,
    /// Source file and line on every event
    pub location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(IngestorError::config(format!("{} must be a boolean, got '{}'", key, value))),
    }
}

impl LogConfig {
    /// Console-only text logging at `level`
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: LogFormat::Text,
            console: true,
            file_dir: None,
            file_prefix: DEFAULT_LOG_FILE_PREFIX.to_string(),
            directives: None,
            location: false,
        }
    }

    /// Defaults overridden by `LOG_*` variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Override fields with whichever `LOG_*` variables are set
    ///
    /// `LOG_LEVEL`, `LOG_FORMAT`, `LOG_CONSOLE`, `LOG_DIR` (enables file output),
    /// `LOG_FILE_PREFIX`, `LOG_FILTER`, `LOG_LOCATION`.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_var("LOG_LEVEL") {
            self.level = level
                .trim()
                .parse()
                .map_err(|_| IngestorError::config(format!("Unknown log level '{}'", level)))?;
        }
        if let Some(format) = env_var("LOG_FORMAT") {
            self.format = format.trim().parse()?;
        }
        if let Some(console) = env_var("LOG_CONSOLE") {
            self.console = env_flag("LOG_CONSOLE", &console)?;
        }
        if let Some(dir) = env_var("LOG_DIR") {
            self.file_dir = Some(PathBuf::from(dir));
        }
        if let Some(prefix) = env_var("LOG_FILE_PREFIX") {
            self.file_prefix = prefix;
        }
        if let Some(filter) = env_var("LOG_FILTER") {
            self.directives = Some(filter);
        }
        if let Some(location) = env_var("LOG_LOCATION") {
            self.location = env_flag("LOG_LOCATION", &location)?;
        }
        Ok(self)
    }

    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    /// Also write to a daily rolling file in `dir`
    pub fn with_file(mut self, dir: impl AsRef<Path>, prefix: impl Into<String>) -> Self {
        self.file_dir = Some(dir.as_ref().to_path_buf());
        self.file_prefix = prefix.into();
        self
    }

    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());

        let extra = self.directives.as_deref().unwrap_or_default();
        for directive in extra.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let parsed = directive.parse().map_err(|e| {
                IngestorError::config(format!("Invalid log directive '{}': {}", directive, e))
            })?;
            filter = filter.add_directive(parsed);
        }

        Ok(filter)
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(config.location)
        .with_line_number(config.location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Install the global tracing subscriber described by `config`
///
/// Call once at startup. With file output enabled, keep the returned guard alive
/// until exit; dropping it flushes the background writer.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.console {
        layers.push(output_layer(config, std::io::stderr, true));
    }

    if let Some(dir) = &config.file_dir {
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(output_layer(config, writer, false));
        guard = Some(file_guard);
    }

    if layers.is_empty() {
        return Err(IngestorError::config(
            "Logging disabled everywhere: set LOG_DIR or enable LOG_CONSOLE",
        ));
    }

    Registry::default()
        .with(layers)
        .with(config.env_filter()?)
        .try_init()
        .map_err(|e| IngestorError::config(format!("Tracing already initialised: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_flags() {
        assert!(env_flag("X", "Yes").unwrap());
        assert!(!env_flag("X", "0").unwrap());
        assert!(env_flag("X", "maybe").is_err());
    }

    #[test]
    fn test_with_file_keeps_console() {
        let config = LogConfig::new(Level::DEBUG)
            .json()
            .with_file("/var/log/ingestor", "nightly");

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.console);
        assert_eq!(config.file_dir, Some(PathBuf::from("/var/log/ingestor")));
        assert_eq!(config.file_prefix, "nightly");
    }

    #[test]
    fn test_bad_directive_is_reported() {
        let config = LogConfig::default().with_directives("sqlx=notalevel");
        assert!(matches!(config.env_filter(), Err(IngestorError::Config(_))));
    }

    #[test]
    fn test_nowhere_to_log_is_rejected() {
        let config = LogConfig {
            console: false,
            ..LogConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
