//! Ingestor Common Library
//!
//! Shared error handling and logging setup for the ingestor workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`IngestorError`] type used for configuration, schema
//!   and file loading failures
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`] for
//!   structured `tracing` output to the console, rolling files or both
//!
//! # Example
//!
//! ```no_run
//! use ingestor_common::logging::{init_logging, LogConfig};
//!
//! fn start() -> ingestor_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{IngestorError, Result};
