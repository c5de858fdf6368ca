//! # Offline Common
//!
//! Shared plumbing for the offline worker crates. For now that is the
//! `tracing` subscriber setup used by hosts embedding the worker.

use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Errors raised while installing the global subscriber.
#[derive(Error, Debug)]
pub enum LoggingError {
    /// The filter directive string did not parse.
    #[error("Invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    /// A global subscriber was already set.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

impl LoggingError {
    /// Get the error category for diagnostics.
    pub fn category(&self) -> &'static str {
        match self {
            LoggingError::InvalidFilter { .. } => "invalid_filter",
            LoggingError::AlreadyInitialized(_) => "already_initialized",
        }
    }
}
