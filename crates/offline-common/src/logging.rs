//! Logging configuration and setup.
//!
//! Filter precedence: an explicit [`LogConfig::filter`], then `RUST_LOG`,
//! then the worker crates at [`LogConfig::level`] with everything else
//! (reqwest, hyper) held at `warn`.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::LoggingError;

/// Targets that follow the configured level.
const WORKER_TARGETS: [&str; 2] = ["offline_sw", "offline_net"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// One JSON object per event, for hosts that ship logs elsewhere.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for the worker crates when no filter is given.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Custom filter string (e.g., "offline_sw=debug,reqwest=warn").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

impl LogConfig {
    /// JSON output at the default level.
    pub fn json() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn default_directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives = String::from("warn");
        for target in WORKER_TARGETS {
            directives.push_str(&format!(",{target}={level}"));
        }
        directives
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        let parse = |directives: String| {
            EnvFilter::try_new(&directives).map_err(|source| LoggingError::InvalidFilter {
                filter: directives,
                source,
            })
        };

        match self.filter {
            Some(ref custom) => parse(custom.clone()),
            None => match EnvFilter::try_from_default_env() {
                Ok(filter) => Ok(filter),
                Err(_) => parse(self.default_directives()),
            },
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// Fails instead of panicking when a subscriber is already installed, so
/// tests and embedding hosts can call it more than once.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    let registry = tracing_subscriber::registry().with(config.env_filter()?);

    match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }

    Ok(())
}
