//! # Structured Logging Setup
//!
//! Tracing-based logging for the engine. Collection rounds, source
//! failures, deadline abandonment and health transitions are emitted as
//! structured events by the modules that observe them; this module only
//! owns subscriber installation.
//!
//! The `RUST_LOG` environment variable overrides the configured default
//! filter, following the usual `tracing_subscriber::EnvFilter` syntax.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::{HarvestError, Result};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Include span targets in output.
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "entropy_forge=info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Returns an error if a subscriber is already installed; callers embedding
/// the engine in a larger application normally install their own and skip
/// this entirely.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| HarvestError::Logging(e.to_string()))
}

/// Convenience wrapper installing the default configuration.
pub fn init_default_logging() -> Result<()> {
    init_logging(&LoggingConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = LoggingConfig::default();
        assert!(config.filter.contains("entropy_forge"));
        assert!(!config.json);
    }

    #[test]
    fn double_init_reports_error_not_panic() {
        // First call may succeed or fail depending on test ordering; the
        // second must fail cleanly either way.
        let _ = init_default_logging();
        let second = init_default_logging();
        assert!(second.is_err());
    }
}
