// src/observability.rs
//! Logging setup
//!
//! Logs go to stderr so that the CLI's stdout carries only reports.

use crate::utils::config::{InterceptConfig, LogFormat};
use crate::utils::errors::{InterceptError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Filter for a `-v` count, or `None` to use the configured one
pub fn verbosity_filter(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `filter_override`, which takes
/// precedence over the configured filter.
pub fn init_tracing(config: &InterceptConfig, filter_override: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_override.unwrap_or(&config.log_filter)));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr);

    let installed = match config.log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed.map_err(|e| InterceptError::ConfigError(format!("tracing: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_filter() {
        assert_eq!(verbosity_filter(0), None);
        assert_eq!(verbosity_filter(1), Some("debug"));
        assert_eq!(verbosity_filter(3), Some("trace"));
    }

    #[test]
    fn test_second_init_fails() {
        let config = InterceptConfig::default();
        let _ = init_tracing(&config, None);
        assert!(init_tracing(&config, Some("warn")).is_err());
    }
}
