// src/utils/config.rs
//! Configuration loading
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. `exit-intercept.{toml,yaml,json}` in the working directory (optional),
//!    or an explicit file passed to [`InterceptConfig::load_from`]
//! 3. `EXIT_INTERCEPT_*` environment variables (e.g. `EXIT_INTERCEPT_POLICY`)

use crate::runtime::lifecycle::LeakPolicy;
use crate::utils::errors::Result;
use config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const CONFIG_FILE_STEM: &str = "exit-intercept";
const ENV_PREFIX: &str = "EXIT_INTERCEPT";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptConfig {
    /// Rewrite policy string handed to the agent at attach time
    pub policy: Option<String>,

    /// Default tracing filter (overridden by `RUST_LOG`)
    pub log_filter: String,

    /// Log output format
    pub log_format: LogFormat,

    /// Re-parse rewritten modules and check the call-site counts
    pub verify_rewrites: bool,

    /// How leaked expectations are reported
    pub leak_policy: LeakPolicy,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            policy: None,
            log_filter: "info".to_string(),
            log_format: LogFormat::Text,
            verify_rewrites: true,
            leak_policy: LeakPolicy::Warn,
        }
    }
}

impl InterceptConfig {
    /// Load from the optional working-directory file and the environment
    pub fn load() -> Result<Self> {
        let builder = Self::defaults()?
            .add_source(File::with_name(CONFIG_FILE_STEM).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX));

        Self::finish(builder)
    }

    /// Load from an explicit file, still honouring the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);

        let builder = Self::defaults()?
            .add_source(File::from(path))
            .add_source(Environment::with_prefix(ENV_PREFIX));

        Self::finish(builder)
    }

    fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>> {
        let defaults = Self::default();

        Ok(Config::builder()
            .set_default("log_filter", defaults.log_filter)?
            .set_default("log_format", "text")?
            .set_default("verify_rewrites", defaults.verify_rewrites)?
            .set_default("leak_policy", "warn")?)
    }

    fn finish(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: Self = builder.build()?.try_deserialize()?;
        debug!("Configuration resolved: {:?}", config);
        Ok(config)
    }
}
