// src/utils/mod.rs
//! Shared utilities: error types and configuration loading

pub mod config;
pub mod errors;

pub use config::{InterceptConfig, LogFormat};
pub use errors::{InterceptError, Result};
