// src/utils/errors.rs
//! Crate-wide error type
//!
//! Rewrite failures never reach this type as hard errors: the rewriter
//! recovers locally by keeping the original module. What surfaces here are
//! load, link, policy and configuration problems, plus the intercepted exit
//! signal itself so that `?` can carry it up to the test lifecycle.

use crate::interception::hook::ExitSignal;
use thiserror::Error;

/// Errors produced by the interception engine
#[derive(Debug, Error)]
pub enum InterceptError {
    /// An intercepted exit unwinding toward the test lifecycle
    #[error(transparent)]
    Exited(#[from] ExitSignal),

    /// Rewrite policy string could not be parsed
    #[error("Invalid rewrite policy: {0}")]
    PolicyError(String),

    /// A module could not be decoded or compiled by the runtime
    #[error("Module load failed: {0}")]
    ModuleLoadFailed(String),

    /// Host functions could not be linked into the runtime
    #[error("Link failed: {0}")]
    LinkFailed(String),

    /// A guest call trapped for a reason other than an intercepted exit
    #[error("Guest execution failed: {0}")]
    GuestError(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InterceptError {
    /// The intercepted exit carried by this error, if any
    pub fn exit_signal(&self) -> Option<&ExitSignal> {
        match self {
            InterceptError::Exited(signal) => Some(signal),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for InterceptError {
    fn from(e: config::ConfigError) -> Self {
        InterceptError::ConfigError(e.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, InterceptError>;

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_signal_accessor() {
        let err = InterceptError::from(ExitSignal::new(3));
        assert_eq!(err.exit_signal().map(|s| s.code), Some(3));

        let other = InterceptError::GuestError("unreachable".into());
        assert!(other.exit_signal().is_none());
    }

    #[test]
    fn test_display_is_transparent_for_exits() {
        let err = InterceptError::from(ExitSignal::new(7));
        assert_eq!(err.to_string(), ExitSignal::new(7).to_string());
    }
}
