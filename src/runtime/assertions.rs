// src/runtime/assertions.rs
//! Assertion helpers for exit behavior
//!
//! Thin wrappers over [`ExitTest`] for use inside ordinary `#[test]`
//! functions. They panic on failure, like the standard `assert!` family.

use crate::runtime::declaration::ExitDeclaration;
use crate::runtime::lifecycle::{ExitTest, TestReport};

/// A captured exit, open to further checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitAssertion {
    code: i32,
}

impl ExitAssertion {
    /// Code of the first captured attempt
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn with_exit_code(self, code: i32) -> Self {
        assert_eq!(
            code, self.code,
            "Wrong exit code found: expected {}, got {}",
            code, self.code
        );
        self
    }

    /// Inclusive on both ends
    pub fn with_exit_code_in_range(self, start: i32, end: i32) -> Self {
        assert!(start < end, "Start must come before end");
        assert!(
            (start..=end).contains(&self.code),
            "Exit code expected in range ({} .. {}) but was {}",
            start,
            end,
            self.code
        );
        self
    }
}

/// Run `body` and assert that it exits
pub fn assert_calls_exit<F>(body: F) -> ExitAssertion
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let report = capture("assert_calls_exit", ExitDeclaration::any(), body);
    match report.attempts.first() {
        Some(attempt) => ExitAssertion { code: attempt.code },
        None => panic!("Expected call to exit did not happen"),
    }
}

/// Run `body` and assert that it does not exit
pub fn assert_does_not_call_exit<F>(body: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let report = capture("assert_does_not_call_exit", ExitDeclaration::forbid(), body);
    if let Some(attempt) = report.attempts.first() {
        panic!("Unexpected call to exit with exit code {}", attempt.code);
    }
}

fn capture<F>(label: &str, declaration: ExitDeclaration, body: F) -> TestReport
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let report = ExitTest::new(label, declaration).run(body);
    if let Some(cause) = report.cause() {
        panic!("{} body failed: {}", label, cause);
    }
    report
}
