// src/runtime/lifecycle.rs
//! Test lifecycle integration
//!
//! Wraps one test invocation:
//!
//! ```text
//! Idle → Armed → Running → Captured | Completed → Verified → Idle
//! ```
//!
//! The expectation is removed before verification, and again by a drop
//! guard if the body unwinds with something other than an exit, so a
//! context is always back to idle when [`ExitTest::run`] returns.
//!
//! Expectations left on a context by anything other than an enclosing
//! [`ExitTest::run`] are reset when the next invocation arms, and reported
//! as leaked by that invocation.

use crate::interception::hook::ExitSignal;
use crate::interception::registry::{
    ContextId, ExitAttempt, InterceptionRegistry, LeakedExpectation, Removal,
};
use crate::runtime::declaration::ExitDeclaration;
use crate::utils::errors::{panic_message, InterceptError};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};
use ulid::Ulid;

thread_local! {
    /// Invocations currently running on this thread, outermost first
    static LIVE_INVOCATIONS: RefCell<Vec<Ulid>> = const { RefCell::new(Vec::new()) };
}

/// How leaked expectations affect the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakPolicy {
    /// Log and carry on
    #[default]
    Warn,
    /// Fail the invocation that found them
    Fail,
}

/// Invocation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Armed,
    Running,
    Captured,
    Completed,
    Verified,
}

/// Verdict for one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed {
        message: String,
        /// Error or panic raised by the body, if any
        cause: Option<String>,
    },
}

/// Everything known about a finished invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub invocation: String,
    pub declaration: ExitDeclaration,
    pub attempts: Vec<ExitAttempt>,
    pub leaked: Vec<LeakedExpectation>,
    pub phases: Vec<Phase>,
    pub outcome: Outcome,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    /// Failure message, if the invocation failed
    pub fn message(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Passed => None,
            Outcome::Failed { message, .. } => Some(message),
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Failed { cause, .. } => cause.as_deref(),
            Outcome::Passed => None,
        }
    }

    /// Codes of the captured attempts, in order
    pub fn codes(&self) -> Vec<i32> {
        self.attempts.iter().map(|a| a.code).collect()
    }
}

/// One test invocation under exit interception
#[derive(Debug, Clone)]
pub struct ExitTest {
    name: String,
    declaration: ExitDeclaration,
    registry: Arc<InterceptionRegistry>,
    leak_policy: LeakPolicy,
}

impl ExitTest {
    pub fn new(name: &str, declaration: ExitDeclaration) -> Self {
        Self {
            name: name.to_string(),
            declaration,
            registry: InterceptionRegistry::global(),
            leak_policy: LeakPolicy::default(),
        }
    }

    /// Use a registry other than the global one
    pub fn registry(mut self, registry: Arc<InterceptionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn leak_policy(mut self, leak_policy: LeakPolicy) -> Self {
        self.leak_policy = leak_policy;
        self
    }

    /// Run `body` on the calling thread and verify what it did
    pub fn run<F>(&self, body: F) -> TestReport
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let ctx = ContextId::current();
        let mut phases = vec![Phase::Idle];

        let stale = LIVE_INVOCATIONS.with(|live| self.registry.reclaim(ctx, &live.borrow()));
        let invocation = self.registry.install(ctx, &self.name);
        LIVE_INVOCATIONS.with(|live| live.borrow_mut().push(invocation));
        let guard = ArmedGuard {
            registry: &self.registry,
            ctx,
            invocation,
            armed: true,
        };
        phases.push(Phase::Armed);

        phases.push(Phase::Running);
        let (signal, cause) = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => (None, None),
            Ok(Err(e)) => match exit_signal_in(&e) {
                Some(signal) => (Some(signal), None),
                None => (None, Some(format!("{:#}", e))),
            },
            Err(payload) => match payload.downcast_ref::<ExitSignal>() {
                Some(signal) => (Some(*signal), None),
                None => (None, Some(format!("panic: {}", panic_message(payload.as_ref())))),
            },
        };

        match signal {
            Some(signal) => {
                debug!("'{}' unwound with exit({})", self.name, signal.code);
                phases.push(Phase::Captured);
            }
            None => phases.push(Phase::Completed),
        }

        let removal = guard.disarm();
        let attempts = removal
            .expectation
            .map(|e| e.into_attempts())
            .unwrap_or_default();
        let mut leaked = stale;
        leaked.extend(removal.leaked);

        phases.push(Phase::Verified);
        let outcome = self.verdict(&attempts, &leaked, cause);
        phases.push(Phase::Idle);

        match &outcome {
            Outcome::Passed => info!("'{}' passed ({})", self.name, self.declaration),
            Outcome::Failed { message, .. } => warn!("'{}' failed: {}", self.name, message),
        }

        TestReport {
            name: self.name.clone(),
            invocation: invocation.to_string(),
            declaration: self.declaration.clone(),
            attempts,
            leaked,
            phases,
            outcome,
        }
    }

    /// Like [`run`](Self::run), turning a failure into an error
    pub fn check<F>(&self, body: F) -> anyhow::Result<TestReport>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let report = self.run(body);
        match report.message() {
            None => Ok(report),
            Some(message) => Err(anyhow::anyhow!("{}: {}", report.name, message)),
        }
    }

    fn verdict(
        &self,
        attempts: &[ExitAttempt],
        leaked: &[LeakedExpectation],
        cause: Option<String>,
    ) -> Outcome {
        let mut failure = self.declaration.verify(attempts).err();

        if failure.is_none() && !leaked.is_empty() && self.leak_policy == LeakPolicy::Fail {
            let labels: Vec<&str> = leaked.iter().map(|l| l.label.as_str()).collect();
            failure = Some(format!(
                "{} leaked expectation(s) reset: {}",
                leaked.len(),
                labels.join(", ")
            ));
        }

        match (failure, cause) {
            (None, None) => Outcome::Passed,
            (Some(message), None) => Outcome::Failed {
                message,
                cause: None,
            },
            (Some(message), Some(cause)) => Outcome::Failed {
                message: format!("{}; caused by: {}", message, cause),
                cause: Some(cause),
            },
            (None, Some(cause)) => Outcome::Failed {
                message: format!("test body failed: {}", cause),
                cause: Some(cause),
            },
        }
    }
}

/// Removes the expectation unless disarmed explicitly
struct ArmedGuard<'a> {
    registry: &'a InterceptionRegistry,
    ctx: ContextId,
    invocation: Ulid,
    armed: bool,
}

impl ArmedGuard<'_> {
    fn disarm(mut self) -> Removal {
        self.armed = false;
        self.registry.remove(self.ctx, self.invocation)
    }
}

impl Drop for ArmedGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.remove(self.ctx, self.invocation);
        }
        let _ = LIVE_INVOCATIONS.try_with(|live| {
            live.borrow_mut().retain(|id| *id != self.invocation);
        });
    }
}

/// The intercepted exit carried anywhere in an error chain
pub fn exit_signal_in(error: &anyhow::Error) -> Option<ExitSignal> {
    error.chain().find_map(|cause| {
        cause.downcast_ref::<ExitSignal>().copied().or_else(|| {
            cause
                .downcast_ref::<InterceptError>()
                .and_then(|e| e.exit_signal().copied())
        })
    })
}
