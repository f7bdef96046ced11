// src/interception/hook.rs
//! Interception hook
//!
//! Every rewritten call site ends up in [`ExitHook::on_termination_attempt`].
//! With an armed expectation the attempt is recorded and an [`ExitSignal`]
//! is handed back for the caller to unwind with; without one the call is
//! forwarded to the real termination primitive and never returns.
//!
//! Native Rust code under test reaches the same hook through [`exit`] and
//! [`exit_in`], which unwind with the signal as the payload. A
//! `catch_unwind` in the code under test can swallow that unwind; the
//! attempt is still recorded, but code after the exit point keeps running.

use crate::interception::registry::{ContextId, InterceptionRegistry};
use once_cell::sync::Lazy;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

static GLOBAL_HOOK: Lazy<ExitHook> = Lazy::new(|| {
    ExitHook::new(InterceptionRegistry::global(), Arc::new(ProcessTerminator))
});

/// Control-flow signal raised in place of an intercepted exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exit({code}) intercepted")]
pub struct ExitSignal {
    pub code: i32,
}

impl ExitSignal {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

/// The real termination primitive
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32) -> !;
}

/// Ends the process with `std::process::exit`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, code: i32) -> ! {
        info!("No expectation armed, exiting process with status {}", code);
        std::process::exit(code)
    }
}

/// Hook consulted by every rewritten call site
#[derive(Clone)]
pub struct ExitHook {
    registry: Arc<InterceptionRegistry>,
    terminator: Arc<dyn Terminator>,
}

impl ExitHook {
    pub fn new(registry: Arc<InterceptionRegistry>, terminator: Arc<dyn Terminator>) -> Self {
        Self {
            registry,
            terminator,
        }
    }

    /// Hook bound to the global registry and the process terminator
    pub fn global() -> &'static ExitHook {
        &GLOBAL_HOOK
    }

    pub fn registry(&self) -> &Arc<InterceptionRegistry> {
        &self.registry
    }

    /// Handle an exit attempt from the calling context
    pub fn on_termination_attempt(&self, code: i32) -> ExitSignal {
        self.on_termination_attempt_in(ContextId::current(), code)
    }

    /// Handle an exit attempt on behalf of an explicit context
    pub fn on_termination_attempt_in(&self, ctx: ContextId, code: i32) -> ExitSignal {
        match self.registry.record(ctx, code) {
            Some(attempt) => {
                debug!("Intercepted exit({}) on {}", attempt.code, ctx);
                ExitSignal::new(attempt.code)
            }
            None => self.terminate(code),
        }
    }

    /// Forward to the real termination primitive
    pub fn terminate(&self, code: i32) -> ! {
        self.terminator.terminate(code)
    }
}

impl std::fmt::Debug for ExitHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitHook")
            .field("armed_contexts", &self.registry.armed_contexts())
            .finish()
    }
}

/// Drop-in replacement for `std::process::exit` in code under test
pub fn exit(code: i32) -> ! {
    exit_in(ContextId::current(), code)
}

/// Like [`exit`], attributing the attempt to `ctx`
///
/// Lets worker threads report into the expectation of the thread that
/// armed it.
pub fn exit_in(ctx: ContextId, code: i32) -> ! {
    let signal = ExitHook::global().on_termination_attempt_in(ctx, code);
    std::panic::resume_unwind(Box::new(signal))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    /// Stands in for process exit in tests
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct RealExit(pub i32);

    pub(crate) struct UnwindingTerminator;

    impl Terminator for UnwindingTerminator {
        fn terminate(&self, code: i32) -> ! {
            panic::resume_unwind(Box::new(RealExit(code)))
        }
    }

    pub(crate) fn test_hook() -> ExitHook {
        ExitHook::new(
            Arc::new(InterceptionRegistry::new()),
            Arc::new(UnwindingTerminator),
        )
    }

    #[test]
    fn test_unarmed_attempt_forwards() {
        let hook = test_hook();

        let payload = panic::catch_unwind(AssertUnwindSafe(|| {
            hook.on_termination_attempt(3);
        }))
        .unwrap_err();

        assert_eq!(payload.downcast_ref::<RealExit>(), Some(&RealExit(3)));
    }

    #[test]
    fn test_armed_attempt_returns_signal() {
        let hook = test_hook();
        let ctx = ContextId::current();
        let id = hook.registry().install(ctx, "armed");

        let signal = hook.on_termination_attempt(2);
        assert_eq!(signal, ExitSignal::new(2));

        let attempts = hook.registry().remove(ctx, id).expectation.unwrap().into_attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].code, 2);
    }

    #[test]
    fn test_explicit_context_from_worker() {
        let hook = test_hook();
        let ctx = ContextId::current();
        let id = hook.registry().install(ctx, "parent");

        let worker_hook = hook.clone();
        let signal = std::thread::spawn(move || worker_hook.on_termination_attempt_in(ctx, 8))
            .join()
            .unwrap();
        assert_eq!(signal.code, 8);

        let attempts = hook.registry().remove(ctx, id).expectation.unwrap().into_attempts();
        assert_eq!(attempts[0].code, 8);
    }

    #[test]
    fn test_native_exit_unwinds_with_signal() {
        let registry = InterceptionRegistry::global();
        let ctx = ContextId::current();
        let id = registry.install(ctx, "native");

        let payload = panic::catch_unwind(|| {
            exit(4);
        })
        .unwrap_err();
        assert_eq!(payload.downcast_ref::<ExitSignal>(), Some(&ExitSignal::new(4)));

        registry.remove(ctx, id);
    }
}
