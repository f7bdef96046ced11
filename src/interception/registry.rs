// src/interception/registry.rs
//! Process-wide interception registry
//!
//! Maps an execution context (the calling thread) to the stack of exit
//! expectations armed on it. Only the top of a stack is active; arming a
//! nested expectation suspends the outer one until the inner is removed.
//!
//! Each context is written only by its own thread, so the sharded map is
//! only contended across contexts, never within one.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{debug, warn};
use ulid::Ulid;

static GLOBAL_REGISTRY: Lazy<Arc<InterceptionRegistry>> =
    Lazy::new(|| Arc::new(InterceptionRegistry::new()));

/// Identity of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(ThreadId);

impl ContextId {
    /// Context of the calling thread
    pub fn current() -> Self {
        Self(std::thread::current().id())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// One intercepted call to the termination primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitAttempt {
    pub code: i32,
}

/// Expectation armed for one test invocation
#[derive(Debug, Clone)]
pub struct Expectation {
    invocation: Ulid,
    label: String,
    active: bool,
    attempts: Vec<ExitAttempt>,
}

impl Expectation {
    fn new(label: &str) -> Self {
        Self {
            invocation: Ulid::new(),
            label: label.to_string(),
            active: true,
            attempts: Vec::new(),
        }
    }

    pub fn invocation(&self) -> Ulid {
        self.invocation
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Attempts in the order they were intercepted
    pub fn attempts(&self) -> &[ExitAttempt] {
        &self.attempts
    }

    pub fn into_attempts(self) -> Vec<ExitAttempt> {
        self.attempts
    }
}

/// An expectation whose owner never removed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakedExpectation {
    pub invocation: String,
    pub label: String,
    pub attempts: Vec<ExitAttempt>,
}

impl From<Expectation> for LeakedExpectation {
    fn from(e: Expectation) -> Self {
        Self {
            invocation: e.invocation.to_string(),
            label: e.label,
            attempts: e.attempts,
        }
    }
}

/// Result of removing an expectation
#[derive(Debug, Default)]
pub struct Removal {
    /// The removed expectation, if it was still registered
    pub expectation: Option<Expectation>,

    /// Expectations stacked above it that were never removed
    pub leaked: Vec<LeakedExpectation>,
}

/// Registry of armed expectations keyed by execution context
#[derive(Debug, Default)]
pub struct InterceptionRegistry {
    contexts: DashMap<ContextId, Vec<Expectation>>,
}

impl InterceptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            contexts: DashMap::new(),
        }
    }

    /// The registry consulted by the global hook
    pub fn global() -> Arc<InterceptionRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Arm a new expectation on `ctx`, suspending any outer one
    pub fn install(&self, ctx: ContextId, label: &str) -> Ulid {
        let expectation = Expectation::new(label);
        let invocation = expectation.invocation;

        let mut stack = self.contexts.entry(ctx).or_default();
        if let Some(outer) = stack.last_mut() {
            debug!(
                "Suspending expectation {} ('{}') on {} for nested invocation",
                outer.invocation, outer.label, ctx
            );
            outer.active = false;
        }
        stack.push(expectation);

        debug!("Armed expectation {} ('{}') on {}", invocation, label, ctx);
        invocation
    }

    /// Record an attempt against the active expectation of `ctx`
    ///
    /// Returns `None` when nothing is armed, meaning the caller must let the
    /// real termination happen.
    pub fn record(&self, ctx: ContextId, code: i32) -> Option<ExitAttempt> {
        let mut stack = self.contexts.get_mut(&ctx)?;
        let expectation = stack.last_mut().filter(|e| e.active)?;

        let attempt = ExitAttempt { code };
        expectation.attempts.push(attempt);
        debug!(
            "Recorded exit({}) for expectation {} on {}",
            code, expectation.invocation, ctx
        );
        Some(attempt)
    }

    /// Whether `ctx` currently has an active expectation
    pub fn is_armed(&self, ctx: ContextId) -> bool {
        self.contexts
            .get(&ctx)
            .and_then(|stack| stack.last().map(|e| e.active))
            .unwrap_or(false)
    }

    /// Attempts captured so far by the active expectation of `ctx`
    pub fn captured(&self, ctx: ContextId) -> Vec<ExitAttempt> {
        self.contexts
            .get(&ctx)
            .and_then(|stack| stack.last().map(|e| e.attempts.clone()))
            .unwrap_or_default()
    }

    /// Remove the expectation `invocation` from `ctx`
    ///
    /// Anything stacked above it is dropped and reported as leaked, and the
    /// next outer expectation (if any) becomes active again.
    pub fn remove(&self, ctx: ContextId, invocation: Ulid) -> Removal {
        let mut removal = Removal::default();

        let Entry::Occupied(mut entry) = self.contexts.entry(ctx) else {
            return removal;
        };

        let stack = entry.get_mut();
        let Some(position) = stack.iter().position(|e| e.invocation == invocation) else {
            warn!(
                "Expectation {} not found on {}; already removed",
                invocation, ctx
            );
            return removal;
        };

        removal.leaked = stack
            .split_off(position + 1)
            .into_iter()
            .map(LeakedExpectation::from)
            .collect();
        removal.expectation = stack.pop();

        for leaked in &removal.leaked {
            warn!(
                "Leaked expectation {} ('{}') on {} was reset",
                leaked.invocation, leaked.label, ctx
            );
        }

        if let Some(outer) = stack.last_mut() {
            outer.active = true;
        }
        if stack.is_empty() {
            entry.remove();
        }

        debug!("Removed expectation {} from {}", invocation, ctx);
        removal
    }

    /// Drop every expectation on `ctx`
    ///
    /// Best-effort cleanup for invocations that ended abnormally.
    pub fn reset(&self, ctx: ContextId) -> Vec<LeakedExpectation> {
        let leaked: Vec<LeakedExpectation> = self
            .contexts
            .remove(&ctx)
            .map(|(_, stack)| stack.into_iter().map(LeakedExpectation::from).collect())
            .unwrap_or_default();

        if !leaked.is_empty() {
            warn!("Reset {} expectation(s) on {}", leaked.len(), ctx);
        }
        leaked
    }

    /// Drop every expectation on `ctx` that is not in `live`
    ///
    /// Used before arming a new invocation: an expectation whose owner is no
    /// longer running must not be reactivated when the new one is removed.
    pub fn reclaim(&self, ctx: ContextId, live: &[Ulid]) -> Vec<LeakedExpectation> {
        let Entry::Occupied(mut entry) = self.contexts.entry(ctx) else {
            return Vec::new();
        };

        let (kept, stale): (Vec<Expectation>, Vec<Expectation>) = entry
            .get_mut()
            .drain(..)
            .partition(|e| live.contains(&e.invocation));

        let leaked: Vec<LeakedExpectation> =
            stale.into_iter().map(LeakedExpectation::from).collect();
        for leaked in &leaked {
            warn!(
                "Stale expectation {} ('{}') on {} was reset",
                leaked.invocation, leaked.label, ctx
            );
        }

        if kept.is_empty() {
            entry.remove();
        } else {
            let stack = entry.get_mut();
            *stack = kept;
            let top = stack.len() - 1;
            for (i, expectation) in stack.iter_mut().enumerate() {
                expectation.active = i == top;
            }
        }

        leaked
    }

    /// Number of contexts with at least one expectation
    pub fn armed_contexts(&self) -> usize {
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_record_without_expectation() {
        let registry = InterceptionRegistry::new();
        let ctx = ContextId::current();

        assert!(!registry.is_armed(ctx));
        assert_eq!(registry.record(ctx, 1), None);
    }

    #[test]
    fn test_install_record_remove() {
        let registry = InterceptionRegistry::new();
        let ctx = ContextId::current();

        let id = registry.install(ctx, "exits_with_two");
        assert!(registry.is_armed(ctx));

        assert_eq!(registry.record(ctx, 2), Some(ExitAttempt { code: 2 }));
        assert_eq!(registry.record(ctx, 5), Some(ExitAttempt { code: 5 }));

        let removal = registry.remove(ctx, id);
        let expectation = removal.expectation.unwrap();
        assert_eq!(expectation.label(), "exits_with_two");
        assert_eq!(
            expectation.attempts(),
            &[ExitAttempt { code: 2 }, ExitAttempt { code: 5 }]
        );
        assert!(removal.leaked.is_empty());

        assert!(!registry.is_armed(ctx));
        assert_eq!(registry.armed_contexts(), 0);
    }

    #[test]
    fn test_sequential_invocations_do_not_share_state() {
        let registry = InterceptionRegistry::new();
        let ctx = ContextId::current();

        let first = registry.install(ctx, "first");
        registry.record(ctx, 1);
        registry.remove(ctx, first);

        let second = registry.install(ctx, "second");
        assert!(registry.captured(ctx).is_empty());
        let removal = registry.remove(ctx, second);
        assert!(removal.expectation.unwrap().attempts().is_empty());
    }

    #[test]
    fn test_nested_expectation_suspends_outer() {
        let registry = InterceptionRegistry::new();
        let ctx = ContextId::current();

        let outer = registry.install(ctx, "outer");
        let inner = registry.install(ctx, "inner");

        registry.record(ctx, 9);
        let inner_removal = registry.remove(ctx, inner);
        assert_eq!(inner_removal.expectation.unwrap().attempts().len(), 1);

        // Outer is active again and saw nothing from the inner run
        assert!(registry.is_armed(ctx));
        assert!(registry.captured(ctx).is_empty());

        let outer_removal = registry.remove(ctx, outer);
        assert!(outer_removal.expectation.unwrap().attempts().is_empty());
    }

    #[test]
    fn test_remove_reports_leaked_inner() {
        let registry = InterceptionRegistry::new();
        let ctx = ContextId::current();

        let outer = registry.install(ctx, "outer");
        registry.install(ctx, "stray");
        registry.record(ctx, 4);

        let removal = registry.remove(ctx, outer);
        assert!(removal.expectation.is_some());
        assert_eq!(removal.leaked.len(), 1);
        assert_eq!(removal.leaked[0].label, "stray");
        assert_eq!(removal.leaked[0].attempts, vec![ExitAttempt { code: 4 }]);
        assert_eq!(registry.armed_contexts(), 0);
    }

    #[test]
    fn test_remove_twice_is_harmless() {
        let registry = InterceptionRegistry::new();
        let ctx = ContextId::current();

        let id = registry.install(ctx, "once");
        assert!(registry.remove(ctx, id).expectation.is_some());
        let again = registry.remove(ctx, id);
        assert!(again.expectation.is_none());
        assert!(again.leaked.is_empty());
    }

    #[test]
    fn test_reset_clears_context() {
        let registry = InterceptionRegistry::new();
        let ctx = ContextId::current();

        registry.install(ctx, "a");
        registry.install(ctx, "b");

        let leaked = registry.reset(ctx);
        assert_eq!(leaked.len(), 2);
        assert!(!registry.is_armed(ctx));
    }

    #[test]
    fn test_contexts_are_isolated() {
        let registry = Arc::new(InterceptionRegistry::new());
        let mut handles = vec![];

        for code in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let ctx = ContextId::current();
                let id = registry.install(ctx, &format!("worker-{}", code));
                for _ in 0..50 {
                    registry.record(ctx, code);
                }
                let attempts = registry.remove(ctx, id).expectation.unwrap().into_attempts();
                assert_eq!(attempts.len(), 50);
                assert!(attempts.iter().all(|a| a.code == code));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.armed_contexts(), 0);
    }

    #[test]
    fn test_other_thread_is_not_armed() {
        let registry = Arc::new(InterceptionRegistry::new());
        let ctx = ContextId::current();
        let id = registry.install(ctx, "parent");

        let child = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.record(ContextId::current(), 1))
        };
        assert_eq!(child.join().unwrap(), None);

        registry.remove(ctx, id);
    }

    #[test]
    fn test_reclaim_drops_stale_and_keeps_live() {
        let registry = InterceptionRegistry::new();
        let ctx = ContextId::current();

        let live = registry.install(ctx, "live");
        registry.install(ctx, "abandoned");
        registry.record(ctx, 3);

        let leaked = registry.reclaim(ctx, &[live]);
        assert_eq!(leaked.len(), 1);
        assert_eq!(leaked[0].label, "abandoned");
        assert_eq!(leaked[0].attempts, vec![ExitAttempt { code: 3 }]);

        // The surviving expectation is active again
        assert!(registry.is_armed(ctx));
        assert_eq!(registry.record(ctx, 8), Some(ExitAttempt { code: 8 }));
        assert!(registry.remove(ctx, live).expectation.is_some());
    }

    #[test]
    fn test_reclaim_without_live_clears_context() {
        let registry = InterceptionRegistry::new();
        let ctx = ContextId::current();

        registry.install(ctx, "left-behind");
        assert_eq!(registry.reclaim(ctx, &[]).len(), 1);
        assert!(!registry.is_armed(ctx));
        assert_eq!(registry.record(ctx, 7), None);
        assert_eq!(registry.armed_contexts(), 0);
        assert!(registry.reclaim(ctx, &[]).is_empty());
    }
}
