// src/interception/agent.rs
//! Instrumentation agent
//!
//! Attached once per process, before any module under test is loaded. It
//! registers an [`ExitCallTransformer`] with the module loader so that every
//! eligible module is rewritten on its way in, and it provides the host side
//! of the rewritten imports through [`Agent::linker`].
//!
//! Modules the policy excludes, or that fail to rewrite, keep their real
//! `proc_exit` calls; in those modules an exit ends the process even while
//! an expectation is armed.

use crate::interception::hook::ExitHook;
use crate::interception::policy::RewritePolicy;
use crate::interception::rewriter::{
    RewriteOutcome, Rewriter, HOOK_MODULE, HOOK_NAME, TERMINATION_MODULES, TERMINATION_NAME,
};
use crate::runtime::guest::{GuestInstance, GuestState};
use crate::runtime::loader::{LoadedModule, ModuleLoader, ModuleTransformer};
use crate::utils::config::InterceptConfig;
use crate::utils::errors::{InterceptError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};
use wasmtime::{Caller, Linker};

static AGENT: OnceLock<Agent> = OnceLock::new();

/// Counters kept by the transformer
#[derive(Debug, Default)]
pub struct AgentStats {
    modules_seen: AtomicU64,
    modules_rewritten: AtomicU64,
    modules_excluded: AtomicU64,
    modules_failed: AtomicU64,
    call_sites_rewritten: AtomicU64,
}

/// Point-in-time copy of [`AgentStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatsSnapshot {
    pub modules_seen: u64,
    pub modules_rewritten: u64,
    pub modules_excluded: u64,
    pub modules_failed: u64,
    pub call_sites_rewritten: u64,
}

impl AgentStats {
    pub fn snapshot(&self) -> AgentStatsSnapshot {
        AgentStatsSnapshot {
            modules_seen: self.modules_seen.load(Ordering::Relaxed),
            modules_rewritten: self.modules_rewritten.load(Ordering::Relaxed),
            modules_excluded: self.modules_excluded.load(Ordering::Relaxed),
            modules_failed: self.modules_failed.load(Ordering::Relaxed),
            call_sites_rewritten: self.call_sites_rewritten.load(Ordering::Relaxed),
        }
    }
}

/// Load-time transformer that applies the policy and the rewriter
pub struct ExitCallTransformer {
    policy: RewritePolicy,
    rewriter: Rewriter,
    stats: Arc<AgentStats>,
}

impl ExitCallTransformer {
    pub fn new(policy: RewritePolicy, rewriter: Rewriter, stats: Arc<AgentStats>) -> Self {
        Self {
            policy,
            rewriter,
            stats,
        }
    }
}

impl ModuleTransformer for ExitCallTransformer {
    fn transform(&self, module_name: &str, bytes: &[u8]) -> Option<Vec<u8>> {
        self.stats.modules_seen.fetch_add(1, Ordering::Relaxed);

        let decision = self.policy.decide(module_name);
        if !decision.eligible {
            debug!(
                "Skipping {} (rule: {})",
                module_name,
                decision.rule.as_deref().unwrap_or("include list")
            );
            self.stats.modules_excluded.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match self.rewriter.rewrite_or_original(module_name, bytes) {
            RewriteOutcome::Rewritten(rewritten) => {
                self.stats.modules_rewritten.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .call_sites_rewritten
                    .fetch_add(rewritten.call_sites as u64, Ordering::Relaxed);
                Some(rewritten.bytes)
            }
            RewriteOutcome::Unchanged(_) => None,
            RewriteOutcome::FailedClosed(..) => {
                self.stats.modules_failed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

/// The attached instrumentation agent
pub struct Agent {
    loader: Arc<ModuleLoader>,
    policy: RewritePolicy,
    hook: ExitHook,
    stats: Arc<AgentStats>,
}

impl Agent {
    /// Build an agent and register its transformer with `loader`
    pub fn new(loader: Arc<ModuleLoader>, policy: RewritePolicy, hook: ExitHook, verify: bool) -> Self {
        let stats = Arc::new(AgentStats::default());
        loader.add_transformer(Arc::new(ExitCallTransformer::new(
            policy.clone(),
            Rewriter::new(verify),
            Arc::clone(&stats),
        )));

        Self {
            loader,
            policy,
            hook,
            stats,
        }
    }

    /// Attach the process-wide agent to the global loader
    ///
    /// Only the first call installs anything. Later calls get the same
    /// agent back; a different policy on a later call is ignored with a
    /// warning.
    pub fn attach(policy: Option<&str>) -> Result<&'static Agent> {
        Self::attach_inner(policy, true)
    }

    /// Attach using the policy and verification setting from `config`
    pub fn attach_with_config(config: &InterceptConfig) -> Result<&'static Agent> {
        Self::attach_inner(config.policy.as_deref(), config.verify_rewrites)
    }

    fn attach_inner(policy: Option<&str>, verify: bool) -> Result<&'static Agent> {
        let requested = RewritePolicy::from_option(policy)?;

        let mut installed = false;
        let agent = AGENT.get_or_init(|| {
            installed = true;
            Agent::new(
                ModuleLoader::global(),
                requested.clone(),
                ExitHook::global().clone(),
                verify,
            )
        });

        if installed {
            info!("Exit interception agent attached with policy [{}]", agent.policy);
        } else if agent.policy.to_string() != requested.to_string() {
            warn!(
                "Agent already attached with policy [{}]; ignoring [{}]",
                agent.policy, requested
            );
        }

        Ok(agent)
    }

    /// The attached agent, if any
    pub fn get() -> Option<&'static Agent> {
        AGENT.get()
    }

    pub fn loader(&self) -> &Arc<ModuleLoader> {
        &self.loader
    }

    pub fn policy(&self) -> &RewritePolicy {
        &self.policy
    }

    pub fn hook(&self) -> &ExitHook {
        &self.hook
    }

    pub fn stats(&self) -> AgentStatsSnapshot {
        self.stats.snapshot()
    }

    /// Linker providing the hook and the real termination primitive
    pub fn linker(&self) -> Result<Linker<GuestState>> {
        let mut linker = Linker::new(self.loader.engine());

        let hook = self.hook.clone();
        linker
            .func_wrap(
                HOOK_MODULE,
                HOOK_NAME,
                move |caller: Caller<'_, GuestState>, code: i32| -> anyhow::Result<()> {
                    let signal = hook.on_termination_attempt(code);
                    debug!(
                        "Unwinding {} after intercepted exit({})",
                        caller.data().module(),
                        signal.code
                    );
                    Err(anyhow::Error::new(signal))
                },
            )
            .map_err(|e| InterceptError::LinkFailed(format!("{}.{}: {}", HOOK_MODULE, HOOK_NAME, e)))?;

        for namespace in TERMINATION_MODULES {
            let hook = self.hook.clone();
            linker
                .func_wrap(namespace, TERMINATION_NAME, move |code: i32| -> anyhow::Result<()> {
                    hook.terminate(code)
                })
                .map_err(|e| {
                    InterceptError::LinkFailed(format!("{}.{}: {}", namespace, TERMINATION_NAME, e))
                })?;
        }

        Ok(linker)
    }

    /// Load `bytes` through the agent's loader and instantiate the result
    pub fn instantiate(&self, module_name: &str, bytes: &[u8]) -> Result<GuestInstance> {
        let loaded = self.loader.load(module_name, bytes)?;
        self.instantiate_loaded(&loaded)
    }

    /// Instantiate an already loaded module
    ///
    /// Imports other than the exit primitives are linked as traps.
    pub fn instantiate_loaded(&self, loaded: &LoadedModule) -> Result<GuestInstance> {
        let mut linker = self.linker()?;
        linker
            .define_unknown_imports_as_traps(loaded.module())
            .map_err(|e| InterceptError::LinkFailed(format!("{}: {}", loaded.name(), e)))?;

        GuestInstance::instantiate(&linker, loaded)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("policy", &self.policy.to_string())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::hook::tests::{test_hook, RealExit};
    use crate::interception::registry::ContextId;
    use std::panic::{self, AssertUnwindSafe};

    const EXITS_WITH_ARG: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
          (func (export "_start") (param i32)
            (call $proc_exit (local.get 0))
            unreachable))
    "#;

    fn agent(policy: &str) -> Agent {
        Agent::new(
            Arc::new(ModuleLoader::default()),
            RewritePolicy::parse(policy).unwrap(),
            test_hook(),
            true,
        )
    }

    #[test]
    fn test_armed_exit_is_intercepted() {
        let agent = agent("");
        let ctx = ContextId::current();
        let id = agent.hook().registry().install(ctx, "armed");

        let mut guest = agent.instantiate("app/main", EXITS_WITH_ARG.as_bytes()).unwrap();
        let err = guest.invoke_with("_start", 2).unwrap_err();
        assert_eq!(err.exit_signal().map(|s| s.code), Some(2));

        let attempts = agent
            .hook()
            .registry()
            .remove(ctx, id)
            .expectation
            .unwrap()
            .into_attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].code, 2);

        let stats = agent.stats();
        assert_eq!(stats.modules_seen, 1);
        assert_eq!(stats.modules_rewritten, 1);
        assert_eq!(stats.call_sites_rewritten, 1);
    }

    #[test]
    fn test_armed_tail_call_exit_is_intercepted() {
        let agent = agent("");
        let ctx = ContextId::current();
        let id = agent.hook().registry().install(ctx, "armed");

        let text = r#"
            (module
              (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
              (func (export "tail") (param i32)
                local.get 0
                return_call $proc_exit)
              (func (export "plain") (param i32)
                (call $proc_exit (local.get 0))))
        "#;
        let mut guest = agent.instantiate("app/tail", text.as_bytes()).unwrap();
        let err = guest.invoke_with("tail", 5).unwrap_err();
        assert_eq!(err.exit_signal().map(|s| s.code), Some(5));

        let attempts = agent
            .hook()
            .registry()
            .remove(ctx, id)
            .expectation
            .unwrap()
            .into_attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].code, 5);
        assert_eq!(agent.stats().call_sites_rewritten, 2);
    }

    #[test]
    fn test_unarmed_exit_is_forwarded() {
        let agent = agent("");
        let mut guest = agent.instantiate("app/main", EXITS_WITH_ARG.as_bytes()).unwrap();

        let payload = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = guest.invoke_with("_start", 7);
        }))
        .unwrap_err();
        assert_eq!(payload.downcast_ref::<RealExit>(), Some(&RealExit(7)));
    }

    #[test]
    fn test_excluded_module_exits_for_real() {
        let agent = agent("-app/legacy/**");
        let ctx = ContextId::current();
        let id = agent.hook().registry().install(ctx, "armed");

        let mut guest = agent
            .instantiate("app/legacy/tool", EXITS_WITH_ARG.as_bytes())
            .unwrap();
        let payload = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = guest.invoke_with("_start", 1);
        }))
        .unwrap_err();
        assert_eq!(payload.downcast_ref::<RealExit>(), Some(&RealExit(1)));

        let removal = agent.hook().registry().remove(ctx, id);
        assert!(removal.expectation.unwrap().attempts().is_empty());
        assert_eq!(agent.stats().modules_excluded, 1);
    }

    #[test]
    fn test_sealed_namespace_is_never_rewritten() {
        let agent = agent("+**");
        agent
            .loader()
            .load("exit_intercept/runtime", EXITS_WITH_ARG.as_bytes())
            .unwrap();

        let stats = agent.stats();
        assert_eq!(stats.modules_excluded, 1);
        assert_eq!(stats.modules_rewritten, 0);
    }

    #[test]
    fn test_exit_in_start_function() {
        let agent = agent("");
        let ctx = ContextId::current();
        let id = agent.hook().registry().install(ctx, "start");

        let text = r#"
            (module
              (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
              (func $init (call $proc_exit (i32.const 3)))
              (start $init))
        "#;
        let err = agent.instantiate("app/init", text.as_bytes()).unwrap_err();
        assert_eq!(err.exit_signal().map(|s| s.code), Some(3));

        agent.hook().registry().remove(ctx, id);
    }

    #[test]
    fn test_unknown_imports_trap() {
        let agent = agent("");
        let text = r#"
            (module
              (import "env" "missing" (func $missing))
              (func (export "_start") (call $missing)))
        "#;

        let mut guest = agent.instantiate("app/env", text.as_bytes()).unwrap();
        let err = guest.invoke("_start").unwrap_err();
        assert!(matches!(err, InterceptError::GuestError(_)));
    }

    #[test]
    fn test_attach_is_idempotent() {
        let first = Agent::attach(None).unwrap();
        let second = Agent::attach(Some("-app/other/**")).unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(Agent::get().is_some());
    }

    #[test]
    fn test_attach_rejects_invalid_policy() {
        assert!(matches!(
            Agent::attach(Some("include:")),
            Err(InterceptError::PolicyError(_))
        ));
    }
}
