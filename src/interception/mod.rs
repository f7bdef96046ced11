// src/interception/mod.rs
//! Exit interception layer
//!
//! - **Rewriter**: retargets `proc_exit` call sites in a module to the hook
//! - **Policy**: decides which modules are eligible for rewriting
//! - **Agent**: wires policy and rewriter into the module loader, once
//! - **Hook**: records an attempt or forwards to the real exit
//! - **Registry**: armed expectations per execution context
//!
//! # Architecture
//!
//! ```text
//! Module bytes ─→ Agent (policy) ─→ Rewriter ─→ ModuleLoader
//!                                                   │
//! Guest call proc_exit(code) ─→ on_termination_attempt(code)
//!                                   │
//!                              ExitHook ─→ Registry
//!                                   ├─ armed:   record, unwind with ExitSignal
//!                                   └─ unarmed: real exit
//! ```

pub mod agent;
pub mod hook;
pub mod policy;
pub mod registry;
pub mod rewriter;

pub use agent::{Agent, AgentStatsSnapshot, ExitCallTransformer};
pub use hook::{exit, exit_in, ExitHook, ExitSignal, ProcessTerminator, Terminator};
pub use policy::{Decision, RewritePolicy};
pub use registry::{ContextId, ExitAttempt, InterceptionRegistry, LeakedExpectation};
pub use rewriter::{RewriteError, RewriteOutcome, Rewriter, Rewritten};
