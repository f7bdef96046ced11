// src/interception/rewriter.rs
//! Termination-call rewriter
//!
//! Bytes in, bytes out. Every direct `call` or `return_call` to the
//! `proc_exit` import is retargeted to the
//! `exit_intercept.on_termination_attempt` import, which has the same
//! `(i32) -> ()` shape, so the operand stack and the control flow after the
//! call are untouched.
//!
//! A module with no matching call site is reported as unchanged and callers
//! keep the original bytes. Any failure leaves the original module in place
//! (see [`Rewriter::rewrite_or_original`]).

use std::borrow::Cow;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::{debug, warn};
use crate::utils::errors::panic_message;
use walrus::ir::{dfs_pre_order_mut, Call, ReturnCall, VisitorMut};
use walrus::{FunctionId, ImportKind, Module, ValType};

/// Import namespaces that provide the termination primitive
pub const TERMINATION_MODULES: &[&str] = &["wasi_snapshot_preview1", "wasi_unstable"];

/// Name of the termination primitive
pub const TERMINATION_NAME: &str = "proc_exit";

/// Import namespace of the interception hook
pub const HOOK_MODULE: &str = "exit_intercept";

/// Name of the interception hook
pub const HOOK_NAME: &str = "on_termination_attempt";

/// Custom section that opts a module (empty payload) or named functions
/// (newline-separated payload) out of rewriting
pub const SKIP_SECTION: &str = "exit_intercept.skip";

/// Why a module could not be rewritten
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("malformed module: {0}")]
    Malformed(String),

    #[error("unsupported module shape: {0}")]
    Unsupported(String),

    #[error("rewritten module failed verification: {0}")]
    VerificationFailed(String),

    #[error("rewriter panicked: {0}")]
    Panicked(String),
}

/// A successfully rewritten module
#[derive(Debug, Clone)]
pub struct Rewritten {
    pub bytes: Vec<u8>,

    /// Call sites retargeted to the hook
    pub call_sites: usize,

    /// Call sites left alone because their function opted out
    pub skipped_call_sites: usize,
}

/// Result of a fail-closed rewrite
#[derive(Debug)]
pub enum RewriteOutcome<'a> {
    /// Nothing to rewrite; the original bytes
    Unchanged(&'a [u8]),

    Rewritten(Rewritten),

    /// Rewriting failed; the original bytes
    FailedClosed(&'a [u8], RewriteError),
}

impl<'a> RewriteOutcome<'a> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            RewriteOutcome::Unchanged(bytes) => *bytes,
            RewriteOutcome::Rewritten(rewritten) => &rewritten.bytes,
            RewriteOutcome::FailedClosed(bytes, _) => *bytes,
        }
    }

    pub fn into_bytes(self) -> Cow<'a, [u8]> {
        match self {
            RewriteOutcome::Unchanged(bytes) => Cow::Borrowed(bytes),
            RewriteOutcome::Rewritten(rewritten) => Cow::Owned(rewritten.bytes),
            RewriteOutcome::FailedClosed(bytes, _) => Cow::Borrowed(bytes),
        }
    }

    pub fn call_sites(&self) -> usize {
        match self {
            RewriteOutcome::Rewritten(rewritten) => rewritten.call_sites,
            _ => 0,
        }
    }
}

/// Direct call counts in a module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSiteCount {
    /// Calls to the termination primitive
    pub primitive: usize,

    /// Calls to the interception hook
    pub hook: usize,
}

/// Rewrites termination calls into hook calls
#[derive(Debug, Clone)]
pub struct Rewriter {
    verify: bool,
}

impl Rewriter {
    /// Create a rewriter; `verify` re-parses and re-counts every output
    pub fn new(verify: bool) -> Self {
        Self { verify }
    }

    /// Rewrite one module
    ///
    /// `Ok(None)` means there was nothing to rewrite.
    pub fn rewrite(&self, bytes: &[u8]) -> Result<Option<Rewritten>, RewriteError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.rewrite_module(bytes))) {
            Ok(result) => result,
            Err(payload) => Err(RewriteError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Rewrite one module, keeping the original bytes on any failure
    pub fn rewrite_or_original<'a>(&self, module_name: &str, bytes: &'a [u8]) -> RewriteOutcome<'a> {
        match self.rewrite(bytes) {
            Ok(Some(rewritten)) => {
                debug!(
                    "Rewrote {} exit call site(s) in {}",
                    rewritten.call_sites, module_name
                );
                RewriteOutcome::Rewritten(rewritten)
            }
            Ok(None) => {
                debug!("No exit call sites to rewrite in {}", module_name);
                RewriteOutcome::Unchanged(bytes)
            }
            Err(e) => {
                warn!(
                    "Leaving {} unmodified, its exit calls will not be intercepted: {}",
                    module_name, e
                );
                RewriteOutcome::FailedClosed(bytes, e)
            }
        }
    }

    fn rewrite_module(&self, bytes: &[u8]) -> Result<Option<Rewritten>, RewriteError> {
        let mut module =
            Module::from_buffer(bytes).map_err(|e| RewriteError::Malformed(format!("{:#}", e)))?;

        let primitives = termination_imports(&module);
        if primitives.is_empty() {
            return Ok(None);
        }

        let skipped_functions = match read_skip_marker(&mut module)? {
            SkipMarker::Absent => HashSet::new(),
            SkipMarker::Module => {
                debug!("Module opted out of exit rewriting");
                return Ok(None);
            }
            SkipMarker::Functions(names) => module
                .funcs
                .iter()
                .filter(|f| f.name.as_deref().is_some_and(|n| names.contains(n)))
                .map(|f| f.id())
                .collect(),
        };

        let hook = hook_import(&mut module, primitives[0])?;

        let mut call_sites = 0;
        let mut skipped_call_sites = 0;

        for (id, func) in module.funcs.iter_local_mut() {
            let skipped = skipped_functions.contains(&id);
            let mut visitor = CallSites {
                targets: &primitives,
                retarget: if skipped { None } else { Some(hook) },
                matched: 0,
            };
            let entry = func.entry_block();
            dfs_pre_order_mut(&mut visitor, func, entry);

            if skipped {
                skipped_call_sites += visitor.matched;
            } else {
                call_sites += visitor.matched;
            }
        }

        if call_sites == 0 {
            return Ok(None);
        }

        let bytes = module.emit_wasm();

        if self.verify {
            let count = count_call_sites(&bytes)
                .map_err(|e| RewriteError::VerificationFailed(e.to_string()))?;
            if count.primitive != skipped_call_sites || count.hook < call_sites {
                return Err(RewriteError::VerificationFailed(format!(
                    "expected {} primitive and at least {} hook call(s), found {} and {}",
                    skipped_call_sites, call_sites, count.primitive, count.hook
                )));
            }
        }

        Ok(Some(Rewritten {
            bytes,
            call_sites,
            skipped_call_sites,
        }))
    }
}

impl Default for Rewriter {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Count direct calls to the primitive and to the hook
pub fn count_call_sites(bytes: &[u8]) -> Result<CallSiteCount, RewriteError> {
    let mut module =
        Module::from_buffer(bytes).map_err(|e| RewriteError::Malformed(format!("{:#}", e)))?;

    let primitives = termination_imports(&module);
    let hooks: Vec<FunctionId> = module
        .imports
        .iter()
        .filter(|i| i.module == HOOK_MODULE && i.name == HOOK_NAME)
        .filter_map(|i| match i.kind {
            ImportKind::Function(id) => Some(id),
            _ => None,
        })
        .collect();

    let mut count = CallSiteCount::default();
    for (_, func) in module.funcs.iter_local_mut() {
        let entry = func.entry_block();

        let mut visitor = CallSites {
            targets: &primitives,
            retarget: None,
            matched: 0,
        };
        dfs_pre_order_mut(&mut visitor, func, entry);
        count.primitive += visitor.matched;

        let mut visitor = CallSites {
            targets: &hooks,
            retarget: None,
            matched: 0,
        };
        dfs_pre_order_mut(&mut visitor, func, entry);
        count.hook += visitor.matched;
    }

    Ok(count)
}

/// Counts (and optionally retargets) direct calls to a set of functions
struct CallSites<'a> {
    targets: &'a [FunctionId],
    retarget: Option<FunctionId>,
    matched: usize,
}

impl CallSites<'_> {
    fn visit_target(&mut self, func: &mut FunctionId) {
        if self.targets.contains(func) {
            self.matched += 1;
            if let Some(hook) = self.retarget {
                *func = hook;
            }
        }
    }
}

impl VisitorMut for CallSites<'_> {
    fn visit_call_mut(&mut self, instr: &mut Call) {
        self.visit_target(&mut instr.func);
    }

    // Tail calls share the hook's `(i32) -> ()` shape too
    fn visit_return_call_mut(&mut self, instr: &mut ReturnCall) {
        self.visit_target(&mut instr.func);
    }
}

enum SkipMarker {
    Absent,
    Module,
    Functions(HashSet<String>),
}

fn read_skip_marker(module: &mut Module) -> Result<SkipMarker, RewriteError> {
    let Some(section) = module.customs.remove_raw(SKIP_SECTION) else {
        return Ok(SkipMarker::Absent);
    };

    let names: HashSet<String> = std::str::from_utf8(&section.data)
        .map_err(|_| RewriteError::Malformed(format!("{} section is not UTF-8", SKIP_SECTION)))?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();

    module.customs.add(section);

    Ok(if names.is_empty() {
        SkipMarker::Module
    } else {
        SkipMarker::Functions(names)
    })
}

/// Function imports matching the primitive by namespace, name and shape
fn termination_imports(module: &Module) -> Vec<FunctionId> {
    module
        .imports
        .iter()
        .filter(|i| TERMINATION_MODULES.contains(&i.module.as_str()) && i.name == TERMINATION_NAME)
        .filter_map(|i| match i.kind {
            ImportKind::Function(id) if has_exit_shape(module, id) => Some(id),
            ImportKind::Function(_) => {
                debug!("Ignoring {}.{} with a non-exit signature", i.module, i.name);
                None
            }
            _ => None,
        })
        .collect()
}

fn has_exit_shape(module: &Module, func: FunctionId) -> bool {
    let ty = module.types.get(module.funcs.get(func).ty());
    ty.params() == [ValType::I32] && ty.results().is_empty()
}

/// Reuse the hook import if present, otherwise add it
fn hook_import(module: &mut Module, primitive: FunctionId) -> Result<FunctionId, RewriteError> {
    let existing = module
        .imports
        .iter()
        .find(|i| i.module == HOOK_MODULE && i.name == HOOK_NAME)
        .map(|i| i.kind.clone());

    match existing {
        Some(ImportKind::Function(id)) if has_exit_shape(module, id) => Ok(id),
        Some(_) => Err(RewriteError::Unsupported(format!(
            "{}.{} is already imported with an incompatible type",
            HOOK_MODULE, HOOK_NAME
        ))),
        None => {
            let ty = module.funcs.get(primitive).ty();
            let (id, _) = module.add_import_func(HOOK_MODULE, HOOK_NAME, ty);
            Ok(id)
        }
    }
}
