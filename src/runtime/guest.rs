// src/runtime/guest.rs
//! Guest instances
//!
//! A guest is one instantiated module with its own store. Calls into it come
//! back as plain [`Result`]s: an intercepted exit surfaces as
//! [`InterceptError::Exited`], any other trap as [`InterceptError::GuestError`].

use crate::interception::hook::ExitSignal;
use crate::runtime::loader::LoadedModule;
use crate::utils::errors::{InterceptError, Result};
use tracing::debug;
use wasmtime::{Instance, Linker, Store};

/// Per-store host state
#[derive(Debug, Clone)]
pub struct GuestState {
    module: String,
}

impl GuestState {
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
        }
    }

    /// Name of the module this store runs
    pub fn module(&self) -> &str {
        &self.module
    }
}

/// An instantiated guest module
pub struct GuestInstance {
    name: String,
    store: Store<GuestState>,
    instance: Instance,
}

impl GuestInstance {
    /// Instantiate `loaded`, running its start function if it has one
    pub fn instantiate(linker: &Linker<GuestState>, loaded: &LoadedModule) -> Result<Self> {
        let mut store = Store::new(linker.engine(), GuestState::new(loaded.name()));

        let instance = linker
            .instantiate(&mut store, loaded.module())
            .map_err(|e| classify_trap(loaded.name(), e))?;

        debug!("Instantiated guest {}", loaded.name());

        Ok(Self {
            name: loaded.name().to_string(),
            store,
            instance,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call an exported `() -> ()` function
    pub fn invoke(&mut self, export: &str) -> Result<()> {
        let func = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, export)
            .map_err(|e| InterceptError::LinkFailed(format!("{}.{}: {:#}", self.name, export, e)))?;

        debug!("Invoking {}.{}", self.name, export);
        func.call(&mut self.store, ())
            .map_err(|e| classify_trap(&self.name, e))
    }

    /// Call an exported `(i32) -> ()` function
    pub fn invoke_with(&mut self, export: &str, arg: i32) -> Result<()> {
        let func = self
            .instance
            .get_typed_func::<i32, ()>(&mut self.store, export)
            .map_err(|e| InterceptError::LinkFailed(format!("{}.{}: {:#}", self.name, export, e)))?;

        debug!("Invoking {}.{}({})", self.name, export, arg);
        func.call(&mut self.store, arg)
            .map_err(|e| classify_trap(&self.name, e))
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("name", &self.name)
            .finish()
    }
}

/// Map a runtime error to an intercepted exit or a guest failure
pub(crate) fn classify_trap(module: &str, error: anyhow::Error) -> InterceptError {
    match error.chain().find_map(|cause| cause.downcast_ref::<ExitSignal>()) {
        Some(signal) => InterceptError::Exited(*signal),
        None => InterceptError::GuestError(format!("{}: {:#}", module, error)),
    }
}
