// src/runtime/loader.rs
//! Module loader
//!
//! All guest code enters the runtime here. Registered transformers see the
//! binary form of every module before it is compiled and may hand back a
//! replacement; a transformer returning `None` leaves the module as it is.

use crate::utils::errors::{InterceptError, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use wasmtime::{Engine, Module};

static GLOBAL_LOADER: Lazy<Arc<ModuleLoader>> =
    Lazy::new(|| Arc::new(ModuleLoader::new(Engine::default())));

/// Load-time hook over raw module bytes
pub trait ModuleTransformer: Send + Sync {
    /// Return replacement bytes, or `None` to keep the module unchanged
    fn transform(&self, module_name: &str, bytes: &[u8]) -> Option<Vec<u8>>;
}

/// A compiled module and where it came from
#[derive(Clone)]
pub struct LoadedModule {
    name: String,
    module: Module,
    transformed: bool,
}

impl LoadedModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Whether a transformer replaced the module bytes
    pub fn is_transformed(&self) -> bool {
        self.transformed
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("transformed", &self.transformed)
            .finish()
    }
}

/// Compiles guest modules, running every registered transformer first
pub struct ModuleLoader {
    engine: Engine,
    transformers: RwLock<Vec<Arc<dyn ModuleTransformer>>>,
}

impl ModuleLoader {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            transformers: RwLock::new(Vec::new()),
        }
    }

    /// Process-wide loader used by the attached agent
    pub fn global() -> Arc<ModuleLoader> {
        Arc::clone(&GLOBAL_LOADER)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Register a transformer; it applies to every later load
    pub fn add_transformer(&self, transformer: Arc<dyn ModuleTransformer>) {
        let mut transformers = self.transformers.write();
        transformers.push(transformer);
        debug!("Registered module transformer #{}", transformers.len());
    }

    pub fn transformer_count(&self) -> usize {
        self.transformers.read().len()
    }

    /// Load a module from binary or text form
    pub fn load(&self, module_name: &str, bytes: &[u8]) -> Result<LoadedModule> {
        let binary = wat::parse_bytes(bytes)
            .map_err(|e| InterceptError::ModuleLoadFailed(format!("{}: {}", module_name, e)))?;

        let transformers = self.transformers.read().clone();
        let mut current: Cow<'_, [u8]> = binary;
        let mut transformed = false;

        for transformer in &transformers {
            if let Some(replacement) = transformer.transform(module_name, &current) {
                current = Cow::Owned(replacement);
                transformed = true;
            }
        }

        let module = Module::new(&self.engine, &current).map_err(|e| {
            InterceptError::ModuleLoadFailed(format!("{}: {:#}", module_name, e))
        })?;

        debug!(
            "Loaded module {} ({} bytes, transformed: {})",
            module_name,
            current.len(),
            transformed
        );

        Ok(LoadedModule {
            name: module_name.to_string(),
            module,
            transformed,
        })
    }

    /// Load a module file, naming it after its path
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<LoadedModule> {
        let path = path.as_ref();
        self.load_file_as(&module_name_for_path(path), path)
    }

    /// Load a module file under an explicit module name
    pub fn load_file_as(&self, module_name: &str, path: impl AsRef<Path>) -> Result<LoadedModule> {
        let path = path.as_ref();
        info!("Loading {} from {:?}", module_name, path);
        let bytes = std::fs::read(path)?;
        self.load(module_name, &bytes)
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new(Engine::default())
    }
}

/// Policy name for a module file: the path without extension, `/`-separated
pub fn module_name_for_path(path: &Path) -> String {
    let stripped = path.with_extension("");
    let name = stripped.to_string_lossy().replace('\\', "/");
    name.trim_start_matches("./").trim_start_matches('/').to_string()
}
