// src/runtime/mod.rs
//! Guest runtime and test lifecycle
//!
//! - **Loader**: compiles modules, running registered transformers first
//! - **Guest**: instantiates and calls into a module
//! - **Declaration**: what a test expects of termination
//! - **Lifecycle**: arms, runs, captures, verifies and cleans up one test
//! - **Assertions**: panicking helpers for plain `#[test]` functions

pub mod assertions;
pub mod declaration;
pub mod guest;
pub mod lifecycle;
pub mod loader;

pub use assertions::{assert_calls_exit, assert_does_not_call_exit, ExitAssertion};
pub use declaration::{Cardinality, ExitDeclaration, ExpectedCodes};
pub use guest::{GuestInstance, GuestState};
pub use lifecycle::{ExitTest, LeakPolicy, Outcome, Phase, TestReport};
pub use loader::{LoadedModule, ModuleLoader, ModuleTransformer};
