//! Kestrel - a stack-based bytecode VM with a dynamic value system.
//!
//! Programs are assembled from TOML or JSON documents (see [`asm`]) into
//! [`Script`]s, which run as closures on the [`VM`].

pub mod asm;
pub mod config;
pub mod debugger;
pub mod error;
pub mod runtime;
pub mod value;
pub mod vm;

pub use config::RuntimeConfig;
pub use error::{AssemblyError, BuildError, FatalError, LoadError};
pub use runtime::{Closure, Script, ScriptKind};
pub use value::{ErrorCode, Kwargs, Value};
pub use vm::{Bytecode, BytecodeBuilder, VM};
