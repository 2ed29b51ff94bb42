//! Host-level errors.
//!
//! Script-level failures are exception [`Value`](crate::value::Value)s and
//! never appear here. These types cover bugs in generated code, building
//! bytecode, and loading programs or configuration from disk.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Internal consistency violations detected while running bytecode.
///
/// These are never routed to a script's handler contexts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("label '{label}' not found in bytecode for '{owner}'")]
    LabelNotFound { owner: String, label: String },
    #[error("leave context with no active context in '{owner}'")]
    ContextUnderflow { owner: String },
}

/// Misuse of [`BytecodeBuilder`](crate::vm::BytecodeBuilder).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("label '{0}' is defined more than once")]
    DuplicateLabel(String),
    #[error("labels {0:?} were never attached to an instruction")]
    UnresolvedLabels(Vec<String>),
    #[error("jump to undefined label '{0}'")]
    UndefinedLabel(String),
    #[error("no deferred block is open")]
    NoOpenBlock,
    #[error("no deferred block to pop")]
    NoDeferredBlock,
    #[error("no bookmark set")]
    NoBookmark,
    #[error("bookmark at {bookmark} is past the end of a block of {len} instructions")]
    StaleBookmark { bookmark: usize, len: usize },
    #[error("{0} deferred block(s) still open")]
    UnclosedBlocks(usize),
    #[error("{0} deferred block(s) never spliced back in")]
    UnsplicedBlocks(usize),
}

/// Semantic errors in a program document.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("{script}[{index}]: unknown instruction '{op}'")]
    UnknownOp {
        script: String,
        index: usize,
        op: String,
    },
    #[error("{script}[{index}]: '{op}' needs {what}")]
    MissingOperand {
        script: String,
        index: usize,
        op: String,
        what: &'static str,
    },
    #[error("{script}[{index}]: bad operand for '{op}': {reason}")]
    BadOperand {
        script: String,
        index: usize,
        op: String,
        reason: String,
    },
    #[error("function '{0}' is defined more than once")]
    DuplicateFunction(String),
    #[error("{script}: {source}")]
    Build {
        script: String,
        #[source]
        source: BuildError,
    },
}

/// Failure to read a program or configuration file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid TOML in '{path}': {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid JSON in '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot tell the format of '{0}' (expected .toml or .json)")]
    UnknownFormat(PathBuf),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
}
