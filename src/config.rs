//! Runtime configuration and logging setup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::LoadError;
use crate::vm::{DEFAULT_MAX_DEPTH, ExitSignal, VmOptions};

/// Log filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Log every executed instruction.
    pub trace: bool,
    /// Log every operand and context stack operation.
    pub debug_stacks: bool,
    /// Nested VM executions allowed per thread.
    pub max_stack_depth: usize,
    pub log_filter: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace: false,
            debug_stacks: false,
            max_stack_depth: DEFAULT_MAX_DEPTH,
            log_filter: None,
        }
    }
}

impl RuntimeConfig {
    /// Looked up in the working directory when no file is given.
    pub const FILE_NAME: &'static str = "kestrel.toml";

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| LoadError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `explicit`, else `kestrel.toml` if present, else the defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, LoadError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let local = PathBuf::from(Self::FILE_NAME);
        if local.is_file() {
            Self::load(&local)
        } else {
            Ok(Self::default())
        }
    }

    pub fn vm_options(&self) -> VmOptions {
        VmOptions {
            trace: self.trace,
            debug_stacks: self.debug_stacks,
            max_depth: self.max_stack_depth,
            exit_signal: ExitSignal::global(),
        }
    }
}

/// Install the stderr log subscriber.
///
/// `RUST_LOG` wins over `filter`, which wins over [`DEFAULT_LOG_FILTER`].
/// Calling this more than once is harmless.
pub fn init_logging(filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_LOG_FILTER)));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
