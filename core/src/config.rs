//! Runner configuration
//!
//! A small TOML document with camelCase keys; every field has a default, so
//! an empty file is valid:
//!
//! ```toml
//! shellPath = "/bin/sh"
//! dispatcher = "/usr/local/bin/forkline"
//! controlDir = ".git"
//! indexEnvVar = "GIT_INDEX_FILE"
//! defaultPath = "/usr/bin:/bin"
//! ```
//!
//! `FORKLINE_SHELL`, `FORKLINE_DISPATCHER` and `FORKLINE_CONTROL_DIR`
//! override the file. The process-wide copy is set once with [`install`].

use crate::{Result, RunError};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Settings the runner and the hook invoker read
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// Absolute path of the POSIX shell used for `use_shell` commands
    pub shell_path: String,

    /// Program trusted commands are routed through; the current executable
    /// when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatcher: Option<PathBuf>,

    /// Repository control directory; hooks live in `<controlDir>/hooks`
    pub control_dir: PathBuf,

    /// Variable naming the alternate index for `run_hook_with_custom_index`
    pub index_env_var: String,

    /// Search path for children whose environment has no `PATH`
    pub default_path: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell_path: "/bin/sh".to_string(),
            dispatcher: None,
            control_dir: PathBuf::from(".git"),
            index_env_var: "GIT_INDEX_FILE".to_string(),
            default_path: "/usr/bin:/bin".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Validate the configuration and return field-path errors
    pub fn validate(&self) -> Result<()> {
        if !self.shell_path.starts_with('/') {
            return Err(RunError::Configuration(format!(
                "shellPath: must be absolute, got '{}'",
                self.shell_path
            )));
        }
        if let Some(dispatcher) = &self.dispatcher {
            if dispatcher.as_os_str().is_empty() {
                return Err(RunError::Configuration(
                    "dispatcher: cannot be empty".to_string(),
                ));
            }
        }
        if self.control_dir.as_os_str().is_empty() {
            return Err(RunError::Configuration(
                "controlDir: cannot be empty".to_string(),
            ));
        }
        if self.index_env_var.is_empty() || self.index_env_var.contains('=') {
            return Err(RunError::Configuration(format!(
                "indexEnvVar: '{}' is not a valid variable name",
                self.index_env_var
            )));
        }
        Ok(())
    }

    /// Apply `FORKLINE_*` environment overrides on top of this configuration
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(shell) = env::var("FORKLINE_SHELL") {
            self.shell_path = shell;
        }
        if let Some(dispatcher) = env::var_os("FORKLINE_DISPATCHER") {
            self.dispatcher = Some(PathBuf::from(dispatcher));
        }
        if let Some(dir) = env::var_os("FORKLINE_CONTROL_DIR") {
            self.control_dir = PathBuf::from(dir);
        }
        self
    }

    /// Directory hooks are looked up in
    pub fn hooks_dir(&self) -> PathBuf {
        self.control_dir.join("hooks")
    }

    /// The program trusted commands are executed through
    pub fn dispatcher_program(&self) -> Result<String> {
        let path = match &self.dispatcher {
            Some(path) => path.clone(),
            None => env::current_exe().map_err(|e| {
                RunError::Configuration(format!("cannot locate current executable: {}", e))
            })?,
        };
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Load a runner config from a TOML file path
pub fn load_from_toml_path(path: impl AsRef<Path>) -> Result<RunnerConfig> {
    let data = fs::read_to_string(&path).map_err(|e| {
        RunError::Configuration(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_from_toml_str(&data)
}

/// Load a runner config from a TOML string
pub fn load_from_toml_str(input: &str) -> Result<RunnerConfig> {
    let cfg: RunnerConfig = toml::from_str(input)
        .map_err(|e| RunError::Configuration(format!("TOML parse error: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}

static CURRENT: OnceLock<RunnerConfig> = OnceLock::new();

/// Make `cfg` the process-wide configuration.
///
/// Only the first install takes effect; returns false if one was already
/// in place (or the defaults were already read).
pub fn install(cfg: RunnerConfig) -> bool {
    let installed = CURRENT.set(cfg).is_ok();
    if installed {
        debug!("runner configuration installed");
    }
    installed
}

/// The process-wide configuration, defaults if nothing was installed
pub fn current() -> &'static RunnerConfig {
    CURRENT.get_or_init(RunnerConfig::default)
}
