//! Front-end operations behind the `forkline` subcommands
//!
//! Each operation returns the exit code the process should leave with; a
//! child's exit code is passed through, a signal becomes `128 + N`.

pub mod error;

pub use error::{CliError, Result};

use forkline_core::config::{self, RunnerConfig};
use forkline_core::{hook, path, run_argv, RunError, RunOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Load the runner configuration: `file` if given, else defaults, then
/// `FORKLINE_*` overrides.
pub fn load_config(file: Option<&Path>) -> Result<RunnerConfig> {
    let cfg = match file {
        Some(path) => config::load_from_toml_path(path).map_err(config_error)?,
        None => RunnerConfig::default(),
    };
    let cfg = cfg.apply_env_overrides();
    cfg.validate().map_err(config_error)?;
    Ok(cfg)
}

fn config_error(e: RunError) -> CliError {
    match e {
        RunError::Configuration(msg) => CliError::ConfigError(msg),
        other => CliError::Run(other),
    }
}

/// Parameters of `forkline run`
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub options: RunOptions,
    pub dir: Option<PathBuf>,
    pub env: Vec<String>,
}

/// Run a command to completion
pub fn run(request: &RunRequest) -> Result<i32> {
    if request.argv.is_empty() {
        return Err(CliError::InvalidArgument(
            "run: no command given".to_string(),
        ));
    }
    debug!("run {:?} with {:?}", request.argv, request.options);
    let status = run_argv(
        &request.argv,
        request.options,
        request.dir.as_deref(),
        &request.env,
    )?;
    Ok(status.code())
}

/// Run a hook, optionally pointing the index variable at `index_file`
pub fn run_hook(name: &str, index_file: Option<&Path>, args: &[String]) -> Result<i32> {
    let status = match index_file {
        Some(index) => hook::run_hook_with_custom_index(index, name, args)?,
        None => hook::run_hook(&[], name, args)?,
    };
    Ok(status.code())
}

/// Where `name` would be found on `PATH`
pub fn which(name: &str) -> Result<PathBuf> {
    path::locate_in_path(name).ok_or_else(|| CliError::NotInPath(name.to_string()))
}
