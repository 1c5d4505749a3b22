//! Optional user hooks under the control directory
//!
//! A hook is an executable at `<controlDir>/hooks/<name>`. A missing (or
//! non-executable) hook is not an error: running it succeeds without
//! starting anything. A hook that exists runs with stdin on `/dev/null` and
//! its stdout merged into stderr, so nothing it prints can be mistaken for
//! the caller's own output.

use crate::command::{ChildProcess, Stdio};
use crate::config::{self, RunnerConfig};
use crate::status::ExitStatus;
use crate::Result;
use nix::unistd::{access, AccessFlags};
use std::path::{Path, PathBuf};
use tracing::debug;

/// The hooks directory of one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hooks {
    dir: PathBuf,
}

impl Hooks {
    /// Hooks of the repository whose control directory is `control_dir`
    pub fn new(control_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: control_dir.as_ref().join("hooks"),
        }
    }

    pub fn from_config(cfg: &RunnerConfig) -> Self {
        Self { dir: cfg.hooks_dir() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of hook `name` if it exists and is executable
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        if path.is_file() && access(&path, AccessFlags::X_OK).is_ok() {
            Some(path)
        } else {
            None
        }
    }

    /// Run hook `name` with `args` and environment overrides `env`.
    ///
    /// Returns success without starting a process when there is no such hook.
    pub fn run<S: AsRef<str>>(&self, env: &[String], name: &str, args: &[S]) -> Result<ExitStatus> {
        let Some(path) = self.find(name) else {
            debug!("no {} hook in {}", name, self.dir.display());
            return Ok(ExitStatus::Exited(0));
        };

        debug!("running {} hook: {}", name, path.display());
        let mut cmd = ChildProcess::new(path.to_string_lossy())
            .args(args.iter().map(|a| a.as_ref().to_string()))
            .stdin(Stdio::Null)
            .stdout_to_stderr(true);
        cmd.env = env.to_vec();
        cmd.run()
    }
}

/// [`Hooks::find`] in the configured control directory
pub fn find_hook(name: &str) -> Option<PathBuf> {
    Hooks::from_config(config::current()).find(name)
}

/// [`Hooks::run`] in the configured control directory
pub fn run_hook<S: AsRef<str>>(env: &[String], name: &str, args: &[S]) -> Result<ExitStatus> {
    Hooks::from_config(config::current()).run(env, name, args)
}

/// Run a hook with the configured index variable pointing at `index_file`
pub fn run_hook_with_custom_index<S: AsRef<str>>(
    index_file: &Path,
    name: &str,
    args: &[S],
) -> Result<ExitStatus> {
    let cfg = config::current();
    let env = vec![format!("{}={}", cfg.index_env_var, index_file.display())];
    Hooks::from_config(cfg).run(&env, name, args)
}
