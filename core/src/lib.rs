//! Process-execution core for the forkline toolset
//!
//! Launches, wires, supervises and reaps external programs: the toolset's
//! own sub-commands, user hooks and shell snippets.
//!
//! - [`command`]: describe a child ([`ChildProcess`]), start it, finish it
//! - [`async_task`]: background work on a thread or in a forked child
//! - [`hook`]: optional executables under `<controlDir>/hooks`
//! - [`cleanup`]: children that must not outlive us
//! - [`path`], [`shell`], [`env`]: preparing what gets exec'd
//! - [`fatal`]: the `fatal: ...` / exit 128 convention
//!
//! Unix only.

pub mod async_task;
pub mod cleanup;
pub mod command;
pub mod config;
pub mod env;
pub mod error;
mod exec;
pub mod fatal;
pub mod hook;
pub mod logging;
pub mod path;
pub mod shell;
pub mod sigchain;
pub mod status;


pub use async_task::{
    finish_async, start_async, start_async_with, AsyncBackend, AsyncTask, Channel,
    DefaultBackend, Forked, RunningTask, TaskIo, Threaded,
};
pub use command::{
    finish_command, run_argv, run_command, start_command, Child, ChildProcess, RunOptions, Stdio,
};
pub use config::RunnerConfig;
pub use error::{Result, RunError, StreamName};
pub use fatal::{die, die_errno, report_error, FatalError, FATAL_EXIT_CODE};
pub use hook::{find_hook, run_hook, run_hook_with_custom_index, Hooks};
pub use logging::init_tracing;
pub use path::{exists_in_path, locate_in_path};
pub use status::ExitStatus;
