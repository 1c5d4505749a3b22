//! Launching a child and waiting for it
//!
//! A [`ChildProcess`] describes one invocation and owns no OS resources.
//! [`start_command`] consumes it and returns a running [`Child`] once the
//! program has been exec'd (or fails without leaving a process behind);
//! [`Child::finish`] consumes that and reaps the process. The descriptor can
//! therefore go unstarted → running → finished only once.
//!
//! ## Launch sequence
//!
//! 1. create the requested pipes (close-on-exec, so concurrent launches from
//!    other threads never inherit them)
//! 2. prepare argv, environment and search-path candidates for the child
//! 3. fork; the child wires up fds, changes directory and execs
//!    (see the `exec` module)
//! 4. the parent registers the pid for cleanup, closes the child's pipe ends
//!    and waits on the notification pipe: EOF means exec succeeded, five
//!    bytes mean it did not and why
//!
//! ## Example
//!
//! ```rust,no_run
//! use forkline_core::{ChildProcess, Stdio};
//! use std::io::Read;
//!
//! let mut child = ChildProcess::new("echo")
//!     .arg("hi")
//!     .stdout(Stdio::Pipe)
//!     .start()?;
//! let mut out = String::new();
//! child.stdout.take().unwrap().read_to_string(&mut out)?;
//! assert_eq!(out, "hi\n");
//! assert!(child.finish()?.success());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![allow(unsafe_code)]

use crate::cleanup;
use crate::config;
use crate::error::StreamName;
use crate::exec::{self, ChildFds, ChildReport, ExecPlan, Redirect};
use crate::fatal::report_error;
use crate::path;
use crate::shell;
use crate::status::ExitStatus;
use crate::{Result, RunError};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What to connect one of the child's standard streams to
#[derive(Debug, Default)]
pub enum Stdio {
    /// Share the parent's stream
    #[default]
    Inherit,
    /// `/dev/null`
    Null,
    /// A descriptor the caller already has. The runner takes ownership and
    /// closes its copy once the child is launched (or the launch failed).
    Fd(OwnedFd),
    /// A new pipe; the child gets one end on fd 0/1/2, the caller the other
    Pipe,
}

impl From<OwnedFd> for Stdio {
    fn from(fd: OwnedFd) -> Self {
        Stdio::Fd(fd)
    }
}

impl From<File> for Stdio {
    fn from(file: File) -> Self {
        Stdio::Fd(OwnedFd::from(file))
    }
}

/// Description of one subprocess invocation
#[derive(Debug, Default)]
pub struct ChildProcess {
    /// Program name (or shell snippet) followed by its arguments
    pub argv: Vec<String>,
    /// `KEY=VALUE` to set, bare `KEY` to unset, applied in order
    pub env: Vec<String>,
    /// Working directory for the child
    pub dir: Option<PathBuf>,
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
    /// Run `argv[0]` through the shell if it has metacharacters
    pub use_shell: bool,
    /// Route through the toolset's own dispatcher instead of `$PATH`
    pub trusted: bool,
    /// Send stdout wherever stderr goes
    pub stdout_to_stderr: bool,
    /// Do not report "cannot run" when the program does not exist
    pub silent_exec_failure: bool,
    /// Signal the child if we exit or die first
    pub clean_on_exit: bool,
}

impl ChildProcess {
    /// Start describing a run of `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            ..Self::default()
        }
    }

    /// Describe a run of a complete argument vector
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment override (`KEY=VALUE` or bare `KEY`)
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = stdio;
        self
    }

    pub fn stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = stdio;
        self
    }

    pub fn stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = stdio;
        self
    }

    pub fn use_shell(mut self, yes: bool) -> Self {
        self.use_shell = yes;
        self
    }

    pub fn trusted(mut self, yes: bool) -> Self {
        self.trusted = yes;
        self
    }

    pub fn stdout_to_stderr(mut self, yes: bool) -> Self {
        self.stdout_to_stderr = yes;
        self
    }

    pub fn silent_exec_failure(mut self, yes: bool) -> Self {
        self.silent_exec_failure = yes;
        self
    }

    pub fn clean_on_exit(mut self, yes: bool) -> Self {
        self.clean_on_exit = yes;
        self
    }

    /// Check the description is launchable
    pub fn validate(&self) -> Result<()> {
        if self.argv.is_empty() {
            return Err(RunError::InvalidCommand("argv: cannot be empty".to_string()));
        }
        for (i, entry) in self.env.iter().enumerate() {
            if entry.is_empty() || entry.starts_with('=') {
                return Err(RunError::InvalidCommand(format!(
                    "env[{}]: '{}' has no variable name",
                    i, entry
                )));
            }
        }
        if self.stdout_to_stderr && !matches!(self.stdout, Stdio::Inherit) {
            return Err(RunError::InvalidCommand(
                "stdout: cannot be redirected when merged into stderr".to_string(),
            ));
        }
        Ok(())
    }

    /// See [`start_command`]
    pub fn start(self) -> Result<Child> {
        start_command(self)
    }

    /// See [`run_command`]
    pub fn run(self) -> Result<ExitStatus> {
        run_command(self)
    }
}

/// A launched child, until it is reaped with [`Child::finish`]
#[derive(Debug)]
pub struct Child {
    pid: Pid,
    program: String,
    /// Write end of the child's stdin, when [`Stdio::Pipe`] was requested
    pub stdin: Option<File>,
    /// Read end of the child's stdout, when [`Stdio::Pipe`] was requested
    pub stdout: Option<File>,
    /// Read end of the child's stderr, when [`Stdio::Pipe`] was requested
    pub stderr: Option<File>,
}

impl Child {
    /// The child's process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The command name used in diagnostics
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Close any pipe ends still held, wait for the child and deregister it.
    ///
    /// Exit code 127 (the shell's "command not found") comes back as
    /// [`RunError::NotFound`], never as an exit status.
    pub fn finish(mut self) -> Result<ExitStatus> {
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();
        wait_or_whine(self.pid, &self.program)
    }
}

/// Launch `cmd`. Returns once the program runs, or fails with no process
/// left behind.
pub fn start_command(cmd: ChildProcess) -> Result<Child> {
    cmd.validate()?;
    let cfg = config::current();
    let program = cmd.argv[0].clone();

    let stdin = Wiring::new(cmd.stdin, StreamName::Stdin, &program)?;
    let stdout = Wiring::new(cmd.stdout, StreamName::Stdout, &program)?;
    let stderr = Wiring::new(cmd.stderr, StreamName::Stderr, &program)?;

    let argv = if cmd.trusted {
        shell::prepare_trusted_cmd(&cmd.argv, &cfg.dispatcher_program()?)
    } else if cmd.use_shell {
        shell::prepare_shell_cmd(&cmd.argv, &cfg.shell_path)
    } else {
        cmd.argv.clone()
    };
    let plan = ExecPlan::new(
        &argv,
        &program,
        &cmd.env,
        cmd.dir.as_deref(),
        &cfg.default_path,
        &cfg.shell_path,
    )?
    .silent_exec_failure(cmd.silent_exec_failure);
    debug!(
        "trace: run_command: {:?}",
        plan.argv().collect::<Vec<_>>()
    );

    let notify = match exec::cloexec_pipe() {
        Ok(pair) => Some(pair),
        Err(e) => {
            warn!("cannot create exec notification pipe for {}: {}", program, e);
            None
        }
    };

    let fds = ChildFds {
        stdin: stdin.redirect,
        stdout: stdout.redirect,
        stderr: stderr.redirect,
        stdout_to_stderr: cmd.stdout_to_stderr,
        dup_diagnostics: stderr.redirect == Redirect::Null || stderr.caller_end.is_some(),
        close_after_redirect: [&stdin, &stdout, &stderr]
            .into_iter()
            .flat_map(Wiring::raw_fds)
            .collect(),
        notify_read: notify.as_ref().map(|(read, _)| read.as_raw_fd()),
        notify_write: notify.as_ref().map(|(_, write)| write.as_raw_fd()),
    };

    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    // Safety: the child runs only exec_child, which makes async-signal-safe
    // system calls on data prepared above and never returns.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => unsafe { exec::exec_child(&plan, &fds) },
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            report_error(format_args!("cannot fork() for {}: {}", program, e.desc()));
            return Err(RunError::Fork { program, source: e });
        }
    };
    if cmd.clean_on_exit {
        cleanup::register(pid);
    }
    debug!("started {} as pid {}", program, pid);

    if let Some((read, write)) = notify {
        drop(write);
        if let Some(report) = read_report(read) {
            reap_failed(pid, &program);
            return Err(launch_error(report, &plan, cmd.silent_exec_failure));
        }
    }

    // The child's pipe ends (and caller-supplied fds) close when the
    // wirings drop; the caller keeps only its own ends.
    Ok(Child {
        pid,
        program,
        stdin: stdin.into_caller_end(),
        stdout: stdout.into_caller_end(),
        stderr: stderr.into_caller_end(),
    })
}

/// Wait for a child started by [`start_command`]; same as [`Child::finish`]
pub fn finish_command(child: Child) -> Result<ExitStatus> {
    child.finish()
}

/// [`start_command`], then [`Child::finish`] if the launch worked
pub fn run_command(cmd: ChildProcess) -> Result<ExitStatus> {
    start_command(cmd)?.finish()
}

/// Flag-style options for [`run_argv`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub no_stdin: bool,
    pub trusted: bool,
    pub stdout_to_stderr: bool,
    pub silent_exec_failure: bool,
    pub use_shell: bool,
    pub clean_on_exit: bool,
}

/// Run `argv` with `opts`, an optional working directory and environment
/// overrides; every stream not covered by `opts` is inherited.
pub fn run_argv<S: AsRef<str>>(
    argv: &[S],
    opts: RunOptions,
    dir: Option<&Path>,
    env: &[String],
) -> Result<ExitStatus> {
    let mut cmd = ChildProcess::from_argv(argv.iter().map(|a| a.as_ref().to_string()));
    if opts.no_stdin {
        cmd.stdin = Stdio::Null;
    }
    cmd.trusted = opts.trusted;
    cmd.stdout_to_stderr = opts.stdout_to_stderr;
    cmd.silent_exec_failure = opts.silent_exec_failure;
    cmd.use_shell = opts.use_shell;
    cmd.clean_on_exit = opts.clean_on_exit;
    cmd.dir = dir.map(Path::to_path_buf);
    cmd.env = env.to_vec();
    run_command(cmd)
}

/// Wait for `pid`, deregister it and translate how it ended.
///
/// Exit code 127 means the shell (or the child itself) could not find the
/// program and becomes [`RunError::NotFound`].
pub(crate) fn wait_or_whine(pid: Pid, program: &str) -> Result<ExitStatus> {
    match reap(pid, program)? {
        ExitStatus::Exited(exec::EXEC_FAILED_EXIT_CODE) => Err(RunError::NotFound {
            program: program.to_string(),
        }),
        status => Ok(status),
    }
}

/// Wait for `pid` and deregister it; an exit code is passed through as is.
pub(crate) fn reap(pid: Pid, program: &str) -> Result<ExitStatus> {
    let waited = wait_for(pid);
    cleanup::deregister(pid);

    match waited {
        Err(e) => {
            report_error(format_args!("waitpid for {} failed: {}", program, e.desc()));
            Err(RunError::Wait {
                program: program.to_string(),
                source: e,
            })
        }
        Ok(WaitStatus::Signaled(waited, signal, _)) if waited == pid => {
            if signal != Signal::SIGINT && signal != Signal::SIGQUIT {
                report_error(format_args!("{} died of signal {}", program, signal as i32));
            }
            Ok(ExitStatus::Signaled(signal))
        }
        Ok(WaitStatus::Exited(waited, code)) if waited == pid => Ok(ExitStatus::Exited(code)),
        Ok(_) => {
            report_error(format_args!("waitpid is confused ({})", program));
            Err(RunError::WaitConfused {
                program: program.to_string(),
            })
        }
    }
}

fn wait_for(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Reap a child that reported a launch failure; its status says nothing new.
fn reap_failed(pid: Pid, program: &str) {
    if let Err(e) = wait_for(pid) {
        report_error(format_args!("waitpid for {} failed: {}", program, e.desc()));
    }
    cleanup::deregister(pid);
}

fn read_report(read: OwnedFd) -> Option<ChildReport> {
    let mut bytes = Vec::with_capacity(8);
    match File::from(read).read_to_end(&mut bytes) {
        Ok(_) => ChildReport::decode(&bytes),
        Err(e) => {
            warn!("cannot read exec notification pipe: {}", e);
            None
        }
    }
}

fn launch_error(report: ChildReport, plan: &ExecPlan, silent: bool) -> RunError {
    let program = plan.program().to_string();
    match report {
        ChildReport::Exec(errno) => {
            let errno = path::normalize_exec_errno(&plan.exec_name(), errno, plan.search_path());
            if errno == Errno::ENOENT {
                if !silent {
                    report_error(format_args!("cannot run {}: {}", program, errno.desc()));
                }
                RunError::NotFound { program }
            } else {
                report_error(format_args!("cannot exec '{}': {}", program, errno.desc()));
                RunError::Exec {
                    program,
                    source: errno,
                }
            }
        }
        // The child already said what went wrong on its stderr.
        ChildReport::Chdir(errno) => RunError::ChildSetup {
            program,
            source: errno,
        },
        ChildReport::Redirect(errno) => {
            report_error(format_args!(
                "cannot set up standard streams for {}: {}",
                program,
                errno.desc()
            ));
            RunError::ChildSetup {
                program,
                source: errno,
            }
        }
    }
}

/// One standard stream, resolved into what the child gets and what the
/// caller keeps
struct Wiring {
    redirect: Redirect,
    caller_end: Option<OwnedFd>,
    child_end: Option<OwnedFd>,
}

impl Wiring {
    fn new(stdio: Stdio, stream: StreamName, program: &str) -> Result<Self> {
        let wiring = match stdio {
            Stdio::Inherit => Self {
                redirect: Redirect::Inherit,
                caller_end: None,
                child_end: None,
            },
            Stdio::Null => Self {
                redirect: Redirect::Null,
                caller_end: None,
                child_end: None,
            },
            Stdio::Fd(fd) => Self {
                redirect: Redirect::Dup(fd.as_raw_fd()),
                caller_end: None,
                child_end: Some(fd),
            },
            Stdio::Pipe => {
                let (read, write) = exec::cloexec_pipe().map_err(|e| {
                    report_error(format_args!(
                        "cannot create {} pipe for {}: {}",
                        stream,
                        program,
                        e.desc()
                    ));
                    RunError::Pipe {
                        stream,
                        program: program.to_string(),
                        source: e,
                    }
                })?;
                let (caller, child) = match stream {
                    StreamName::Stdin => (write, read),
                    StreamName::Stdout | StreamName::Stderr => (read, write),
                };
                Self {
                    redirect: Redirect::Dup(child.as_raw_fd()),
                    caller_end: Some(caller),
                    child_end: Some(child),
                }
            }
        };
        Ok(wiring)
    }

    fn raw_fds(&self) -> impl Iterator<Item = std::os::fd::RawFd> + '_ {
        self.caller_end
            .iter()
            .chain(self.child_end.iter())
            .map(AsRawFd::as_raw_fd)
    }

    fn into_caller_end(self) -> Option<File> {
        self.caller_end.map(File::from)
    }
}
