//! Background tasks with a pipe channel
//!
//! An [`AsyncTask`] is a work function plus up to two channel endpoints:
//! `input` (the caller writes, the task reads) and `output` (the task writes,
//! the caller reads). Where the work runs is decided by an [`AsyncBackend`]:
//!
//! - [`Threaded`]: a worker thread in this process. A fatal error raised on
//!   the worker (see [`crate::fatal::die`]) ends only that worker; its
//!   endpoints are closed on the way out so the caller sees EOF, and joining
//!   reports 128.
//! - [`Forked`]: a forked copy of this process that runs the work function
//!   and exits with its return code. Only sound while the parent has no
//!   other threads, since the child keeps running arbitrary code after fork.
//!
//! [`DefaultBackend`] is fixed per build: `Threaded` unless the crate is
//! built with the `fork-async` feature.

#![allow(unsafe_code)]

use crate::cleanup;
use crate::command;
use crate::error::StreamName;
use crate::exec;
use crate::fatal::{self, report_error, FatalError, FATAL_EXIT_CODE};
use crate::{Result, RunError};
use nix::unistd::{fork, ForkResult, Pid};
use std::fs::File;
use std::io::Write;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Name used in diagnostics about async tasks
const TASK_NAME: &str = "async task";

/// How one direction of the task's channel is provided
#[derive(Debug, Default)]
pub enum Channel {
    /// No endpoint in this direction
    #[default]
    None,
    /// Create a pipe; the task gets one end, the caller the other
    Pipe,
    /// The task uses this descriptor directly; the caller gets nothing
    Fd(OwnedFd),
}

/// The task's side of its channel
#[derive(Debug, Default)]
pub struct TaskIo {
    /// What the caller sends to the task
    pub input: Option<File>,
    /// Where the task sends its results
    pub output: Option<File>,
}

/// A task's work function; its return value is the task's exit code
pub type Job = Box<dyn FnOnce(TaskIo) -> i32 + Send + 'static>;

/// A concurrency model for running an [`AsyncTask`]
pub trait AsyncBackend {
    /// Whatever is needed to join the task later
    type Handle;

    /// Start `job` with `io`. `caller_fds` are the caller's channel ends,
    /// which a task in another process must not keep open.
    fn launch(job: Job, io: TaskIo, caller_fds: &[RawFd]) -> Result<Self::Handle>;

    /// Block until the task is done and return its exit code
    fn join(handle: Self::Handle) -> Result<i32>;
}

/// Run tasks on worker threads
#[derive(Debug, Clone, Copy, Default)]
pub struct Threaded;

impl AsyncBackend for Threaded {
    type Handle = JoinHandle<i32>;

    fn launch(job: Job, io: TaskIo, _caller_fds: &[RawFd]) -> Result<Self::Handle> {
        fatal::install_async_handler();
        thread::Builder::new()
            .name("async-task".to_string())
            .spawn(move || supervise(job, io))
            .map_err(|e| {
                report_error(format_args!("cannot create async thread: {}", e));
                RunError::Thread(e)
            })
    }

    fn join(handle: Self::Handle) -> Result<i32> {
        handle.join().map_err(|_| {
            error!("pthread_join failed for {}", TASK_NAME);
            RunError::Join
        })
    }
}

/// Run the work function on the current (worker) thread, turning a fatal
/// error or panic into exit code 128. The task's endpoints are dropped
/// before this returns, whichever way the job ended.
fn supervise(job: Job, io: TaskIo) -> i32 {
    fatal::enter_async_worker();
    match panic::catch_unwind(AssertUnwindSafe(move || job(io))) {
        Ok(code) => code,
        Err(payload) => {
            match payload.downcast_ref::<FatalError>() {
                Some(fatal) => debug!("{} stopped: {}", TASK_NAME, fatal),
                None => error!("{} panicked", TASK_NAME),
            }
            FATAL_EXIT_CODE
        }
    }
}

/// Run tasks in forked child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct Forked;

impl AsyncBackend for Forked {
    type Handle = Pid;

    fn launch(job: Job, io: TaskIo, caller_fds: &[RawFd]) -> Result<Self::Handle> {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        // Safety: the child never returns into the caller; it runs the job
        // and leaves through _exit.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                for &fd in caller_fds {
                    unsafe { libc::close(fd) };
                }
                cleanup::forget_inherited();
                fatal::enter_forked_child();
                let code = panic::catch_unwind(AssertUnwindSafe(move || job(io)))
                    .unwrap_or(FATAL_EXIT_CODE);
                let _ = std::io::stdout().flush();
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                cleanup::register(child);
                debug!("started {} as pid {}", TASK_NAME, child);
                Ok(child)
            }
            Err(e) => {
                report_error(format_args!("fork (async) failed: {}", e.desc()));
                Err(RunError::Fork {
                    program: TASK_NAME.to_string(),
                    source: e,
                })
            }
        }
    }

    fn join(pid: Self::Handle) -> Result<i32> {
        command::reap(pid, TASK_NAME).map(|status| status.code())
    }
}

#[cfg(not(feature = "fork-async"))]
pub type DefaultBackend = Threaded;

#[cfg(feature = "fork-async")]
pub type DefaultBackend = Forked;

/// A background unit of work, not yet started
pub struct AsyncTask {
    job: Job,
    input: Channel,
    output: Channel,
}

impl std::fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTask")
            .field("input", &self.input)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl AsyncTask {
    pub fn new<F>(job: F) -> Self
    where
        F: FnOnce(TaskIo) -> i32 + Send + 'static,
    {
        Self {
            job: Box::new(job),
            input: Channel::None,
            output: Channel::None,
        }
    }

    pub fn input(mut self, channel: Channel) -> Self {
        self.input = channel;
        self
    }

    pub fn output(mut self, channel: Channel) -> Self {
        self.output = channel;
        self
    }

    /// Start on the build's [`DefaultBackend`]
    pub fn start(self) -> Result<RunningTask<DefaultBackend>> {
        start_async(self)
    }
}

/// A started task. [`RunningTask::finish`] must be called exactly once.
pub struct RunningTask<B: AsyncBackend = DefaultBackend> {
    handle: B::Handle,
    /// Caller's write end of the task's input pipe
    pub input: Option<File>,
    /// Caller's read end of the task's output pipe
    pub output: Option<File>,
    backend: PhantomData<B>,
}

impl<B: AsyncBackend> RunningTask<B> {
    /// Close the caller's channel ends that are still held, then wait for
    /// the task and return its exit code.
    pub fn finish(mut self) -> Result<i32> {
        self.input.take();
        self.output.take();
        B::join(self.handle)
    }
}

/// Start `task` on the build's [`DefaultBackend`]
pub fn start_async(task: AsyncTask) -> Result<RunningTask<DefaultBackend>> {
    start_async_with::<DefaultBackend>(task)
}

/// Start `task` on backend `B`
pub fn start_async_with<B: AsyncBackend>(task: AsyncTask) -> Result<RunningTask<B>> {
    let (task_in, caller_in) = open_channel(task.input, StreamName::Stdin)?;
    let (task_out, caller_out) = open_channel(task.output, StreamName::Stdout)?;

    let caller_fds: Vec<RawFd> = caller_in
        .iter()
        .chain(caller_out.iter())
        .map(AsRawFd::as_raw_fd)
        .collect();
    let io = TaskIo {
        input: task_in.map(File::from),
        output: task_out.map(File::from),
    };
    let handle = B::launch(task.job, io, &caller_fds)?;

    Ok(RunningTask {
        handle,
        input: caller_in.map(File::from),
        output: caller_out.map(File::from),
        backend: PhantomData,
    })
}

/// Wait for a started task; same as [`RunningTask::finish`]
pub fn finish_async<B: AsyncBackend>(task: RunningTask<B>) -> Result<i32> {
    task.finish()
}

/// Split one direction into (task end, caller end)
fn open_channel(
    channel: Channel,
    direction: StreamName,
) -> Result<(Option<OwnedFd>, Option<OwnedFd>)> {
    match channel {
        Channel::None => Ok((None, None)),
        Channel::Fd(fd) => Ok((Some(fd), None)),
        Channel::Pipe => {
            let (read, write) = exec::cloexec_pipe().map_err(|e| {
                report_error(format_args!("cannot create pipe for {}: {}", TASK_NAME, e.desc()));
                RunError::Pipe {
                    stream: direction,
                    program: TASK_NAME.to_string(),
                    source: e,
                }
            })?;
            match direction {
                StreamName::Stdin => Ok((Some(read), Some(write))),
                StreamName::Stdout | StreamName::Stderr => Ok((Some(write), Some(read))),
            }
        }
    }
}
