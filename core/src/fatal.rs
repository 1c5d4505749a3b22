//! The toolset's fatal-error convention
//!
//! [`die`] prints `fatal: <message>` and ends the current unit of work with
//! status 128. What "unit of work" means depends on where it is called:
//!
//! - on an ordinary thread it is the whole process;
//! - on a threaded async worker (once [`install_async_handler`] ran) it is
//!   only that worker. The worker unwinds back to its supervising wrapper,
//!   dropping (closing) its channel endpoints on the way, so whoever joins it
//!   sees EOF and an exit code of 128;
//! - in a forked async child it is that child, which leaves with `_exit` so
//!   the parent's exit handlers do not run a second time.
//!
//! [`report_error`] is the non-fatal sibling: `error: <message>` on stderr.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::fmt;
use std::io::Write;
use std::panic;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

/// Exit status of anything that died through [`die`]
pub const FATAL_EXIT_CODE: i32 = 128;

/// Unwind payload carried out of a worker that called [`die`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError(pub String);

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal: {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Process,
    AsyncWorker,
    ForkedChild,
}

thread_local! {
    static CONTEXT: Cell<Context> = const { Cell::new(Context::Process) };
    static DYING: Cell<bool> = const { Cell::new(false) };
}

static ASYNC_AWARE: AtomicBool = AtomicBool::new(false);
static MAIN_THREAD: OnceLock<ThreadId> = OnceLock::new();

/// Make [`die`] thread-aware.
///
/// The first caller is taken to be the main thread. Idempotent.
pub fn install_async_handler() {
    MAIN_THREAD.get_or_init(|| thread::current().id());
    ASYNC_AWARE.store(true, Ordering::Release);
}

/// Whether the calling thread is the one [`install_async_handler`] saw first
pub fn is_main_thread() -> bool {
    MAIN_THREAD
        .get()
        .map_or(true, |main| *main == thread::current().id())
}

pub(crate) fn enter_async_worker() {
    CONTEXT.set(Context::AsyncWorker);
}

pub(crate) fn enter_forked_child() {
    CONTEXT.set(Context::ForkedChild);
}

/// Report `message` and terminate the current unit of work.
pub fn die(message: impl fmt::Display) -> ! {
    if DYING.replace(true) {
        let _ = writeln!(std::io::stderr(), "fatal: recursion detected in die handler");
        process::exit(FATAL_EXIT_CODE);
    }

    let message = message.to_string();
    let _ = writeln!(std::io::stderr(), "fatal: {}", message);

    match CONTEXT.get() {
        Context::AsyncWorker if ASYNC_AWARE.load(Ordering::Acquire) && !is_main_thread() => {
            panic::resume_unwind(Box::new(FatalError(message)))
        }
        Context::ForkedChild => {
            let _ = std::io::stdout().flush();
            // Safety: _exit(2) skips atexit handlers that belong to the parent.
            unsafe { libc::_exit(FATAL_EXIT_CODE) }
        }
        _ => process::exit(FATAL_EXIT_CODE),
    }
}

/// Print `error: <message>` on stderr.
///
/// Written directly, with or without a tracing subscriber installed.
pub fn report_error(message: impl fmt::Display) {
    let _ = writeln!(std::io::stderr(), "error: {}", message);
}

/// Like [`die`], with the OS error appended
pub fn die_errno(message: impl fmt::Display, errno: nix::errno::Errno) -> ! {
    die(format_args!("{}: {}", message, errno.desc()))
}
