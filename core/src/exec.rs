//! The child side of a launch, between `fork` and `exec`
//!
//! Everything the child needs is prepared by the parent in an [`ExecPlan`]
//! and a [`ChildFds`]: C strings, pointer arrays, search-path candidates
//! and pre-formatted messages. After fork the child only makes raw
//! system calls on that data. It must not allocate, take locks or log:
//! another thread of the parent may have held any of those at fork time.
//!
//! If the child cannot exec, it sends a 5-byte [`ChildReport`] over the
//! close-on-exec notification pipe and exits. A successful exec closes that
//! pipe, so the parent reading EOF means the program is running.

#![allow(unsafe_code)]

use crate::env;
use crate::path;
use crate::{Result, RunError};
use nix::errno::Errno;
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Exit status of a child that could not exec its program
pub(crate) const EXEC_FAILED_EXIT_CODE: i32 = 127;

/// Exit status of a child that died during setup
pub(crate) const SETUP_FAILED_EXIT_CODE: i32 = 128;

/// What the child tells the parent when it could not reach `exec`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildReport {
    /// Every exec attempt failed with this errno
    Exec(Errno),
    /// `chdir` to the requested directory failed
    Chdir(Errno),
    /// Redirecting a standard stream failed
    Redirect(Errno),
}

impl ChildReport {
    const EXEC: u8 = 1;
    const CHDIR: u8 = 2;
    const REDIRECT: u8 = 3;

    fn encode(kind: u8, errno: i32) -> [u8; 5] {
        let e = errno.to_ne_bytes();
        [kind, e[0], e[1], e[2], e[3]]
    }

    /// Decode what the child wrote; `None` for EOF or garbage
    pub(crate) fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 5 {
            return None;
        }
        let errno = Errno::from_raw(i32::from_ne_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]));
        match bytes[0] {
            Self::EXEC => Some(ChildReport::Exec(errno)),
            Self::CHDIR => Some(ChildReport::Chdir(errno)),
            Self::REDIRECT => Some(ChildReport::Redirect(errno)),
            _ => None,
        }
    }
}

/// Where one of the child's standard streams comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Redirect {
    /// Keep the parent's
    Inherit,
    /// `/dev/null`
    Null,
    /// `dup2` this descriptor onto the stream
    Dup(RawFd),
}

/// Descriptor wiring for the child
#[derive(Debug)]
pub(crate) struct ChildFds {
    pub stdin: Redirect,
    pub stdout: Redirect,
    pub stderr: Redirect,
    pub stdout_to_stderr: bool,
    /// Keep a copy of the parent's stderr for the child's own messages
    pub dup_diagnostics: bool,
    /// Pipe ends and caller-supplied descriptors to close once in place
    pub close_after_redirect: Vec<RawFd>,
    /// Read end of the notification pipe (the child closes it)
    pub notify_read: Option<RawFd>,
    /// Write end of the notification pipe
    pub notify_write: Option<RawFd>,
}

/// Everything the child needs to `exec`, prepared before fork
#[derive(Debug)]
pub(crate) struct ExecPlan {
    argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    // Backing storage for `envp_ptrs`.
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    candidates: Vec<CString>,
    // Shell that runs a candidate without a magic number, and per candidate
    // the argv `[shell, candidate, argv[1..]]` for it.
    shell: CString,
    script_argv_ptrs: Vec<Vec<*const libc::c_char>>,
    dir: Option<CString>,
    chdir_message: Vec<u8>,
    exec_message: Vec<u8>,
    not_found_message: Option<Vec<u8>>,
    program: String,
    search_path: OsString,
}

impl ExecPlan {
    /// Prepare `argv` (already shell- or dispatcher-wrapped) for exec.
    ///
    /// `program` is the name diagnostics use, `overrides` the environment
    /// edits, `default_path` the search path when the child has no `PATH`
    /// and `shell` what runs an executable that is not a binary or a `#!`
    /// script.
    pub(crate) fn new(
        argv: &[String],
        program: &str,
        overrides: &[String],
        dir: Option<&Path>,
        default_path: &str,
        shell: &str,
    ) -> Result<Self> {
        let exec_name = argv
            .first()
            .ok_or_else(|| RunError::InvalidCommand("argv is empty".to_string()))?;

        let argv_c = argv
            .iter()
            .map(|arg| to_cstring(arg.as_bytes(), "argument"))
            .collect::<Result<Vec<_>>>()?;

        let vars = env::child_environment(overrides);
        let search_path = env::lookup(&vars, "PATH")
            .map(OsStr::to_os_string)
            .unwrap_or_else(|| OsString::from(default_path));
        let envp = vars
            .iter()
            .map(|(key, value)| {
                let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
                entry.extend_from_slice(key.as_bytes());
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                to_cstring(&entry, "environment entry")
            })
            .collect::<Result<Vec<_>>>()?;

        let candidates = path::exec_candidates(&search_path, exec_name)
            .iter()
            .map(|candidate| to_cstring(candidate.as_os_str().as_bytes(), "program path"))
            .collect::<Result<Vec<_>>>()?;

        let dir_c = dir
            .map(|d| to_cstring(d.as_os_str().as_bytes(), "working directory"))
            .transpose()?;
        let chdir_message = match dir {
            Some(d) => format!(
                "fatal: exec '{}': cd to '{}' failed: ",
                program,
                d.display()
            )
            .into_bytes(),
            None => Vec::new(),
        };

        let shell = to_cstring(shell.as_bytes(), "shell path")?;
        let script_argv_ptrs: Vec<Vec<*const libc::c_char>> = candidates
            .iter()
            .map(|candidate| {
                [shell.as_ptr(), candidate.as_ptr()]
                    .into_iter()
                    .chain(argv_c[1..].iter().map(|arg| arg.as_ptr()))
                    .chain(std::iter::once(std::ptr::null()))
                    .collect()
            })
            .collect();

        let argv_ptrs = null_terminated(&argv_c);
        let envp_ptrs = null_terminated(&envp);

        Ok(Self {
            argv: argv_c,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            candidates,
            shell,
            script_argv_ptrs,
            dir: dir_c,
            chdir_message,
            exec_message: format!("error: cannot exec '{}': ", program).into_bytes(),
            not_found_message: Some(format!("error: cannot run {}: ", program).into_bytes()),
            program: program.to_string(),
            search_path,
        })
    }

    /// Keep the child quiet about a missing program
    pub(crate) fn silent_exec_failure(mut self, yes: bool) -> Self {
        if yes {
            self.not_found_message = None;
        }
        self
    }

    /// Name used in diagnostics
    pub(crate) fn program(&self) -> &str {
        &self.program
    }

    /// The exec'd argv, for tracing
    pub(crate) fn argv(&self) -> impl Iterator<Item = std::borrow::Cow<'_, str>> {
        self.argv.iter().map(|a| a.to_string_lossy())
    }

    /// Search path the child used, for errno normalisation
    pub(crate) fn search_path(&self) -> &OsStr {
        &self.search_path
    }

    /// First element of the exec'd argv
    pub(crate) fn exec_name(&self) -> std::borrow::Cow<'_, str> {
        self.argv[0].to_string_lossy()
    }
}

fn to_cstring(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        RunError::InvalidCommand(format!(
            "{} contains a NUL byte: {:?}",
            what,
            String::from_utf8_lossy(bytes)
        ))
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Create a pipe whose ends are both close-on-exec
pub(crate) fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "illumos",
        target_os = "solaris"
    ))]
    {
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "illumos",
        target_os = "solaris"
    )))]
    {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};
        use std::os::fd::AsRawFd;
        let (read, write) = nix::unistd::pipe()?;
        fcntl(read.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        fcntl(write.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok((read, write))
    }
}

/// Wire up descriptors, change directory and exec. Never returns.
///
/// # Safety
///
/// Must only be called in a freshly forked child. Uses nothing but
/// async-signal-safe system calls on data prepared before the fork.
pub(crate) unsafe fn exec_child(plan: &ExecPlan, fds: &ChildFds) -> ! {
    // Our own messages keep going to the parent's stderr even when the
    // child's stderr is discarded or piped.
    let diag = if fds.dup_diagnostics {
        match libc::fcntl(libc::STDERR_FILENO, libc::F_DUPFD_CLOEXEC, 3) {
            fd if fd >= 0 => fd,
            _ => libc::STDERR_FILENO,
        }
    } else {
        libc::STDERR_FILENO
    };

    if let Some(fd) = fds.notify_read {
        libc::close(fd);
    }
    let notify = fds.notify_write.unwrap_or(-1);

    redirect(fds.stdin, libc::STDIN_FILENO, notify);
    redirect(fds.stderr, libc::STDERR_FILENO, notify);
    if fds.stdout_to_stderr {
        if libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) < 0 {
            fail(notify, ChildReport::REDIRECT, SETUP_FAILED_EXIT_CODE);
        }
    } else {
        redirect(fds.stdout, libc::STDOUT_FILENO, notify);
    }

    for &fd in &fds.close_after_redirect {
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }

    if let Some(dir) = &plan.dir {
        if libc::chdir(dir.as_ptr()) != 0 {
            let errno = Errno::last();
            write_all(diag, &plan.chdir_message);
            write_all(diag, errno.desc().as_bytes());
            write_all(diag, b"\n");
            report(notify, ChildReport::CHDIR, errno as i32);
            libc::_exit(SETUP_FAILED_EXIT_CODE);
        }
    }

    // Rust starts with SIGPIPE ignored and exec keeps ignored signals.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    // execvp semantics over the prepared candidates: remember EACCES, keep
    // going on ENOENT/ENOTDIR, hand ENOEXEC to the shell, give up on
    // anything else.
    let mut seen_eacces = false;
    let mut errno = Errno::ENOENT;
    for (candidate, script_argv) in plan.candidates.iter().zip(&plan.script_argv_ptrs) {
        libc::execve(candidate.as_ptr(), plan.argv_ptrs.as_ptr(), plan.envp_ptrs.as_ptr());
        match Errno::last() {
            Errno::EACCES => seen_eacces = true,
            Errno::ENOENT | Errno::ENOTDIR => {}
            Errno::ENOEXEC => {
                libc::execve(plan.shell.as_ptr(), script_argv.as_ptr(), plan.envp_ptrs.as_ptr());
                errno = Errno::ENOEXEC;
                seen_eacces = false;
                break;
            }
            other => {
                errno = other;
                seen_eacces = false;
                break;
            }
        }
    }
    if seen_eacces {
        errno = Errno::EACCES;
    }
    if notify < 0 {
        // No parent-side report is coming.
        let prefix = if errno == Errno::ENOENT {
            plan.not_found_message.as_deref()
        } else {
            Some(plan.exec_message.as_slice())
        };
        if let Some(prefix) = prefix {
            write_all(diag, prefix);
            write_all(diag, errno.desc().as_bytes());
            write_all(diag, b"\n");
        }
    }
    report(notify, ChildReport::EXEC, errno as i32);
    libc::_exit(exec_failure_status(errno))
}

/// How a child that could not exec exits: 127 for a missing program, the
/// fatal status for anything else.
pub(crate) fn exec_failure_status(errno: Errno) -> i32 {
    if errno == Errno::ENOENT {
        EXEC_FAILED_EXIT_CODE
    } else {
        SETUP_FAILED_EXIT_CODE
    }
}

unsafe fn redirect(how: Redirect, target: RawFd, notify: RawFd) {
    match how {
        Redirect::Inherit => {}
        Redirect::Null => {
            let fd = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR);
            if fd < 0 || libc::dup2(fd, target) < 0 {
                fail(notify, ChildReport::REDIRECT, SETUP_FAILED_EXIT_CODE);
            }
            if fd != target {
                libc::close(fd);
            }
        }
        Redirect::Dup(fd) if fd == target => {
            // Already in place, but it came to us close-on-exec.
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                fail(notify, ChildReport::REDIRECT, SETUP_FAILED_EXIT_CODE);
            }
        }
        Redirect::Dup(fd) => {
            if libc::dup2(fd, target) < 0 {
                fail(notify, ChildReport::REDIRECT, SETUP_FAILED_EXIT_CODE);
            }
        }
    }
}

unsafe fn fail(notify: RawFd, kind: u8, status: i32) -> ! {
    report(notify, kind, Errno::last() as i32);
    libc::_exit(status)
}

unsafe fn report(notify: RawFd, kind: u8, errno: i32) {
    if notify >= 0 {
        write_all(notify, &ChildReport::encode(kind, errno));
    }
}

unsafe fn write_all(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
        if n < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}
