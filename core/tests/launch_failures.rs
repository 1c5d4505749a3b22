//! Launch failures observed from a separate process
//!
//! Each scenario re-executes this test binary to run an ignored helper test
//! on its own: descriptor counts and `RLIMIT_NOFILE` are process-wide, and
//! what the runner prints has to be read from a real stderr. The helper
//! asserts on its own and the outer test checks how it ended.

#![cfg(unix)]

use forkline_core::{config, ChildProcess, ExitStatus, RunError, Stdio, StreamName};
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{Command, Output};

const MODE_VAR: &str = "FORKLINE_LAUNCH_HELPER_MODE";
const DIR_VAR: &str = "FORKLINE_LAUNCH_HELPER_DIR";

fn run_helper(mode: &str) -> Output {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let out = Command::new(std::env::current_exe().expect("Failed to locate test binary"))
        .args([
            "--exact",
            "launch_helper",
            "--ignored",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(MODE_VAR, mode)
        .env(DIR_VAR, tmp.path())
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run helper");
    assert!(
        out.status.success(),
        "helper '{mode}' failed: {:?}\n{}",
        out.status,
        String::from_utf8_lossy(&out.stderr)
    );
    out
}

/// Runs only when re-executed by the tests below.
#[test]
#[ignore]
fn launch_helper() {
    let (Some(mode), Some(dir)) = (std::env::var_os(MODE_VAR), std::env::var_os(DIR_VAR)) else {
        return;
    };
    let dir = PathBuf::from(dir);
    // Read the defaults before any descriptor limit is in place.
    config::current();

    match mode.to_str() {
        Some("pipe-limit") => stderr_pipe_failure_closes_everything(),
        Some("pipe-fds") => caller_keeps_only_its_ends(),
        Some("no-notify") => exec_failure_without_notification(&dir),
        Some("report") => failures_are_reported_once(&dir),
        other => panic!("unknown helper mode {:?}", other),
    }
}

#[cfg(target_os = "linux")]
fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd")
        .expect("Failed to list /proc/self/fd")
        .count()
}

#[cfg(not(target_os = "linux"))]
fn open_fds() -> usize {
    fs::read_dir("/dev/fd")
        .expect("Failed to list /dev/fd")
        .count()
}

/// Lower the soft descriptor limit so that exactly `spare` more can be
/// opened, and return the limits to restore.
fn limit_spare_fds(spare: usize) -> (libc::rlim_t, libc::rlim_t) {
    let limits = getrlimit(Resource::RLIMIT_NOFILE).expect("Failed to read RLIMIT_NOFILE");
    // New descriptors take the lowest free numbers, so the last of these
    // marks the end of the first `spare` free slots.
    let fillers: Vec<File> = (0..=spare)
        .map(|_| File::open("/dev/null").expect("Failed to open /dev/null"))
        .collect();
    let ceiling = fillers.last().map_or(0, |f| f.as_raw_fd()) as libc::rlim_t;
    drop(fillers);
    setrlimit(Resource::RLIMIT_NOFILE, ceiling, limits.1).expect("Failed to lower RLIMIT_NOFILE");
    limits
}

fn restore_limits((soft, hard): (libc::rlim_t, libc::rlim_t)) {
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).expect("Failed to restore RLIMIT_NOFILE");
}

fn stderr_pipe_failure_closes_everything() {
    let before = open_fds();
    let caller_fd = File::open("/dev/null").expect("Failed to open /dev/null");

    // Room for the stdout pipe, not for the stderr one.
    let limits = limit_spare_fds(2);
    let result = ChildProcess::new("cat")
        .stdin(Stdio::from(caller_fd))
        .stdout(Stdio::Pipe)
        .stderr(Stdio::Pipe)
        .start();
    restore_limits(limits);

    match result {
        Err(RunError::Pipe { stream, source, .. }) => {
            assert_eq!(stream, StreamName::Stderr);
            assert_eq!(source, Errno::EMFILE);
        }
        other => panic!("expected a stderr pipe failure, got {:?}", other),
    }
    assert_eq!(open_fds(), before, "setup failure leaked a descriptor");
}

fn caller_keeps_only_its_ends() {
    let before = open_fds();
    let mut child = ChildProcess::new("cat")
        .stdin(Stdio::Pipe)
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start cat");
    assert_eq!(open_fds(), before + 2, "expected only the caller's two ends");

    let mut input = child.stdin.take().expect("stdin pipe");
    input.write_all(b"ping\n").expect("Failed to write to cat");
    drop(input);
    let mut out = String::new();
    child
        .stdout
        .take()
        .expect("stdout pipe")
        .read_to_string(&mut out)
        .expect("Failed to read from cat");
    assert_eq!(out, "ping\n");
    assert!(child.finish().expect("Failed to finish cat").success());
    assert_eq!(open_fds(), before);
}

fn exec_failure_without_notification(dir: &std::path::Path) {
    let script = dir.join("not-executable");
    fs::write(&script, "#!/bin/sh\nexit 0\n").expect("Failed to write script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).expect("chmod");

    // No spare descriptors: the notification pipe cannot be created, and
    // every stream is inherited so nothing else needs one.
    let limits = limit_spare_fds(0);
    let child = ChildProcess::new(script.to_string_lossy()).start();
    restore_limits(limits);

    let child = child.expect("launch should go ahead without a notification pipe");
    assert_eq!(
        child.finish().expect("permission denied is not a missing program"),
        ExitStatus::Exited(forkline_core::FATAL_EXIT_CODE)
    );
}

fn failures_are_reported_once(dir: &std::path::Path) {
    let err = ChildProcess::new("forkline-missing-xyz").run().unwrap_err();
    assert!(err.is_not_found());

    let err = ChildProcess::new("forkline-missing-quiet")
        .silent_exec_failure(true)
        .run()
        .unwrap_err();
    assert!(err.is_not_found());

    let script = dir.join("locked");
    fs::write(&script, "#!/bin/sh\nexit 0\n").expect("Failed to write script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).expect("chmod");
    let err = ChildProcess::new(script.to_string_lossy()).run().unwrap_err();
    assert_eq!(err.errno(), Some(Errno::EACCES));
}

#[test]
fn test_pipe_failure_leaves_no_descriptor_behind() {
    run_helper("pipe-limit");
}

#[test]
fn test_started_child_leaves_only_caller_ends_open() {
    run_helper("pipe-fds");
}

#[test]
fn test_exec_failure_without_notification_pipe_is_fatal_status() {
    let out = run_helper("no-notify");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("error: cannot exec '") && stderr.contains("Permission denied"),
        "{stderr}"
    );
}

#[test]
fn test_launch_failures_reach_stderr_without_a_subscriber() {
    let out = run_helper("report");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(
        stderr
            .matches("error: cannot run forkline-missing-xyz: No such file or directory")
            .count(),
        1,
        "{stderr}"
    );
    assert!(!stderr.contains("forkline-missing-quiet"), "{stderr}");
    assert_eq!(stderr.matches("error: cannot exec '").count(), 1, "{stderr}");
    assert!(stderr.contains("Permission denied"), "{stderr}");
}
