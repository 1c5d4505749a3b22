//! Integration tests for the synchronous runner
//!
//! These tests launch real programs (`/bin/sh`, `echo`, `cat`, `false`) and
//! verify that:
//! - pipes, null streams and caller descriptors reach the child
//! - environment overrides, working directory and the shell wrapper apply
//! - launch failures come back as errors, never as exit code 127
//! - cleanup registration lasts exactly from start to finish

#![cfg(unix)]

use forkline_core::cleanup;
use forkline_core::{run_argv, ChildProcess, ExitStatus, RunError, RunOptions, Stdio};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;

fn read_all(file: Option<File>) -> String {
    let mut out = String::new();
    file.expect("caller end should be present")
        .read_to_string(&mut out)
        .expect("Failed to read from child");
    out
}

fn sh(script: &str) -> ChildProcess {
    ChildProcess::from_argv(["sh", "-c", script])
}

#[test]
fn test_echo_through_stdout_pipe() {
    let mut child = ChildProcess::new("echo")
        .arg("hi")
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start echo");
    assert!(child.stdin.is_none());
    assert!(child.stderr.is_none());

    let out = read_all(child.stdout.take());
    assert_eq!(out, "hi\n");
    assert_eq!(child.finish().expect("Failed to finish echo"), ExitStatus::Exited(0));
}

#[test]
fn test_missing_program_is_not_found() {
    let err = ChildProcess::new("this-does-not-exist-xyz")
        .run()
        .unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
    assert_eq!(err.errno(), Some(Errno::ENOENT));

    let err = ChildProcess::new("this-does-not-exist-xyz")
        .silent_exec_failure(true)
        .start()
        .unwrap_err();
    assert!(matches!(err, RunError::NotFound { ref program } if program == "this-does-not-exist-xyz"));
}

#[test]
fn test_exit_127_is_reported_as_not_found() {
    let err = sh("exit 127").run().unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.exit_code(), 127);
}

#[test]
fn test_non_zero_exit_is_a_status() {
    let status = ChildProcess::new("false").run().expect("false should run");
    assert_eq!(status, ExitStatus::Exited(1));
    assert!(!status.success());

    let status = sh("exit 3").run().expect("sh should run");
    assert_eq!(status.code(), 3);
}

#[test]
fn test_signal_death_is_reported() {
    let status = sh("kill -TERM $$").run().expect("sh should run");
    assert_eq!(status, ExitStatus::Signaled(Signal::SIGTERM));
    assert_eq!(status.code(), 128 + libc::SIGTERM);
}

#[test]
fn test_shell_snippet_and_forwarded_args() {
    let mut child = ChildProcess::from_argv(["printf '%s|'", "a b", "c"])
        .use_shell(true)
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start shell snippet");
    assert_eq!(read_all(child.stdout.take()), "a b|c|");
    assert!(child.finish().expect("Failed to finish").success());

    let mut child = ChildProcess::new("echo $FORKLINE_TEST_VAR")
        .env("FORKLINE_TEST_VAR=from-env")
        .use_shell(true)
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start shell snippet");
    assert_eq!(read_all(child.stdout.take()), "from-env\n");
    assert!(child.finish().expect("Failed to finish").success());
}

#[test]
fn test_plain_command_ignores_use_shell() {
    // Without metacharacters the shell is skipped, so `$0` style expansion
    // never happens and the argument reaches echo verbatim.
    let mut child = ChildProcess::from_argv(["echo", "$HOME"])
        .use_shell(true)
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start echo");
    assert_eq!(read_all(child.stdout.take()), "$HOME\n");
    child.finish().expect("Failed to finish");
}

#[test]
fn test_env_overrides_later_wins_and_bare_key_unsets() {
    let mut child = sh(r#"echo "${FL_A-unset}:${FL_B-unset}""#)
        .env("FL_A=1")
        .env("FL_A=2")
        .env("FL_B=present")
        .env("FL_B")
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start sh");
    assert_eq!(read_all(child.stdout.take()), "2:unset\n");
    child.finish().expect("Failed to finish");
}

#[test]
fn test_working_directory() {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let expected = fs::canonicalize(tmp.path()).expect("Failed to canonicalize");

    let mut child = sh("pwd -P")
        .current_dir(tmp.path())
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start pwd");
    assert_eq!(read_all(child.stdout.take()).trim_end(), expected.to_string_lossy());
    child.finish().expect("Failed to finish");
}

#[test]
fn test_missing_working_directory_fails_setup() {
    let err = ChildProcess::new("true")
        .current_dir("/definitely/not/a/dir")
        .stderr(Stdio::Null)
        .run()
        .unwrap_err();
    assert_eq!(err.code(), "RUN006");
    assert_eq!(err.errno(), Some(Errno::ENOENT));
}

#[test]
fn test_stdin_and_stdout_pipes() {
    let mut child = ChildProcess::new("cat")
        .stdin(Stdio::Pipe)
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start cat");

    let mut input = child.stdin.take().expect("stdin pipe");
    input.write_all(b"round\ntrip\n").expect("Failed to write to cat");
    // cat only sees EOF if no other copy of the write end is open.
    drop(input);

    assert_eq!(read_all(child.stdout.take()), "round\ntrip\n");
    assert!(child.finish().expect("Failed to finish cat").success());
}

#[test]
fn test_null_stdin() {
    let mut child = ChildProcess::new("cat")
        .stdin(Stdio::Null)
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start cat");
    assert_eq!(read_all(child.stdout.take()), "");
    child.finish().expect("Failed to finish");
}

#[test]
fn test_stdout_merged_into_stderr_pipe() {
    let mut child = sh("echo out; echo err >&2")
        .stderr(Stdio::Pipe)
        .stdout_to_stderr(true)
        .start()
        .expect("Failed to start sh");
    assert!(child.stdout.is_none());
    assert_eq!(read_all(child.stderr.take()), "out\nerr\n");
    child.finish().expect("Failed to finish");
}

#[test]
fn test_caller_supplied_descriptor() {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let target = tmp.path().join("out.txt");
    let file = File::create(&target).expect("Failed to create output file");

    let status = ChildProcess::new("echo")
        .arg("to-file")
        .stdout(Stdio::from(file))
        .run()
        .expect("Failed to run echo");
    assert!(status.success());
    assert_eq!(fs::read_to_string(&target).expect("read output"), "to-file\n");
}

#[test]
fn test_permission_denied_is_not_normalised_away() {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let script = tmp.path().join("not-executable");
    fs::write(&script, "#!/bin/sh\nexit 0\n").expect("Failed to write script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).expect("chmod");

    let err = ChildProcess::new("not-executable")
        .env(format!("PATH={}", tmp.path().display()))
        .stderr(Stdio::Null)
        .run()
        .unwrap_err();
    assert_eq!(err.code(), "RUN005");
    assert_eq!(err.errno(), Some(Errno::EACCES));
}

#[test]
fn test_clean_on_exit_registration_spans_start_to_finish() {
    let mut child = ChildProcess::new("cat")
        .stdin(Stdio::Pipe)
        .clean_on_exit(true)
        .start()
        .expect("Failed to start cat");
    let pid = child.pid();
    assert!(cleanup::is_registered(pid));

    drop(child.stdin.take());
    assert!(child.finish().expect("Failed to finish").success());
    assert!(!cleanup::is_registered(pid));
}

#[test]
fn test_invalid_descriptor_is_rejected() {
    let err = ChildProcess::default().run().unwrap_err();
    assert_eq!(err.code(), "RUN001");

    let err = ChildProcess::new("true")
        .stdout(Stdio::Pipe)
        .stdout_to_stderr(true)
        .start()
        .unwrap_err();
    assert_eq!(err.code(), "RUN001");
}

#[test]
fn test_run_argv_options() {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let opts = RunOptions {
        no_stdin: true,
        use_shell: true,
        ..RunOptions::default()
    };
    let status = run_argv(
        &["test -z \"$(cat)\" && test \"$FL_OPT\" = yes && test -d sub"],
        opts,
        Some(tmp.path()),
        &["FL_OPT=yes".to_string()],
    );
    // `sub` does not exist yet
    assert_eq!(status.expect("run_argv should run").code(), 1);

    fs::create_dir(tmp.path().join("sub")).expect("Failed to create sub");
    let status = run_argv(
        &["test -z \"$(cat)\" && test \"$FL_OPT\" = yes && test -d sub"],
        opts,
        Some(tmp.path()),
        &["FL_OPT=yes".to_string()],
    )
    .expect("run_argv should run");
    assert!(status.success());
}

#[test]
fn test_concurrent_launches_do_not_share_pipes() {
    let handles: Vec<_> = (0..8)
        .map(|i| {
            std::thread::spawn(move || {
                let mut child = ChildProcess::new("cat")
                    .stdin(Stdio::Pipe)
                    .stdout(Stdio::Pipe)
                    .start()
                    .expect("Failed to start cat");
                let mut input = child.stdin.take().expect("stdin pipe");
                writeln!(input, "worker {}", i).expect("Failed to write");
                drop(input);
                let out = read_all(child.stdout.take());
                child.finish().expect("Failed to finish cat");
                out
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let out = handle.join().expect("worker thread panicked");
        assert_eq!(out, format!("worker {}\n", i));
    }
}

#[test]
fn test_broken_pipe_keeps_other_children_registered() {
    let mut sleeper = ChildProcess::new("sleep")
        .arg("30")
        .clean_on_exit(true)
        .start()
        .expect("Failed to start sleep");
    let pid = sleeper.pid();
    assert!(cleanup::is_registered(pid));

    let mut gone = ChildProcess::new("true")
        .stdin(Stdio::Pipe)
        .start()
        .expect("Failed to start true");
    let mut input = gone.stdin.take().expect("stdin pipe");
    assert!(gone.finish().expect("Failed to finish true").success());

    let err = input.write_all(b"nobody reads this").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPIPE));
    assert!(cleanup::is_registered(pid), "EPIPE must not drain the registry");

    nix::sys::signal::kill(pid, Signal::SIGTERM).expect("Failed to signal sleep");
    assert_eq!(
        sleeper.finish().expect("Failed to finish sleep"),
        ExitStatus::Signaled(Signal::SIGTERM)
    );
}

#[test]
fn test_closing_the_reader_ends_a_writer_with_sigpipe() {
    let mut child = ChildProcess::new("yes")
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start yes");
    let mut out = child.stdout.take().expect("stdout pipe");
    let mut first = [0u8; 2];
    out.read_exact(&mut first).expect("Failed to read from yes");
    assert_eq!(&first, b"y\n");
    drop(out);

    assert_eq!(
        child.finish().expect("Failed to finish yes"),
        ExitStatus::Signaled(Signal::SIGPIPE)
    );
}

#[cfg(target_os = "linux")]
#[test]
fn test_child_starts_with_default_sigpipe() {
    let mut child = ChildProcess::new("cat")
        .arg("/proc/self/status")
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start cat");
    let status = read_all(child.stdout.take());
    child.finish().expect("Failed to finish cat");

    let ignored = status
        .lines()
        .find_map(|line| line.strip_prefix("SigIgn:"))
        .map(|mask| u64::from_str_radix(mask.trim(), 16).expect("hex signal mask"))
        .expect("SigIgn line");
    assert_eq!(ignored & (1 << (libc::SIGPIPE - 1)), 0, "SigIgn: {ignored:x}");
}

#[test]
fn test_executable_without_shebang_runs_through_shell() {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let script = tmp.path().join("plain-script");
    fs::write(&script, "exit 4\n").expect("Failed to write script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

    let status = ChildProcess::new(script.to_string_lossy())
        .run()
        .expect("script should run");
    assert_eq!(status, ExitStatus::Exited(4));

    let lister = tmp.path().join("plain-args");
    fs::write(&lister, "printf '%s|' \"$@\"\n").expect("Failed to write script");
    fs::set_permissions(&lister, fs::Permissions::from_mode(0o755)).expect("chmod");

    let mut child = ChildProcess::new("plain-args")
        .args(["one", "two words"])
        .env(format!("PATH={}", tmp.path().display()))
        .stdout(Stdio::Pipe)
        .start()
        .expect("Failed to start script through PATH");
    assert_eq!(read_all(child.stdout.take()), "one|two words|");
    assert!(child.finish().expect("Failed to finish script").success());
}
