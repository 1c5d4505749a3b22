//! Search-path lookup
//!
//! [`locate_in_path`] only ever feeds diagnostics: it tells "command not
//! found" apart from "found, but not executable". The real lookup happens in
//! the child, which walks [`exec_candidates`] with `execve` the way `execvp`
//! would.

use nix::errno::Errno;
use nix::unistd::{access, AccessFlags};
use std::env;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Return the first `dir/file` on `$PATH` that exists.
///
/// An unset or empty `$PATH` finds nothing.
pub fn locate_in_path(file: &str) -> Option<PathBuf> {
    let search_path = env::var_os("PATH")?;
    locate_in(&search_path, file)
}

/// Whether `file` exists in some directory of `$PATH`
pub fn exists_in_path(file: &str) -> bool {
    locate_in_path(file).is_some()
}

/// [`locate_in_path`] against an explicit colon-separated search path.
///
/// POSIX reads an empty segment as the current directory, so `":/bin"`
/// looks in `.` first.
pub fn locate_in(search_path: &OsStr, file: &str) -> Option<PathBuf> {
    if search_path.is_empty() {
        return None;
    }
    split_search_path(search_path)
        .map(|dir| join_segment(dir, file))
        .find(|candidate| access(candidate.as_path(), AccessFlags::F_OK).is_ok())
}

/// Paths the child should try, in order, when executing `file`.
///
/// A name containing `/` is used as-is; no search happens.
pub fn exec_candidates(search_path: &OsStr, file: &str) -> Vec<PathBuf> {
    if file.contains('/') {
        return vec![PathBuf::from(file)];
    }
    split_search_path(search_path)
        .map(|dir| join_segment(dir, file))
        .collect()
}

/// Rewrite the errno of a failed search-path exec into the one users expect.
///
/// `execvp` reports `EACCES` when some `$PATH` directory is unsearchable,
/// even though the command simply is not there; "No such file or directory"
/// is what people understand. Names with a `/` were never searched and keep
/// their errno.
pub fn normalize_exec_errno(file: &str, errno: Errno, search_path: &OsStr) -> Errno {
    if file.contains('/') {
        return errno;
    }
    match errno {
        Errno::EACCES if locate_in(search_path, file).is_some() => Errno::EACCES,
        Errno::EACCES | Errno::ENOTDIR => Errno::ENOENT,
        other => other,
    }
}

fn split_search_path(search_path: &OsStr) -> impl Iterator<Item = &OsStr> {
    search_path
        .as_bytes()
        .split(|b| *b == b':')
        .map(OsStr::from_bytes)
}

fn join_segment(dir: &OsStr, file: &str) -> PathBuf {
    if dir.is_empty() {
        PathBuf::from(file)
    } else {
        PathBuf::from(dir).join(file)
    }
}
