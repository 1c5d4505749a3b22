//! Argument-vector rewriting for shell and trusted commands

use tracing::debug;

/// Characters that make `argv[0]` something only a shell can interpret
pub const SHELL_METACHARACTERS: &str = "|&;<>()$`\\\"' \t\n*?[#~=%";

/// Whether `arg0` contains any shell metacharacter
pub fn needs_shell(arg0: &str) -> bool {
    arg0.chars().any(|c| SHELL_METACHARACTERS.contains(c))
}

/// Wrap `argv` in `shell -c` when `argv[0]` needs a shell.
///
/// The result is `[shell, "-c", script, argv[0], argv[1], ...]`; the
/// repeated `argv[0]` becomes the shell's `$0`. With extra arguments the
/// script is `argv[0] "$@"` so they reach the command positionally without
/// being re-split. A plain program name passes through untouched and never
/// costs a shell.
///
/// ## Example
///
/// ```rust
/// use forkline_core::shell::prepare_shell_cmd;
///
/// let argv = vec!["echo $HOME".to_string()];
/// assert_eq!(
///     prepare_shell_cmd(&argv, "/bin/sh"),
///     vec!["/bin/sh", "-c", "echo $HOME", "echo $HOME"]
/// );
///
/// let argv = vec!["ls".to_string(), "-l".to_string()];
/// assert_eq!(prepare_shell_cmd(&argv, "/bin/sh"), argv);
/// ```
pub fn prepare_shell_cmd(argv: &[String], shell_path: &str) -> Vec<String> {
    let Some(arg0) = argv.first() else {
        return Vec::new();
    };
    if !needs_shell(arg0) {
        return argv.to_vec();
    }

    let script = if argv.len() < 2 {
        arg0.clone()
    } else {
        format!("{} \"$@\"", arg0)
    };

    let mut nargv = Vec::with_capacity(argv.len() + 3);
    nargv.push(shell_path.to_string());
    nargv.push("-c".to_string());
    nargv.push(script);
    nargv.extend(argv.iter().cloned());
    debug!("trace: exec: {:?}", nargv);
    nargv
}

/// Route `argv` through the toolset's own dispatcher: `[dispatcher, argv...]`
pub fn prepare_trusted_cmd(argv: &[String], dispatcher: &str) -> Vec<String> {
    let mut nargv = Vec::with_capacity(argv.len() + 1);
    nargv.push(dispatcher.to_string());
    nargv.extend(argv.iter().cloned());
    nargv
}
