//! forkline CLI binary
//!
//! Runs commands and hooks through the forkline core, and serves as the
//! dispatcher for trusted commands (`forkline run --trusted -- which sh`
//! re-executes this binary as `forkline which sh`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use cli::{CliError, RunRequest};
use forkline_core::{config, logging, RunOptions};
use std::path::PathBuf;
use std::process;
use tracing::error;

#[derive(Parser)]
#[command(name = "forkline")]
#[command(about = "Launch commands and hooks the way the toolset does")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runner configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and exit with its status
    Run {
        /// Run through the shell if the command has metacharacters
        #[arg(long)]
        shell: bool,
        /// Run as a forkline subcommand
        #[arg(long, conflicts_with = "shell")]
        trusted: bool,
        /// Do not report a missing program
        #[arg(long)]
        silent: bool,
        /// Kill the command if forkline dies first
        #[arg(long)]
        clean_on_exit: bool,
        /// Give the command /dev/null as stdin
        #[arg(long)]
        no_stdin: bool,
        /// Send the command's stdout to stderr
        #[arg(long)]
        stdout_to_stderr: bool,
        /// Working directory for the command
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Environment override: KEY=VALUE sets, KEY unsets
        #[arg(long = "env", value_name = "KEY[=VALUE]")]
        env: Vec<String>,
        /// The command and its arguments
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
    /// Run a hook from the control directory
    Hook {
        /// Hook name, e.g. pre-commit
        name: String,
        /// Point the index variable at this file
        #[arg(long, value_name = "PATH")]
        index_file: Option<PathBuf>,
        /// Arguments for the hook
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Show where a program would be found on PATH
    Which { name: String },
    /// Print version
    Version,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_tracing(&cli.log_level) {
        eprintln!("forkline: {}", e);
    }

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => match err.downcast_ref::<CliError>() {
            Some(cli_err) => {
                if !cli_err.already_reported() {
                    error!("{}", cli_err);
                }
                cli_err.exit_code()
            }
            None => {
                error!("{:#}", err);
                forkline_core::FATAL_EXIT_CODE
            }
        },
    };
    process::exit(code);
}

fn dispatch(parsed: Cli) -> anyhow::Result<i32> {
    let cfg = cli::load_config(parsed.config.as_deref()).with_context(|| match &parsed.config {
        Some(path) => format!("loading {}", path.display()),
        None => "loading default configuration".to_string(),
    })?;
    config::install(cfg);

    let code = match parsed.command {
        Commands::Run {
            shell,
            trusted,
            silent,
            clean_on_exit,
            no_stdin,
            stdout_to_stderr,
            dir,
            env,
            argv,
        } => {
            let request = RunRequest {
                argv,
                options: RunOptions {
                    no_stdin,
                    trusted,
                    stdout_to_stderr,
                    silent_exec_failure: silent,
                    use_shell: shell,
                    clean_on_exit,
                },
                dir,
                env,
            };
            cli::run(&request)?
        }
        Commands::Hook {
            name,
            index_file,
            args,
        } => cli::run_hook(&name, index_file.as_deref(), &args)?,
        Commands::Which { name } => {
            println!("{}", cli::which(&name)?.display());
            0
        }
        Commands::Version => {
            println!("forkline {}", env!("CARGO_PKG_VERSION"));
            0
        }
    };
    Ok(code)
}
