//! wtx: grab an exclusive git worktree from a reusable pool.
//!
//! ## Subcommands
//!
//! - `status`: pool overview with availability and holders
//! - `create` / `delete` / `checkout`: worktree lifecycle
//! - `lock` / `unlock`: manual lock control
//! - `hold`: background holder that heartbeats a lock for a PID
//! - `bind-pane` / `hand-back`: tmux pane integration
//! - `run`: run a command in a worktree, holding its lock until it exits

mod app;
mod commands;
mod hold;
mod logging;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::app::CliError;

#[derive(Parser)]
#[command(name = "wtx")]
#[command(about = "Reusable git worktree pool with cross-process locking")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pool worktrees, who holds them, and orphaned entries
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a worktree in the next free pool slot
    Create {
        /// Branch to create (or check out with --existing)
        branch: String,

        /// Check out an existing branch instead of creating one
        #[arg(long)]
        existing: bool,
    },

    /// Remove a worktree (takes its lock first)
    Delete {
        path: PathBuf,

        /// Remove even with local modifications
        #[arg(long)]
        force: bool,
    },

    /// Switch a worktree to another branch
    Checkout {
        path: PathBuf,
        branch: String,

        /// Create the branch
        #[arg(long)]
        new: bool,

        /// Base ref for --new (defaults to the repository's default branch)
        #[arg(long, requires = "new")]
        base: Option<String>,
    },

    /// Lock a worktree for a process (defaults to the calling shell)
    Lock {
        path: PathBuf,

        #[arg(long)]
        pid: Option<u32>,
    },

    /// Force-release a worktree lock
    Unlock { path: PathBuf },

    /// Hold a worktree lock while a process lives (runs in the foreground)
    Hold {
        #[arg(long)]
        worktree: PathBuf,

        /// Process whose lifetime bounds the lock
        #[arg(long)]
        pid: u32,
    },

    /// Bind a worktree lock to the process running in a tmux pane
    BindPane {
        #[arg(long)]
        worktree: PathBuf,

        /// tmux pane id, e.g. %3
        #[arg(long)]
        pane: String,
    },

    /// Release a worktree and respawn the pane with a fresh command
    HandBack {
        #[arg(long)]
        worktree: Option<PathBuf>,

        #[arg(long)]
        pane: Option<String>,

        /// Command to respawn (defaults to the configured agent command or a login shell)
        #[arg(long)]
        command: Option<String>,
    },

    /// Run a command inside a worktree while holding its lock
    Run {
        path: PathBuf,

        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
}

fn main() -> ExitCode {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "wtx command failed");
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}

fn dispatch(command: Commands) -> Result<ExitCode, CliError> {
    let app = app::App::load()?;
    match command {
        Commands::Status { json } => commands::status(&app, json)?,
        Commands::Create { branch, existing } => commands::create(&app, &branch, existing)?,
        Commands::Delete { path, force } => commands::delete(&app, &path, force)?,
        Commands::Checkout {
            path,
            branch,
            new,
            base,
        } => commands::checkout(&app, &path, &branch, new, base.as_deref())?,
        Commands::Lock { path, pid } => commands::lock(&app, &path, pid)?,
        Commands::Unlock { path } => commands::unlock(&app, &path)?,
        Commands::Hold { worktree, pid } => hold::run(&app, &worktree, pid)?,
        Commands::BindPane { worktree, pane } => commands::bind_pane(&app, &worktree, &pane)?,
        Commands::HandBack {
            worktree,
            pane,
            command,
        } => commands::hand_back(&app, worktree, pane.as_deref(), command)?,
        Commands::Run { path, command } => return run::run(&app, &path, &command),
    }
    Ok(ExitCode::SUCCESS)
}
