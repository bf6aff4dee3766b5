//! tmux access for lock ownership and pane binding.
//!
//! Every query goes through [`TmuxClient`] so the lock coordinator can be driven by
//! a fake in tests. [`CommandTmux`] shells out to the `tmux` binary.
//!
//! Existence queries return `Option<bool>`: `None` means tmux could not answer
//! (binary missing, no server on this socket), which callers treat as inconclusive
//! rather than as "gone".

use std::env;
use std::path::Path;
use std::process::Command;

use crate::error::{Result, WtxError};

/// Session option holding the worktree a tmux session is bound to.
pub const WORKTREE_PATH_OPTION: &str = "@wtx_worktree_path";

pub trait TmuxClient: Send + Sync {
    /// True when the current process runs inside a tmux client.
    fn in_tmux(&self) -> bool;

    fn session_exists(&self, session_id: &str) -> Option<bool>;

    fn window_exists(&self, session_id: &str, window_id: &str) -> Option<bool>;

    /// `display-message -p` with an optional `-t` target.
    fn display_message(&self, target: Option<&str>, format: &str) -> Option<String>;

    /// PID of the process backing a pane (`#{pane_pid}`).
    fn pane_pid(&self, pane_id: &str) -> Result<u32>;

    fn show_session_option(&self, session_id: &str, name: &str) -> Option<String>;

    fn set_session_option(&self, session_id: &str, name: &str, value: &str) -> Result<()>;

    /// `respawn-pane -k` running `command` in `cwd`.
    fn respawn_pane(&self, target: &str, cwd: &Path, command: &str) -> Result<()>;

    fn current_pane_id(&self) -> Option<String> {
        self.display_message(None, "#{pane_id}")
    }

    fn current_session_id(&self) -> Option<String> {
        self.display_message(None, "#{session_id}")
    }

    fn current_window_id(&self) -> Option<String> {
        self.display_message(None, "#{window_id}")
    }

    fn pane_window_id(&self, pane_id: &str) -> Option<String> {
        self.display_message(Some(pane_id), "#{window_id}")
    }

    fn pane_session_id(&self, pane_id: &str) -> Option<String> {
        self.display_message(Some(pane_id), "#{session_id}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandTmux;

impl CommandTmux {
    pub fn new() -> Self {
        Self
    }
}

impl TmuxClient for CommandTmux {
    fn in_tmux(&self) -> bool {
        let inside = env::var("TMUX")
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        inside && tmux_installed()
    }

    fn session_exists(&self, session_id: &str) -> Option<bool> {
        match run_tmux(&["has-session", "-t", session_id]) {
            TmuxOutcome::Success(_) => Some(true),
            TmuxOutcome::Failed(stderr) => classify_missing(&stderr),
            TmuxOutcome::NotInstalled => None,
        }
    }

    fn window_exists(&self, session_id: &str, window_id: &str) -> Option<bool> {
        match run_tmux(&["list-windows", "-t", session_id, "-F", "#{window_id}"]) {
            TmuxOutcome::Success(stdout) => Some(stdout.lines().any(|line| line.trim() == window_id)),
            TmuxOutcome::Failed(stderr) => classify_missing(&stderr),
            TmuxOutcome::NotInstalled => None,
        }
    }

    fn display_message(&self, target: Option<&str>, format: &str) -> Option<String> {
        let mut args = vec!["display-message", "-p"];
        if let Some(target) = target {
            args.push("-t");
            args.push(target);
        }
        args.push(format);
        match run_tmux(&args) {
            TmuxOutcome::Success(stdout) => {
                let value = stdout.trim();
                (!value.is_empty()).then(|| value.to_string())
            }
            _ => None,
        }
    }

    fn pane_pid(&self, pane_id: &str) -> Result<u32> {
        let raw = self
            .display_message(Some(pane_id), "#{pane_pid}")
            .ok_or(WtxError::TmuxUnavailable)?;
        raw.parse().map_err(|_| {
            WtxError::InvalidInput(format!("tmux reported invalid pid {raw:?} for pane {pane_id}"))
        })
    }

    fn show_session_option(&self, session_id: &str, name: &str) -> Option<String> {
        match run_tmux(&["show-options", "-qv", "-t", session_id, name]) {
            TmuxOutcome::Success(stdout) => {
                let value = stdout.trim();
                (!value.is_empty()).then(|| value.to_string())
            }
            _ => None,
        }
    }

    fn set_session_option(&self, session_id: &str, name: &str, value: &str) -> Result<()> {
        expect_success(
            "tmux set-option",
            run_tmux(&["set-option", "-t", session_id, name, value]),
        )
    }

    fn respawn_pane(&self, target: &str, cwd: &Path, command: &str) -> Result<()> {
        let cwd = cwd.to_string_lossy();
        expect_success(
            "tmux respawn-pane",
            run_tmux(&["respawn-pane", "-k", "-c", cwd.as_ref(), "-t", target, command]),
        )
    }
}

enum TmuxOutcome {
    Success(String),
    Failed(String),
    NotInstalled,
}

fn run_tmux(args: &[&str]) -> TmuxOutcome {
    match Command::new("tmux").args(args).output() {
        Ok(output) if output.status.success() => {
            TmuxOutcome::Success(String::from_utf8_lossy(&output.stdout).to_string())
        }
        Ok(output) => TmuxOutcome::Failed(String::from_utf8_lossy(&output.stderr).to_string()),
        Err(_) => TmuxOutcome::NotInstalled,
    }
}

fn expect_success(command: &str, outcome: TmuxOutcome) -> Result<()> {
    match outcome {
        TmuxOutcome::Success(_) => Ok(()),
        TmuxOutcome::Failed(stderr) => Err(WtxError::CommandFailed {
            command: command.to_string(),
            details: stderr.trim().to_string(),
        }),
        TmuxOutcome::NotInstalled => Err(WtxError::TmuxUnavailable),
    }
}

fn tmux_installed() -> bool {
    Command::new("tmux")
        .arg("-V")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Maps tmux's stderr for a failed lookup to a verdict.
///
/// "can't find session/window" is a definite answer. A missing server is not: the
/// lock may have been taken on another tmux socket.
fn classify_missing(stderr: &str) -> Option<bool> {
    let lower = stderr.to_lowercase();
    if lower.contains("can't find") || lower.contains("session not found") {
        return Some(false);
    }
    None
}
