//! One-shot subcommands. Each prints a short result to stdout.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Local;
use wtx_core::pane::WORKTREE_PATH_ENV;
use wtx_core::{LockRecord, PoolStatus, WorktreeInfo, WtxError};

use crate::app::{App, CliError};

const LOGIN_SHELL: &str = "exec \"${SHELL:-/bin/sh}\" -l";

pub fn status(app: &App, json: bool) -> Result<(), CliError> {
    let status = app.pool().status();
    if json {
        let rendered = serde_json::to_string_pretty(&status)
            .map_err(|err| WtxError::json("serializing status", err))?;
        println!("{rendered}");
    } else {
        print!("{}", render_status(&status));
    }
    if let Some(error) = &status.error {
        return Err(CliError::Usage(error.clone()));
    }
    Ok(())
}

pub fn create(app: &App, branch: &str, existing: bool) -> Result<(), CliError> {
    let pool = app.pool();
    let info = if existing {
        pool.create_worktree_from_branch(branch)?
    } else {
        pool.create_worktree(branch)?
    };
    println!("{}", info.path.display());
    Ok(())
}

pub fn delete(app: &App, path: &Path, force: bool) -> Result<(), CliError> {
    let path = app.resolve(path)?;
    app.pool().delete_worktree(&path, force)?;
    println!("removed {}", path.display());
    Ok(())
}

pub fn checkout(
    app: &App,
    path: &Path,
    branch: &str,
    new: bool,
    base: Option<&str>,
) -> Result<(), CliError> {
    let path = app.resolve(path)?;
    let pool = app.pool();
    if new {
        pool.checkout_new_branch(&path, branch, base)?;
    } else {
        pool.checkout_existing_branch(&path, branch)?;
    }
    println!("{} -> {}", path.display(), branch);
    Ok(())
}

/// Leaves the lock file in place; it goes stale once `pid` exits.
pub fn lock(app: &App, path: &Path, pid: Option<u32>) -> Result<(), CliError> {
    let path = app.resolve(path)?;
    let pid = pid.unwrap_or_else(parent_pid);
    let lock = app.pool().acquire_worktree_lock_for_pid(&path, pid)?;
    println!(
        "locked {} for pid {} ({})",
        path.display(),
        lock.pid(),
        lock.lock_path().display()
    );
    Ok(())
}

pub fn unlock(app: &App, path: &Path) -> Result<(), CliError> {
    let path = app.resolve(path)?;
    app.pool().unlock_worktree(&path)?;
    println!("unlocked {}", path.display());
    Ok(())
}

pub fn bind_pane(app: &App, worktree: &Path, pane: &str) -> Result<(), CliError> {
    let worktree = app.resolve(worktree)?;
    let lock = app.binder().bind_pane(&worktree, pane, None)?;
    println!(
        "bound {} to pane {} (pid {})",
        worktree.display(),
        pane.trim(),
        lock.pid()
    );
    Ok(())
}

pub fn hand_back(
    app: &App,
    worktree: Option<PathBuf>,
    pane: Option<&str>,
    command: Option<String>,
) -> Result<(), CliError> {
    let binder = app.binder();
    let worktree = match worktree {
        Some(path) => app.resolve(&path)?,
        None => binder.resolve_bound_worktree().ok_or_else(|| {
            CliError::Usage(format!(
                "no worktree given and none bound to this session (set {WORKTREE_PATH_ENV} or pass --worktree)"
            ))
        })?,
    };
    let command = command
        .or_else(|| app.config.agent_command.clone())
        .unwrap_or_else(|| LOGIN_SHELL.to_string());
    binder.hand_back(&worktree, pane, &command)?;
    Ok(())
}

fn parent_pid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: getppid has no preconditions and cannot fail.
        let ppid = unsafe { libc::getppid() };
        u32::try_from(ppid).unwrap_or_else(|_| std::process::id())
    }
    #[cfg(not(unix))]
    {
        std::process::id()
    }
}

pub fn render_status(status: &PoolStatus) -> String {
    let mut out = String::new();
    if !status.git_installed {
        out.push_str("git not installed\n");
        return out;
    }
    let Some(repo_root) = &status.repo_root else {
        let _ = writeln!(out, "not in a git repository: {}", status.cwd.display());
        return out;
    };

    let _ = writeln!(
        out,
        "{}  (base {})",
        repo_root.display(),
        status.base_ref.as_deref().unwrap_or("main")
    );
    let width = status
        .worktrees
        .iter()
        .map(|wt| wt.path.display().to_string().len())
        .max()
        .unwrap_or(0);
    for worktree in &status.worktrees {
        let _ = writeln!(
            out,
            "  {:<width$}  {:<24}  {}",
            worktree.path.display().to_string(),
            worktree.branch,
            describe(worktree),
        );
    }
    if !status.malformed.is_empty() {
        let _ = writeln!(
            out,
            "  ({} unparsed line(s) in `git worktree list`)",
            status.malformed.len()
        );
    }
    if let Some(error) = &status.error {
        let _ = writeln!(out, "error: {error}");
    }
    out
}

fn describe(worktree: &WorktreeInfo) -> String {
    if !worktree.exists {
        return "orphaned (directory missing)".to_string();
    }
    match &worktree.holder {
        Some(holder) => describe_holder(holder),
        None => "available".to_string(),
    }
}

fn describe_holder(holder: &LockRecord) -> String {
    let since = holder
        .acquired_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M");
    let mut text = format!(
        "locked by {} (pid {}, since {})",
        holder.owner_id, holder.pid, since
    );
    if let Some(previous) = holder.rebound_from {
        let _ = write!(text, ", rebound from pid {previous}");
    }
    text
}
