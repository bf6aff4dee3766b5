//! Worktree pool orchestration.
//!
//! [`WorktreePool`] ties git's worktree bookkeeping to the slot allocator and the
//! lock manager. git owns whether a worktree exists; the lock manager only says
//! whether it is free.
//!
//! Every mutation of a slot (`worktree add`, `worktree remove`) happens while
//! holding that slot's lock, so two processes racing for the same fresh slot
//! cannot both run `git worktree add` into it.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, WtxError};
use crate::git::{self, CommandOutput, GitRunner};
use crate::lock::{LockManager, LockRecord, WorktreeLock};
use crate::pool;

/// Slots tried by one create call before giving up on contention.
pub const MAX_CREATE_ATTEMPTS: usize = 8;

pub const DEFAULT_BASE_REF_TTL: Duration = Duration::from_secs(120);

const FALLBACK_BASE_REF: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub exists: bool,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<LockRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatus {
    pub git_installed: bool,
    pub in_repo: bool,
    pub repo_root: Option<PathBuf>,
    pub cwd: PathBuf,
    pub base_ref: Option<String>,
    pub worktrees: Vec<WorktreeInfo>,
    /// Worktrees git still lists whose directory is gone.
    pub orphaned: Vec<WorktreeInfo>,
    pub malformed: Vec<String>,
    pub error: Option<String>,
}

/// Per-repository default base ref, remembered for `ttl`.
#[derive(Debug)]
pub struct BaseRefCache {
    ttl: Duration,
    entries: Mutex<HashMap<PathBuf, (String, Instant)>>,
}

impl BaseRefCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, repo_root: &Path) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        let (value, fetched_at) = entries.get(repo_root)?;
        (fetched_at.elapsed() < self.ttl && !value.trim().is_empty()).then(|| value.clone())
    }

    pub fn put(&self, repo_root: &Path, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(repo_root.to_path_buf(), (value.to_string(), Instant::now()));
        }
    }
}

impl Default for BaseRefCache {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_REF_TTL)
    }
}

pub struct WorktreePool {
    cwd: PathBuf,
    git: Arc<dyn GitRunner>,
    locks: LockManager,
    base_refs: BaseRefCache,
}

impl WorktreePool {
    pub fn new(cwd: impl Into<PathBuf>, git: Arc<dyn GitRunner>, locks: LockManager) -> Self {
        Self {
            cwd: cwd.into(),
            git,
            locks,
            base_refs: BaseRefCache::default(),
        }
    }

    pub fn with_base_ref_ttl(mut self, ttl: Duration) -> Self {
        self.base_refs = BaseRefCache::new(ttl);
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn repo_root(&self) -> Result<PathBuf> {
        git::repo_root(self.git.as_ref(), &self.cwd)
    }

    /// Snapshot of the pool. Failures past repository detection land in `error`
    /// alongside whatever was gathered before them.
    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            cwd: self.cwd.clone(),
            ..PoolStatus::default()
        };
        if !self.git.available() {
            return status;
        }
        status.git_installed = true;

        let repo_root = match self.repo_root() {
            Ok(root) => root,
            Err(_) => return status,
        };
        status.in_repo = true;
        status.base_ref = Some(self.default_base_ref(&repo_root, false));
        status.repo_root = Some(repo_root.clone());

        let listing = match git::list_worktrees(self.git.as_ref(), &repo_root) {
            Ok(listing) => listing,
            Err(err) => {
                status.error = Some(err.to_string());
                return status;
            }
        };
        status.malformed = listing.malformed;

        for listed in listing.worktrees {
            let mut info = WorktreeInfo {
                path: listed.path,
                branch: listed.branch,
                exists: false,
                available: false,
                holder: None,
            };
            match path_exists(&info.path) {
                Ok(true) => {}
                Ok(false) => {
                    status.orphaned.push(info.clone());
                    status.worktrees.push(info);
                    continue;
                }
                Err(err) => {
                    status.error = Some(err.to_string());
                    return status;
                }
            }
            info.exists = true;
            match self.locks.holder(&repo_root, &info.path) {
                Ok(holder) => {
                    info.available = holder.is_none();
                    info.holder = holder;
                }
                Err(err) => {
                    status.error = Some(err.to_string());
                    return status;
                }
            }
            status.worktrees.push(info);
        }
        status
    }

    /// New branch `branch` off the default base ref, in a fresh pool slot.
    pub fn create_worktree(&self, branch: &str) -> Result<WorktreeInfo> {
        let branch = require_branch(branch)?;
        let repo_root = self.repo_root()?;
        let base_ref = self.prepare_base_ref(&repo_root)?;
        self.add_in_free_slot(&repo_root, branch, AddMode::NewBranch(&base_ref))
    }

    /// Existing branch `branch` checked out into a fresh pool slot.
    pub fn create_worktree_from_branch(&self, branch: &str) -> Result<WorktreeInfo> {
        let branch = require_branch(branch)?;
        let repo_root = self.repo_root()?;
        self.add_in_free_slot(&repo_root, branch, AddMode::ExistingBranch)
    }

    fn add_in_free_slot(
        &self,
        repo_root: &Path,
        branch: &str,
        mut mode: AddMode<'_>,
    ) -> Result<WorktreeInfo> {
        let mut start = 1;
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let (index, target) = pool::next_slot_from(repo_root, start)?;
            start = index + 1;

            let lock = match self.locks.acquire(repo_root, &target) {
                Ok(lock) => lock,
                Err(err @ (WtxError::Locked { .. } | WtxError::StaleLockReclaimRace { .. })) => {
                    debug!(slot = %target.display(), attempt, error = %err, "Pool slot contended");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let args = mode.args(branch, &target.to_string_lossy());
            let argv: Vec<&str> = args.iter().map(String::as_str).collect();
            let output = self.git.run(repo_root, &argv);
            release_quietly(lock);
            let output = output?;

            if output.success {
                debug!(slot = %target.display(), branch, "Created worktree");
                return Ok(WorktreeInfo {
                    path: target,
                    branch: branch.to_string(),
                    exists: true,
                    available: true,
                    holder: None,
                });
            }
            if git::is_path_collision(&target, &output) {
                debug!(slot = %target.display(), attempt, "Pool slot appeared concurrently");
                // `worktree add -b` creates the branch before it checks the path.
                if matches!(mode, AddMode::NewBranch(_))
                    && git::local_branch_exists(self.git.as_ref(), repo_root, branch)
                {
                    mode = AddMode::ExistingBranch;
                }
                continue;
            }
            return Err(git::friendly_branch_error(
                branch,
                &format!("git {}", args.join(" ")),
                &output,
            ));
        }
        Err(WtxError::PoolExhausted {
            pool_dir: pool::pool_dir(repo_root)?,
            checked: MAX_CREATE_ATTEMPTS,
        })
    }

    /// `git worktree remove` under the worktree's lock. Orphaned worktrees are
    /// always removed with `--force`.
    pub fn delete_worktree(&self, path: &Path, force: bool) -> Result<()> {
        let path = require_path(path)?;
        let repo_root = self.repo_root()?;
        let orphaned = !path_exists(path)?;
        let lock = self.locks.acquire(&repo_root, path)?;

        let path_arg = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force || orphaned {
            args.push("--force");
        }
        args.push(&*path_arg);

        let output = self.git.run(&repo_root, &args);
        release_quietly(lock);
        expect_success(&args, output?)?;
        debug!(worktree = %path.display(), force, orphaned, "Removed worktree");
        Ok(())
    }

    pub fn checkout_existing_branch(&self, worktree: &Path, branch: &str) -> Result<()> {
        let worktree = require_existing_worktree(worktree)?;
        let branch = require_branch(branch)?;
        let output = self.git.run(worktree, &["checkout", branch])?;
        if output.success {
            return Ok(());
        }
        Err(git::friendly_branch_error(
            branch,
            &format!("git checkout {branch}"),
            &output,
        ))
    }

    /// `git checkout -b branch base`. Without an explicit `base_ref` the
    /// repository's default base ref is used.
    pub fn checkout_new_branch(
        &self,
        worktree: &Path,
        branch: &str,
        base_ref: Option<&str>,
    ) -> Result<()> {
        let worktree = require_existing_worktree(worktree)?;
        let branch = require_branch(branch)?;
        let repo_root = git::repo_root(self.git.as_ref(), worktree)?;
        let base_ref = match base_ref.map(str::trim).filter(|base| !base.is_empty()) {
            Some(base) => {
                self.fetch_origin(&repo_root)?;
                base.to_string()
            }
            None => self.prepare_base_ref(&repo_root)?,
        };
        let output = self
            .git
            .run(worktree, &["checkout", "-b", branch, base_ref.as_str()])?;
        if output.success {
            return Ok(());
        }
        Err(git::friendly_branch_error(
            branch,
            &format!("git checkout -b {branch} {base_ref}"),
            &output,
        ))
    }

    pub fn acquire_worktree_lock(&self, worktree: &Path) -> Result<WorktreeLock> {
        let worktree = require_path(worktree)?;
        self.locks.acquire(&self.repo_root()?, worktree)
    }

    pub fn acquire_worktree_lock_for_pid(&self, worktree: &Path, pid: u32) -> Result<WorktreeLock> {
        let worktree = require_path(worktree)?;
        self.locks.acquire_for_pid(&self.repo_root()?, worktree, pid)
    }

    pub fn unlock_worktree(&self, worktree: &Path) -> Result<()> {
        let worktree = require_path(worktree)?;
        self.locks.force_unlock(&self.repo_root()?, worktree)
    }

    /// Local branches, most recently committed first.
    pub fn list_local_branches_by_recent_use(&self) -> Result<Vec<String>> {
        let repo_root = self.repo_root()?;
        let stdout = git::run_checked(
            self.git.as_ref(),
            &repo_root,
            &[
                "for-each-ref",
                "--sort=-committerdate",
                "--format=%(refname:short)",
                "refs/heads",
            ],
        )?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `origin/HEAD`, then `main`, then `master`, else `main`. Cached per repo.
    pub fn default_base_ref(&self, repo_root: &Path, force: bool) -> String {
        if !force {
            if let Some(cached) = self.base_refs.get(repo_root) {
                return cached;
            }
        }
        let resolved = self.resolve_base_ref(repo_root);
        self.base_refs.put(repo_root, &resolved);
        resolved
    }

    fn resolve_base_ref(&self, repo_root: &Path) -> String {
        let origin_head = self
            .git
            .run(
                repo_root,
                &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
            )
            .ok()
            .filter(|output| output.success)
            .map(|output| output.stdout.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(reference) = origin_head {
            return reference;
        }
        for candidate in ["main", "master"] {
            let verified = self
                .git
                .run(repo_root, &["rev-parse", "--verify", candidate])
                .is_ok_and(|output| output.success);
            if verified {
                return candidate.to_string();
            }
        }
        FALLBACK_BASE_REF.to_string()
    }

    fn prepare_base_ref(&self, repo_root: &Path) -> Result<String> {
        self.fetch_origin(repo_root)?;
        Ok(self.default_base_ref(repo_root, true))
    }

    /// `git fetch origin --prune`, skipped when there is no `origin` remote.
    fn fetch_origin(&self, repo_root: &Path) -> Result<()> {
        let remote = self.git.run(repo_root, &["remote", "get-url", "origin"])?;
        if !remote.success {
            return Ok(());
        }
        let args = ["fetch", "origin", "--prune"];
        expect_success(&args, self.git.run(repo_root, &args)?)
    }
}

/// How `git worktree add` gets its branch.
#[derive(Debug, Clone, Copy)]
enum AddMode<'a> {
    /// `-b <branch>` off the given base ref.
    NewBranch(&'a str),
    ExistingBranch,
}

impl AddMode<'_> {
    fn args(self, branch: &str, target: &str) -> Vec<String> {
        match self {
            AddMode::NewBranch(base_ref) => vec![
                "worktree".to_string(),
                "add".to_string(),
                "-b".to_string(),
                branch.to_string(),
                target.to_string(),
                base_ref.to_string(),
            ],
            AddMode::ExistingBranch => vec![
                "worktree".to_string(),
                "add".to_string(),
                target.to_string(),
                branch.to_string(),
            ],
        }
    }
}

fn expect_success(args: &[&str], output: CommandOutput) -> Result<()> {
    if output.success {
        return Ok(());
    }
    let details = output.combined();
    Err(WtxError::CommandFailed {
        command: format!("git {}", args.join(" ")),
        details: if details.is_empty() {
            "exited with a non-zero status".to_string()
        } else {
            details
        },
    })
}

fn release_quietly(lock: WorktreeLock) {
    let path = lock.lock_path().to_path_buf();
    if let Err(err) = lock.release() {
        warn!(lock = %path.display(), error = %err, "Failed to release worktree lock");
    }
}

fn path_exists(path: &Path) -> Result<bool> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(WtxError::io(format!("checking {}", path.display()), err)),
    }
}

fn require_branch(branch: &str) -> Result<&str> {
    let branch = branch.trim();
    if branch.is_empty() {
        return Err(WtxError::InvalidInput("branch name required".to_string()));
    }
    Ok(branch)
}

fn require_path(path: &Path) -> Result<&Path> {
    if path.as_os_str().is_empty() {
        return Err(WtxError::InvalidInput("worktree path required".to_string()));
    }
    Ok(path)
}

fn require_existing_worktree(path: &Path) -> Result<&Path> {
    let path = require_path(path)?;
    if !path_exists(path)? {
        return Err(WtxError::OrphanedWorktree(path.to_path_buf()));
    }
    Ok(path)
}
