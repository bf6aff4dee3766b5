//! Thin git porcelain wrapper.
//!
//! [`GitRunner`] runs one git invocation and hands back its output; everything
//! above it (porcelain parsing, error translation) is pure and lives here too.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Result, WtxError};

/// Captured output of a finished git command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: &str) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// stdout and stderr joined, trimmed; what users see on failure.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        text
    }
}

pub trait GitRunner: Send + Sync {
    fn available(&self) -> bool;

    /// Runs `git <args>` in `dir`. A non-zero exit is *not* an error here.
    fn run(&self, dir: &Path, args: &[&str]) -> Result<CommandOutput>;
}

#[derive(Debug, Clone)]
pub struct CommandGit {
    binary: PathBuf,
}

impl Default for CommandGit {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl CommandGit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GitRunner for CommandGit {
    fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Result<CommandOutput> {
        tracing::debug!(dir = %dir.display(), args = ?args, "Running git");
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => WtxError::GitUnavailable,
                _ => WtxError::io(format!("running git {}", args.join(" ")), err),
            })?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Runs git and turns a non-zero exit into [`WtxError::CommandFailed`].
pub fn run_checked(git: &dyn GitRunner, dir: &Path, args: &[&str]) -> Result<String> {
    let output = git.run(dir, args)?;
    if !output.success {
        return Err(WtxError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            details: output.combined(),
        });
    }
    Ok(output.stdout.trim().to_string())
}

/// `git rev-parse --show-toplevel` for `dir`.
pub fn repo_root(git: &dyn GitRunner, dir: &Path) -> Result<PathBuf> {
    if !git.available() {
        return Err(WtxError::GitUnavailable);
    }
    let output = git.run(dir, &["rev-parse", "--show-toplevel"])?;
    let root = output.stdout.trim();
    if !output.success || root.is_empty() {
        return Err(WtxError::NotARepository(dir.to_path_buf()));
    }
    Ok(PathBuf::from(root))
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeListing {
    pub worktrees: Vec<ListedWorktree>,
    /// Lines that could not be attributed to a worktree block.
    pub malformed: Vec<String>,
}

pub fn list_worktrees(git: &dyn GitRunner, repo_root: &Path) -> Result<WorktreeListing> {
    let stdout = run_checked(git, repo_root, &["worktree", "list", "--porcelain"])?;
    Ok(parse_worktrees(&stdout))
}

pub fn parse_worktrees(output: &str) -> WorktreeListing {
    let mut listing = WorktreeListing::default();
    let mut in_block = false;

    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            in_block = false;
            continue;
        }
        let (key, value) = match line.split_once(' ') {
            Some((key, value)) => (key, value.trim()),
            None => (line, ""),
        };
        match key {
            "worktree" => {
                if value.is_empty() {
                    listing.malformed.push(line.to_string());
                    in_block = false;
                    continue;
                }
                listing.worktrees.push(ListedWorktree {
                    path: PathBuf::from(value),
                    branch: String::new(),
                });
                in_block = true;
            }
            "branch" if in_block => {
                if let Some(current) = listing.worktrees.last_mut() {
                    current.branch = short_branch(value);
                }
            }
            "detached" if in_block => {
                if let Some(current) = listing.worktrees.last_mut() {
                    if current.branch.is_empty() {
                        current.branch = DETACHED.to_string();
                    }
                }
            }
            _ if !in_block => listing.malformed.push(line.to_string()),
            _ => {}
        }
    }

    for worktree in &mut listing.worktrees {
        if worktree.branch.is_empty() {
            worktree.branch = DETACHED.to_string();
        }
    }
    listing
}

pub const DETACHED: &str = "detached";

pub fn short_branch(value: &str) -> String {
    let value = value.trim();
    let value = value.strip_prefix("refs/heads/").unwrap_or(value);
    let value = value.strip_prefix("refs/remotes/").unwrap_or(value);
    let value = value.strip_prefix("origin/").unwrap_or(value);
    if value.is_empty() {
        DETACHED.to_string()
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchFailure {
    Exists,
    CheckedOut,
    NotFound,
}

/// Known git phrasings, matched case-insensitively against combined output.
/// Anything else falls through verbatim.
const BRANCH_FAILURE_PATTERNS: &[(&str, BranchFailure)] = &[
    ("is already checked out at", BranchFailure::CheckedOut),
    ("is already used by worktree at", BranchFailure::CheckedOut),
    ("already exists", BranchFailure::Exists),
    ("did not match any file(s) known to git", BranchFailure::NotFound),
    ("invalid reference", BranchFailure::NotFound),
];

/// Translates a failed branch checkout/creation into a user-facing error.
pub fn friendly_branch_error(branch: &str, command: &str, output: &CommandOutput) -> WtxError {
    let message = output.combined();
    let lower = message.to_lowercase();
    let matched = BRANCH_FAILURE_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, failure)| *failure);

    match matched {
        Some(BranchFailure::Exists) => WtxError::BranchExists(branch.to_string()),
        Some(BranchFailure::CheckedOut) => WtxError::BranchCheckedOut(branch.to_string()),
        Some(BranchFailure::NotFound) => WtxError::BranchNotFound(branch.to_string()),
        None => WtxError::CommandFailed {
            command: command.to_string(),
            details: if message.is_empty() {
                "exited with a non-zero status".to_string()
            } else {
                message
            },
        },
    }
}

/// Whether `refs/heads/<branch>` exists. Git failures count as "no".
pub fn local_branch_exists(git: &dyn GitRunner, dir: &Path, branch: &str) -> bool {
    let reference = format!("refs/heads/{branch}");
    git.run(dir, &["rev-parse", "--verify", "--quiet", reference.as_str()])
        .is_ok_and(|output| output.success)
}

/// True when `worktree add` failed because the target *path* already exists,
/// i.e. another process claimed the pool slot first.
pub fn is_path_collision(target: &Path, output: &CommandOutput) -> bool {
    let message = output.combined();
    let lower = message.to_lowercase();
    lower.contains("already exists") && message.contains(&*target.to_string_lossy())
}
