//! Numbered pool slots: `<parent>/<repo>.wt/wt.<N>`.
//!
//! Allocation only *picks* a path. Nothing is created or reserved here; the
//! orchestrator locks the slot before `git worktree add` makes it real.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Result, WtxError};

/// Upper bound on slots scanned before giving up.
pub const MAX_POOL_SLOTS: usize = 10_000;

const SLOT_PREFIX: &str = "wt.";

/// `<parent>/<base>.wt` for a repository rooted at `<parent>/<base>`.
pub fn pool_dir(repo_root: &Path) -> Result<PathBuf> {
    let base = repo_root
        .file_name()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            WtxError::InvalidInput(format!(
                "cannot derive a worktree pool for {}",
                repo_root.display()
            ))
        })?;
    let parent = repo_root.parent().unwrap_or_else(|| Path::new("/"));
    let mut dir_name = base.to_os_string();
    dir_name.push(".wt");
    Ok(parent.join(dir_name))
}

pub fn slot_path(pool_dir: &Path, index: usize) -> PathBuf {
    pool_dir.join(format!("{SLOT_PREFIX}{index}"))
}

/// First slot path that does not exist yet.
pub fn next_slot(repo_root: &Path) -> Result<PathBuf> {
    next_slot_from(repo_root, 1).map(|(_, path)| path)
}

/// Like [`next_slot`], scanning from `start` (1-based).
pub fn next_slot_from(repo_root: &Path, start: usize) -> Result<(usize, PathBuf)> {
    let dir = pool_dir(repo_root)?;
    let start = start.max(1);
    for index in start..=MAX_POOL_SLOTS {
        let candidate = slot_path(&dir, index);
        match std::fs::symlink_metadata(&candidate) {
            Ok(_) => continue,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok((index, candidate)),
            Err(err) => {
                return Err(WtxError::io(
                    format!("checking pool slot {}", candidate.display()),
                    err,
                ))
            }
        }
    }
    Err(WtxError::PoolExhausted {
        pool_dir: dir,
        checked: MAX_POOL_SLOTS.saturating_sub(start) + 1,
    })
}
