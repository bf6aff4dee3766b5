//! Error types for wtx-core operations.
//!
//! Filesystem and JSON failures keep their source error verbatim; only git output
//! is translated into friendlier text (see [`crate::git::friendly_branch_error`]).

use std::path::PathBuf;

/// All errors that can occur in wtx-core operations.
#[derive(Debug, thiserror::Error)]
pub enum WtxError {
    // ─────────────────────────────────────────────────────────────────────
    // Environment Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("git not installed")]
    GitUnavailable,

    #[error("tmux not available")]
    TmuxUnavailable,

    #[error("not in a git repository: {}", .0.display())]
    NotARepository(PathBuf),

    #[error("Configuration file malformed: {}: {details}", .path.display())]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // Lock Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error(
        "worktree {} is locked by {owner_id} (pid {pid}); run `wtx unlock {}` to force",
        .worktree.display(),
        .worktree.display()
    )]
    Locked {
        worktree: PathBuf,
        owner_id: String,
        pid: u32,
    },

    #[error("lost the race for {}: another process reclaimed it first", .worktree.display())]
    StaleLockReclaimRace { worktree: PathBuf },

    #[error("lock file is corrupt: {}: {details}", .path.display())]
    CorruptLock { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Pool Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("no available worktree path under {} (checked {checked} slots)", .pool_dir.display())]
    PoolExhausted { pool_dir: PathBuf, checked: usize },

    #[error(
        "worktree {} no longer exists on disk; remove it with `wtx delete --force`",
        .0.display()
    )]
    OrphanedWorktree(PathBuf),

    // ─────────────────────────────────────────────────────────────────────
    // Git Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("branch {0:?} already exists")]
    BranchExists(String),

    #[error("branch {0:?} is already checked out in another worktree")]
    BranchCheckedOut(String),

    #[error("branch {0:?} was not found")]
    BranchNotFound(String),

    #[error("{command} failed: {details}")]
    CommandFailed { command: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    InvalidInput(String),
}

impl WtxError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        WtxError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        WtxError::Json {
            context: context.into(),
            source,
        }
    }

    /// True when the error means another live owner holds the worktree.
    pub fn is_locked(&self) -> bool {
        matches!(self, WtxError::Locked { .. })
    }
}

/// Convenience type alias for Results using WtxError.
pub type Result<T> = std::result::Result<T, WtxError>;

impl From<WtxError> for String {
    fn from(err: WtxError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_message_tells_user_how_to_recover() {
        let err = WtxError::Locked {
            worktree: PathBuf::from("/repo.wt/wt.1"),
            owner_id: "tmux:$1:@2".to_string(),
            pid: 42,
        };
        let message = err.to_string();
        assert!(message.contains("tmux:$1:@2"));
        assert!(message.contains("wtx unlock /repo.wt/wt.1"));
        assert!(err.is_locked());
    }

    #[test]
    fn io_error_keeps_source_text() {
        let err = WtxError::io(
            "writing lock",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied"),
        );
        assert_eq!(err.to_string(), "I/O error: writing lock: permission denied");
        assert!(!err.is_locked());
    }
}
