//! # wtx-core
//!
//! Worktree pool allocation and cross-process locking for `wtx`.
//!
//! ## Design Principles
//!
//! - **No daemon, no database**: a lock is a file under the lock directory; its
//!   existence is the lock, its mtime is the heartbeat.
//! - **At most one live owner per worktree**: the exclusive create is the only
//!   linearization point; stale locks are reclaimed best-effort.
//! - **Synchronous**: every operation blocks briefly and never polls.
//! - **Seams are traits**: git ([`git::GitRunner`]), tmux ([`tmux::TmuxClient`])
//!   and the process table ([`lock::ProcessTable`]) can be faked.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wtx_core::{CommandGit, CommandTmux, LockManager, LockStore, WorktreePool};
//!
//! let config = wtx_core::load_config()?;
//! let store = LockStore::new(config.resolved_lock_dir()?);
//! let locks = LockManager::system(store, Arc::new(CommandTmux::new()), config.stale_after());
//! let pool = WorktreePool::new(std::env::current_dir()?, Arc::new(CommandGit::new()), locks);
//! let created = pool.create_worktree("feature/login")?;
//! ```

pub mod config;
pub mod error;
pub mod git;
pub mod lock;
pub mod pane;
pub mod pool;
pub mod tmux;
pub mod worktree;

#[cfg(test)]
mod test_support;

pub use config::{load_config, WtxConfig};
pub use error::{Result, WtxError};
pub use git::{CommandGit, CommandOutput, GitRunner};
pub use lock::{LockManager, LockRecord, LockStore, OwnerContext, WorktreeLock};
pub use pane::{PaneBinder, WORKTREE_PATH_ENV};
pub use pool::{next_slot, MAX_POOL_SLOTS};
pub use tmux::{CommandTmux, TmuxClient};
pub use worktree::{PoolStatus, WorktreeInfo, WorktreePool};
