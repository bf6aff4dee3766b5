//! Cross-process worktree locks.
//!
//! - [`owner`]: who holds a lock (`tmux:<session>[:<window>]` or `user@host`)
//! - [`liveness`]: is that holder still around
//! - [`store`]: one JSON file per worktree under the lock directory
//! - [`manager`]: acquire / release / rebind / heartbeat

pub mod liveness;
pub mod manager;
pub mod owner;
pub mod store;

pub use liveness::{
    is_pid_alive, Liveness, LivenessOracle, ProcessTable, SystemProcesses, DEFAULT_STALE_AFTER,
};
pub use manager::{LockManager, WorktreeLock, DEFAULT_HEARTBEAT_INTERVAL};
pub use owner::{encode_owner_id, parse_tmux_owner_id, OwnerContext, TmuxOwner};
pub use store::{LockRecord, LockStore};
