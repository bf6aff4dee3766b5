//! Foreground lock holder.
//!
//! Acquires a worktree lock on behalf of `pid`, heartbeats it, and releases it
//! once that process exits.
//!
//! ## Lifecycle
//!
//! 1. Spawned by a wrapper (shell hook, editor task) with the PID to track
//! 2. Polls the PID via `kill -0` once per second
//! 3. Exits early, leaving the file alone, if the lock vanished or changed hands
//! 4. When the PID exits: stop heartbeating and delete the lock

use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};
use wtx_core::lock::is_pid_alive;
use wtx_core::{LockStore, WorktreeLock};

use crate::app::{App, CliError};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
pub enum HoldOutcome {
    /// The tracked process exited; the lock is ours to release.
    ProcessExited,
    /// Someone deleted the lock file (usually `wtx unlock`).
    LockRemoved,
    TakenOver { pid: u32, owner_id: String },
}

pub fn run(app: &App, worktree: &Path, pid: u32) -> Result<(), CliError> {
    let worktree = app.resolve(worktree)?;
    let mut lock = app.pool().acquire_worktree_lock_for_pid(&worktree, pid)?;
    lock.start_toucher(app.config.heartbeat_interval())?;
    info!(
        worktree = %worktree.display(),
        pid,
        lock = %lock.lock_path().display(),
        "Holding worktree lock"
    );

    let outcome = watch(
        app.locks.store(),
        &lock,
        || is_pid_alive(pid),
        POLL_INTERVAL,
    );
    finish(lock, &outcome)?;
    Ok(())
}

/// Blocks until the holder should stop.
pub fn watch(
    store: &LockStore,
    lock: &WorktreeLock,
    mut alive: impl FnMut() -> bool,
    poll: Duration,
) -> HoldOutcome {
    let expected = lock.record();
    while alive() {
        match store.read(lock.lock_path()) {
            Ok(None) => return HoldOutcome::LockRemoved,
            Ok(Some((record, _))) => {
                if record.pid != expected.pid || record.owner_id != expected.owner_id {
                    return HoldOutcome::TakenOver {
                        pid: record.pid,
                        owner_id: record.owner_id,
                    };
                }
            }
            Err(err) => {
                warn!(lock = %lock.lock_path().display(), error = %err, "Unreadable lock file");
            }
        }
        thread::sleep(poll);
    }
    HoldOutcome::ProcessExited
}

fn finish(mut lock: WorktreeLock, outcome: &HoldOutcome) -> Result<(), CliError> {
    let worktree = lock.worktree_path().display().to_string();
    match outcome {
        HoldOutcome::ProcessExited => {
            let pid = lock.pid();
            lock.release()?;
            info!(worktree = %worktree, pid, "Lock released (process exited)");
        }
        HoldOutcome::LockRemoved => {
            lock.stop_toucher();
            info!(worktree = %worktree, "Lock removed externally, exiting holder");
        }
        HoldOutcome::TakenOver { pid, owner_id } => {
            lock.stop_toucher();
            info!(worktree = %worktree, pid, owner_id = %owner_id, "Lock taken over, exiting holder");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use wtx_core::{CommandTmux, LockManager, LockRecord};

    fn manager(dir: &Path) -> LockManager {
        LockManager::system(
            LockStore::new(dir.join("locks")),
            Arc::new(CommandTmux::new()),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn exits_when_process_dies() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        let me = std::process::id();
        let lock = locks
            .acquire_for_pid(dir.path(), &dir.path().join("wt.1"), me)
            .unwrap();

        let mut polls = 0;
        let outcome = watch(
            locks.store(),
            &lock,
            || {
                polls += 1;
                polls < 3
            },
            Duration::from_millis(1),
        );
        assert_eq!(outcome, HoldOutcome::ProcessExited);

        let path = lock.lock_path().to_path_buf();
        finish(lock, &outcome).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn stops_when_lock_removed_or_replaced() {
        let dir = tempdir().unwrap();
        let locks = manager(dir.path());
        let me = std::process::id();
        let worktree = dir.path().join("wt.1");
        let lock = locks.acquire_for_pid(dir.path(), &worktree, me).unwrap();

        let replacement = LockRecord::new("someone@else".to_string(), me, dir.path(), &worktree);
        locks
            .store()
            .overwrite(lock.lock_path(), &replacement)
            .unwrap();
        let outcome = watch(locks.store(), &lock, || true, Duration::from_millis(1));
        assert_eq!(
            outcome,
            HoldOutcome::TakenOver {
                pid: me,
                owner_id: "someone@else".to_string()
            }
        );

        locks.store().delete(lock.lock_path()).unwrap();
        let outcome = watch(locks.store(), &lock, || true, Duration::from_millis(1));
        assert_eq!(outcome, HoldOutcome::LockRemoved);
        finish(lock, &outcome).unwrap();
    }
}
