//! Acquire, release and rebind worktree locks.
//!
//! # States
//!
//! ```text
//! Unlocked ──acquire──▶ Locked(live) ──owner dies──▶ Locked(stale)
//!    ▲                      │  ▲                          │
//!    └──release/force───────┘  └────reclaim (overwrite)───┘
//! ```
//!
//! The exclusive create is the only linearization point. Reclaiming a stale lock
//! is best-effort: two reclaimers can both decide the record is stale, both rename
//! over it, and the loser only notices when reading back. That loser gets
//! [`WtxError::StaleLockReclaimRace`].

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::liveness::{LivenessOracle, SystemProcesses};
use super::owner::{encode_owner_id, rebind_owner_window, OwnerContext};
use super::store::{resolve_real_path, CreateOutcome, LockRecord, LockStore};
use crate::error::{Result, WtxError};
use crate::tmux::TmuxClient;

/// Interval between heartbeat touches.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct LockManager {
    store: LockStore,
    oracle: LivenessOracle,
    identity: OwnerContext,
}

impl LockManager {
    pub fn new(store: LockStore, oracle: LivenessOracle, identity: OwnerContext) -> Self {
        Self {
            store,
            oracle,
            identity,
        }
    }

    /// Real tmux, real process table, identity of the calling process.
    pub fn system(store: LockStore, tmux: Arc<dyn TmuxClient>, stale_after: Duration) -> Self {
        let identity = OwnerContext::detect(tmux.as_ref());
        let oracle =
            LivenessOracle::new(tmux, Arc::new(SystemProcesses)).with_stale_after(stale_after);
        Self::new(store, oracle, identity)
    }

    pub fn store(&self) -> &LockStore {
        &self.store
    }

    pub fn oracle(&self) -> &LivenessOracle {
        &self.oracle
    }

    pub fn identity(&self) -> &OwnerContext {
        &self.identity
    }

    /// Owner id this manager writes for its own acquisitions.
    pub fn owner_id(&self) -> String {
        encode_owner_id(&self.identity)
    }

    pub fn acquire(&self, repo_root: &Path, worktree: &Path) -> Result<WorktreeLock> {
        self.acquire_for_pid(repo_root, worktree, std::process::id())
    }

    pub fn acquire_for_pid(&self, repo_root: &Path, worktree: &Path, pid: u32) -> Result<WorktreeLock> {
        self.acquire_as(repo_root, worktree, self.owner_id(), pid)
    }

    /// Acquires on behalf of an explicit owner (e.g. another tmux pane).
    pub fn acquire_as(
        &self,
        repo_root: &Path,
        worktree: &Path,
        owner_id: String,
        pid: u32,
    ) -> Result<WorktreeLock> {
        let path = self.store.lock_path(repo_root, worktree)?;
        let record = LockRecord::new(
            owner_id,
            pid,
            resolve_real_path(repo_root)?,
            resolve_real_path(worktree)?,
        );

        if self.store.create(&path, &record)? == CreateOutcome::Created {
            debug!(
                worktree = %record.worktree_path.display(),
                owner_id = %record.owner_id,
                pid = record.pid,
                "Acquired worktree lock"
            );
            return Ok(WorktreeLock::new(self.store.clone(), path, record));
        }

        match self.store.read(&path) {
            Ok(Some((existing, last_touched))) => {
                if self.oracle.is_record_active(&existing, last_touched) {
                    return Err(WtxError::Locked {
                        worktree: record.worktree_path.clone(),
                        owner_id: existing.owner_id,
                        pid: existing.pid,
                    });
                }
                warn!(
                    worktree = %record.worktree_path.display(),
                    stale_owner = %existing.owner_id,
                    stale_pid = existing.pid,
                    "Reclaiming stale worktree lock"
                );
            }
            Ok(None) => {
                // Released between our create and read: one more exclusive try.
                return match self.store.create(&path, &record)? {
                    CreateOutcome::Created => {
                        Ok(WorktreeLock::new(self.store.clone(), path, record))
                    }
                    CreateOutcome::AlreadyExists => Err(WtxError::StaleLockReclaimRace {
                        worktree: record.worktree_path,
                    }),
                };
            }
            Err(WtxError::CorruptLock { path: lock_path, details }) => {
                warn!(
                    lock = %lock_path.display(),
                    details = %details,
                    "Reclaiming corrupt worktree lock"
                );
            }
            Err(err) => return Err(err),
        }

        self.store.overwrite(&path, &record)?;
        match self.store.read(&path) {
            Ok(Some((current, _))) if same_holder(&current, &record) => {
                debug!(
                    worktree = %record.worktree_path.display(),
                    owner_id = %record.owner_id,
                    pid = record.pid,
                    "Reclaimed worktree lock"
                );
                Ok(WorktreeLock::new(self.store.clone(), path, record))
            }
            _ => Err(WtxError::StaleLockReclaimRace {
                worktree: record.worktree_path,
            }),
        }
    }

    /// No lock file, a corrupt one, or a stale one. Never modifies anything.
    pub fn is_available(&self, repo_root: &Path, worktree: &Path) -> Result<bool> {
        Ok(self.holder(repo_root, worktree)?.is_none())
    }

    /// The live record for `worktree`, if any.
    pub fn holder(&self, repo_root: &Path, worktree: &Path) -> Result<Option<LockRecord>> {
        let path = self.store.lock_path(repo_root, worktree)?;
        match self.store.read(&path) {
            Ok(Some((record, last_touched))) => Ok(self
                .oracle
                .is_record_active(&record, last_touched)
                .then_some(record)),
            Ok(None) | Err(WtxError::CorruptLock { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Deletes the lock regardless of who holds it.
    pub fn force_unlock(&self, repo_root: &Path, worktree: &Path) -> Result<()> {
        let path = self.store.lock_path(repo_root, worktree)?;
        self.store.delete(&path)?;
        debug!(worktree = %worktree.display(), "Force-unlocked worktree");
        Ok(())
    }

    pub fn rebind(&self, lock: &mut WorktreeLock, new_pid: u32) -> Result<()> {
        self.rebind_with_window(lock, new_pid, None)
    }

    /// Points an existing lock at a new PID, and optionally a new tmux window.
    ///
    /// The lock path, repository and worktree stay the same. Fails with `Locked`
    /// if someone else took the lock over since `lock` was acquired.
    pub fn rebind_with_window(
        &self,
        lock: &mut WorktreeLock,
        new_pid: u32,
        window: Option<&str>,
    ) -> Result<()> {
        let mut next = lock.record.clone();
        next.owner_id = rebind_owner_window(&lock.record.owner_id, window);
        next.pid = new_pid;
        if lock.record.pid != new_pid {
            next.rebound_from = Some(lock.record.pid);
        }

        match self.store.read(&lock.path) {
            Ok(Some((current, _))) if !same_holder(&current, &lock.record) => {
                return Err(WtxError::Locked {
                    worktree: lock.record.worktree_path.clone(),
                    owner_id: current.owner_id,
                    pid: current.pid,
                });
            }
            Ok(Some(_)) | Err(WtxError::CorruptLock { .. }) => {
                self.store.overwrite(&lock.path, &next)?;
            }
            Ok(None) => {
                if self.store.create(&lock.path, &next)? == CreateOutcome::AlreadyExists {
                    return Err(WtxError::StaleLockReclaimRace {
                        worktree: lock.record.worktree_path.clone(),
                    });
                }
            }
            Err(err) => return Err(err),
        }

        debug!(
            worktree = %next.worktree_path.display(),
            from_pid = lock.record.pid,
            to_pid = next.pid,
            owner_id = %next.owner_id,
            "Rebound worktree lock"
        );
        lock.record = next;
        Ok(())
    }
}

fn same_holder(a: &LockRecord, b: &LockRecord) -> bool {
    a.pid == b.pid && a.owner_id == b.owner_id && a.acquired_at == b.acquired_at
}

/// A held lock. Dropping it stops the heartbeat but leaves the file in place;
/// call [`WorktreeLock::release`] to give the worktree back.
pub struct WorktreeLock {
    store: LockStore,
    path: PathBuf,
    record: LockRecord,
    toucher: Option<Toucher>,
}

struct Toucher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl WorktreeLock {
    fn new(store: LockStore, path: PathBuf, record: LockRecord) -> Self {
        Self {
            store,
            path,
            record,
            toucher: None,
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn worktree_path(&self) -> &Path {
        &self.record.worktree_path
    }

    pub fn repo_root(&self) -> &Path {
        &self.record.repo_root
    }

    pub fn pid(&self) -> u32 {
        self.record.pid
    }

    pub fn is_heartbeating(&self) -> bool {
        self.toucher.is_some()
    }

    /// Touches the lock file every `interval` on a background thread.
    pub fn start_toucher(&mut self, interval: Duration) -> Result<()> {
        if self.toucher.is_some() {
            return Ok(());
        }
        let (stop, stopped) = mpsc::channel::<()>();
        let store = self.store.clone();
        let path = self.path.clone();
        let handle = thread::Builder::new()
            .name("wtx-lock-heartbeat".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = store.touch(&path) {
                            warn!(lock = %path.display(), error = %err, "Lock heartbeat failed");
                            if !path.exists() {
                                return;
                            }
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .map_err(|err| WtxError::io("spawning lock heartbeat thread", err))?;
        self.toucher = Some(Toucher { stop, handle });
        Ok(())
    }

    /// Stops the heartbeat and waits for the thread, so no touch follows.
    pub fn stop_toucher(&mut self) {
        if let Some(toucher) = self.toucher.take() {
            let _ = toucher.stop.send(());
            if toucher.handle.join().is_err() {
                warn!(lock = %self.path.display(), "Lock heartbeat thread panicked");
            }
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.stop_toucher();
        self.store.delete(&self.path)?;
        debug!(
            worktree = %self.record.worktree_path.display(),
            pid = self.record.pid,
            "Released worktree lock"
        );
        Ok(())
    }
}

impl Drop for WorktreeLock {
    fn drop(&mut self) {
        self.stop_toucher();
    }
}

impl std::fmt::Debug for WorktreeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeLock")
            .field("path", &self.path)
            .field("record", &self.record)
            .field("heartbeating", &self.toucher.is_some())
            .finish()
    }
}
