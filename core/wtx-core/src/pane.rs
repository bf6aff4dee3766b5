//! Binding worktree locks to tmux panes and child processes.
//!
//! A tmux pane keeps its id across `respawn-pane` but gets a new shell PID. The
//! binder turns the pane id into the current PID and either rebinds the lock the
//! caller already holds or acquires one for that PID. The bound worktree is also
//! recorded on the session (`@wtx_worktree_path`) so later popups and helpers can
//! find it without the lock file.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, WtxError};
use crate::git::{self, GitRunner};
use crate::lock::{encode_owner_id, LockManager, OwnerContext, WorktreeLock};
use crate::tmux::{TmuxClient, WORKTREE_PATH_OPTION};

/// Environment variable naming the worktree a process was started for.
pub const WORKTREE_PATH_ENV: &str = "WTX_WORKTREE_PATH";

/// tmux's "last active pane" target.
const LAST_ACTIVE_PANE: &str = "!";

pub struct PaneBinder {
    tmux: Arc<dyn TmuxClient>,
    git: Arc<dyn GitRunner>,
    locks: LockManager,
}

impl PaneBinder {
    pub fn new(tmux: Arc<dyn TmuxClient>, git: Arc<dyn GitRunner>, locks: LockManager) -> Self {
        Self { tmux, git, locks }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Binds `worktree` to whatever process currently runs in `pane_id`.
    ///
    /// With `existing`, that lock is rebound in place (same file, new PID and
    /// window). Otherwise a lock is acquired on behalf of the pane's session.
    pub fn bind_pane(
        &self,
        worktree: &Path,
        pane_id: &str,
        existing: Option<WorktreeLock>,
    ) -> Result<WorktreeLock> {
        let pane_id = pane_id.trim();
        if pane_id.is_empty() {
            return Err(WtxError::InvalidInput("tmux pane id required".to_string()));
        }
        let pid = self.tmux.pane_pid(pane_id)?;
        let window = self.tmux.pane_window_id(pane_id);
        let session = self.tmux.pane_session_id(pane_id);

        let lock = match existing {
            Some(mut lock) => {
                self.locks
                    .rebind_with_window(&mut lock, pid, window.as_deref())?;
                lock
            }
            None => {
                let repo_root = git::repo_root(self.git.as_ref(), worktree)?;
                let owner_id = match &session {
                    Some(session) => encode_owner_id(&OwnerContext {
                        tmux_session: Some(session.clone()),
                        tmux_window: window.clone(),
                        ..self.locks.identity().clone()
                    }),
                    None => self.locks.owner_id(),
                };
                self.locks.acquire_as(&repo_root, worktree, owner_id, pid)?
            }
        };

        if let Some(session) = &session {
            self.remember_session_worktree(session, worktree);
        }
        debug!(
            worktree = %worktree.display(),
            pane = pane_id,
            pid,
            "Bound worktree to tmux pane"
        );
        Ok(lock)
    }

    /// Non-tmux variant: binds `worktree` to a child process.
    pub fn bind_pid(
        &self,
        worktree: &Path,
        pid: u32,
        existing: Option<WorktreeLock>,
    ) -> Result<WorktreeLock> {
        match existing {
            Some(mut lock) => {
                self.locks.rebind(&mut lock, pid)?;
                Ok(lock)
            }
            None => {
                let repo_root = git::repo_root(self.git.as_ref(), worktree)?;
                self.locks.acquire_for_pid(&repo_root, worktree, pid)
            }
        }
    }

    /// Gives the worktree back and restarts `command` in the pane.
    ///
    /// The lock is force-released first so a stale pane owner never blocks
    /// reuse. When the pane cannot be targeted (popups), tmux's last active pane
    /// is used instead.
    pub fn hand_back(&self, worktree: &Path, pane_id: Option<&str>, command: &str) -> Result<()> {
        if worktree.as_os_str().is_empty() {
            return Err(WtxError::InvalidInput("worktree path required".to_string()));
        }

        match git::repo_root(self.git.as_ref(), worktree) {
            Ok(repo_root) => {
                if let Err(err) = self.locks.force_unlock(&repo_root, worktree) {
                    warn!(worktree = %worktree.display(), error = %err, "Hand-back unlock failed");
                }
            }
            Err(err) => {
                warn!(worktree = %worktree.display(), error = %err, "Hand-back could not resolve repository");
            }
        }

        let pane = self.resolve_pane(pane_id).ok_or_else(|| {
            WtxError::InvalidInput("unable to resolve active tmux pane".to_string())
        })?;
        match self.tmux.respawn_pane(&pane, worktree, command) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(pane = %pane, error = %err, "Respawn failed; retrying last active pane");
                self.tmux.respawn_pane(LAST_ACTIVE_PANE, worktree, command)
            }
        }
    }

    /// `WTX_WORKTREE_PATH`, then the current session's option, then the pane's cwd.
    pub fn resolve_bound_worktree(&self) -> Option<PathBuf> {
        self.resolve_bound_worktree_from(env::var(WORKTREE_PATH_ENV).ok())
    }

    pub fn resolve_bound_worktree_from(&self, env_value: Option<String>) -> Option<PathBuf> {
        if let Some(path) = env_value.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            return Some(PathBuf::from(path));
        }
        if let Some(session) = self.tmux.current_session_id() {
            if let Some(path) = self.bound_worktree_for_session(&session) {
                return Some(path);
            }
        }
        self.tmux
            .display_message(None, "#{pane_current_path}")
            .map(PathBuf::from)
    }

    pub fn bound_worktree_for_session(&self, session_id: &str) -> Option<PathBuf> {
        self.tmux
            .show_session_option(session_id, WORKTREE_PATH_OPTION)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }

    fn remember_session_worktree(&self, session_id: &str, worktree: &Path) {
        let value = worktree.to_string_lossy();
        if let Err(err) = self
            .tmux
            .set_session_option(session_id, WORKTREE_PATH_OPTION, &value)
        {
            warn!(session = session_id, error = %err, "Failed to record session worktree");
        }
    }

    fn resolve_pane(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::trim)
            .filter(|pane| !pane.is_empty())
            .map(str::to_string)
            .or_else(|| {
                env::var("TMUX_PANE")
                    .ok()
                    .map(|pane| pane.trim().to_string())
                    .filter(|pane| !pane.is_empty())
            })
            .or_else(|| self.tmux.current_pane_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LivenessOracle, LockStore};
    use crate::test_support::{FakeGit, FakeProcesses, FakeTmux};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        repo: PathBuf,
        worktree: PathBuf,
        tmux: Arc<FakeTmux>,
        processes: Arc<FakeProcesses>,
        binder: PaneBinder,
    }

    fn fixture(tmux: FakeTmux) -> Fixture {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("app");
        let worktree = dir.path().join("app.wt").join("wt.1");
        fs_err::create_dir_all(&repo).unwrap();
        fs_err::create_dir_all(&worktree).unwrap();

        let tmux = Arc::new(tmux);
        let processes = Arc::new(FakeProcesses::with_alive(&[500, 600, 700]));
        let git = Arc::new(FakeGit::new(&repo));
        let oracle = LivenessOracle::new(tmux.clone(), processes.clone());
        let identity = OwnerContext {
            user: Some("pete".to_string()),
            ..OwnerContext::default()
        };
        let locks = LockManager::new(LockStore::new(dir.path().join("locks")), oracle, identity);
        Fixture {
            binder: PaneBinder::new(tmux.clone(), git, locks),
            _dir: dir,
            repo,
            worktree,
            tmux,
            processes,
        }
    }

    fn one_pane() -> FakeTmux {
        FakeTmux::default()
            .with_session("$1", &["@2", "@3"])
            .with_pane("%1", 500, "$1", "@2")
    }

    #[test]
    fn binding_a_pane_acquires_for_its_pid_and_session() {
        let fx = fixture(one_pane());
        let lock = fx.binder.bind_pane(&fx.worktree, "%1", None).unwrap();

        assert_eq!(lock.pid(), 500);
        assert_eq!(lock.record().owner_id, "tmux:$1:@2");
        assert_eq!(
            fx.tmux.option("$1", WORKTREE_PATH_OPTION),
            Some(fx.worktree.to_string_lossy().to_string())
        );
        let holder = fx
            .binder
            .locks()
            .holder(&fx.repo, &fx.worktree)
            .unwrap()
            .unwrap();
        assert_eq!(holder.pid, 500);
    }

    #[test]
    fn respawned_pane_rebinds_the_same_lock() {
        let fx = fixture(one_pane());
        let lock = fx.binder.bind_pane(&fx.worktree, "%1", None).unwrap();
        let path = lock.lock_path().to_path_buf();

        fx.tmux.respawn_pid("%1", 600);
        fx.processes.kill(500);
        let lock = fx.binder.bind_pane(&fx.worktree, "%1", Some(lock)).unwrap();

        assert_eq!(lock.lock_path(), path);
        assert_eq!(lock.pid(), 600);
        assert_eq!(lock.record().rebound_from, Some(500));
        assert!(!fx
            .binder
            .locks()
            .is_available(&fx.repo, &fx.worktree)
            .unwrap());
    }

    #[test]
    fn moving_to_another_window_updates_owner() {
        let tmux = one_pane().with_pane("%4", 700, "$1", "@3");
        let fx = fixture(tmux);
        let lock = fx.binder.bind_pane(&fx.worktree, "%1", None).unwrap();
        let lock = fx.binder.bind_pane(&fx.worktree, "%4", Some(lock)).unwrap();
        assert_eq!(lock.record().owner_id, "tmux:$1:@3");
        assert_eq!(lock.pid(), 700);
    }

    #[test]
    fn second_pane_cannot_steal_a_live_binding() {
        let tmux = FakeTmux::default()
            .with_session("$1", &["@2"])
            .with_session("$9", &["@1"])
            .with_pane("%1", 500, "$1", "@2")
            .with_pane("%7", 600, "$9", "@1");
        let fx = fixture(tmux);
        let _held = fx.binder.bind_pane(&fx.worktree, "%1", None).unwrap();
        let err = fx.binder.bind_pane(&fx.worktree, "%7", None).unwrap_err();
        assert!(err.is_locked());
    }

    #[test]
    fn unknown_pane_is_an_error() {
        let fx = fixture(one_pane());
        assert!(fx.binder.bind_pane(&fx.worktree, "%99", None).is_err());
        assert!(fx.binder.bind_pane(&fx.worktree, "  ", None).is_err());
    }

    #[test]
    fn bind_pid_acquires_then_rebinds() {
        let fx = fixture(FakeTmux::default());
        let lock = fx.binder.bind_pid(&fx.worktree, 500, None).unwrap();
        assert_eq!(lock.record().owner_id, "pete");
        let lock = fx.binder.bind_pid(&fx.worktree, 600, Some(lock)).unwrap();
        assert_eq!(lock.pid(), 600);
        assert_eq!(lock.record().rebound_from, Some(500));
    }

    #[test]
    fn hand_back_unlocks_and_respawns_the_pane() {
        let fx = fixture(one_pane());
        let _lock = fx.binder.bind_pane(&fx.worktree, "%1", None).unwrap();

        fx.binder
            .hand_back(&fx.worktree, Some("%1"), "exec wtx")
            .unwrap();

        assert!(fx
            .binder
            .locks()
            .is_available(&fx.repo, &fx.worktree)
            .unwrap());
        let respawned = fx.tmux.respawned.lock().unwrap().clone();
        assert_eq!(
            respawned,
            vec![("%1".to_string(), fx.worktree.clone(), "exec wtx".to_string())]
        );
    }

    #[test]
    fn hand_back_falls_back_to_last_active_pane() {
        let fx = fixture(one_pane().fail_respawn("%1"));
        fx.binder
            .hand_back(&fx.worktree, Some("%1"), "exec wtx")
            .unwrap();
        let respawned = fx.tmux.respawned.lock().unwrap().clone();
        assert_eq!(respawned.len(), 1);
        assert_eq!(respawned[0].0, "!");
    }

    #[test]
    fn bound_worktree_prefers_env_then_session_option() {
        let fx = fixture(one_pane().inside("%1", "$1", "@2"));
        assert_eq!(
            fx.binder
                .resolve_bound_worktree_from(Some("/from/env".to_string())),
            Some(PathBuf::from("/from/env"))
        );
        assert_eq!(fx.binder.resolve_bound_worktree_from(None), None);

        let _lock = fx.binder.bind_pane(&fx.worktree, "%1", None).unwrap();
        assert_eq!(
            fx.binder.resolve_bound_worktree_from(Some("  ".to_string())),
            Some(fx.worktree.clone())
        );
    }
}
