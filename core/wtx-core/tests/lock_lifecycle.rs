//! End-to-end lock and pool behavior through the public API.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::{tempdir, TempDir};
use wtx_core::lock::{LivenessOracle, ProcessTable};
use wtx_core::{
    CommandOutput, GitRunner, LockManager, LockStore, OwnerContext, Result, TmuxClient,
    WorktreePool, WtxError,
};

#[derive(Default)]
struct Processes(Mutex<HashSet<u32>>);

impl Processes {
    fn alive(pids: &[u32]) -> Self {
        Self(Mutex::new(pids.iter().copied().collect()))
    }

    fn kill(&self, pid: u32) {
        self.0.lock().unwrap().remove(&pid);
    }
}

impl ProcessTable for Processes {
    fn is_alive(&self, pid: u32) -> bool {
        self.0.lock().unwrap().contains(&pid)
    }
}

/// Only answers session existence; everything else is "not in tmux".
#[derive(Default)]
struct Sessions(Mutex<HashSet<String>>);

impl Sessions {
    fn with(ids: &[&str]) -> Self {
        Self(Mutex::new(ids.iter().map(|id| id.to_string()).collect()))
    }

    fn end(&self, id: &str) {
        self.0.lock().unwrap().remove(id);
    }
}

impl TmuxClient for Sessions {
    fn in_tmux(&self) -> bool {
        false
    }

    fn session_exists(&self, session_id: &str) -> Option<bool> {
        Some(self.0.lock().unwrap().contains(session_id))
    }

    fn window_exists(&self, session_id: &str, _window_id: &str) -> Option<bool> {
        self.session_exists(session_id)
    }

    fn display_message(&self, _target: Option<&str>, _format: &str) -> Option<String> {
        None
    }

    fn pane_pid(&self, _pane_id: &str) -> Result<u32> {
        Err(WtxError::TmuxUnavailable)
    }

    fn show_session_option(&self, _session_id: &str, _name: &str) -> Option<String> {
        None
    }

    fn set_session_option(&self, _session_id: &str, _name: &str, _value: &str) -> Result<()> {
        Err(WtxError::TmuxUnavailable)
    }

    fn respawn_pane(&self, _target: &str, _cwd: &Path, _command: &str) -> Result<()> {
        Err(WtxError::TmuxUnavailable)
    }
}

/// Just enough git for the pool: a fixed toplevel and `worktree add` that mkdirs.
struct MiniGit {
    root: PathBuf,
}

impl GitRunner for MiniGit {
    fn available(&self) -> bool {
        true
    }

    fn run(&self, _dir: &Path, args: &[&str]) -> Result<CommandOutput> {
        match args {
            ["rev-parse", "--show-toplevel"] => {
                Ok(CommandOutput::ok(&self.root.to_string_lossy()))
            }
            ["worktree", "add", "-b", _branch, path, _base] => {
                fs_err::create_dir_all(path).map_err(|err| WtxError::io("mkdir", err))?;
                Ok(CommandOutput::ok(""))
            }
            ["remote", ..] | ["symbolic-ref", ..] => Ok(CommandOutput::failed("no")),
            _ => Ok(CommandOutput::ok("")),
        }
    }
}

struct World {
    dir: TempDir,
    repo: PathBuf,
    tmux: Arc<Sessions>,
    processes: Arc<Processes>,
}

impl World {
    fn new(sessions: &[&str], alive: &[u32]) -> Self {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("app");
        fs_err::create_dir_all(&repo).unwrap();
        Self {
            repo,
            tmux: Arc::new(Sessions::with(sessions)),
            processes: Arc::new(Processes::alive(alive)),
            dir,
        }
    }

    fn lock_dir(&self) -> PathBuf {
        self.dir.path().join("locks")
    }

    fn slot(&self, n: usize) -> PathBuf {
        self.dir.path().join("app.wt").join(format!("wt.{n}"))
    }

    fn manager(&self, identity: OwnerContext) -> LockManager {
        let oracle = LivenessOracle::new(self.tmux.clone(), self.processes.clone());
        LockManager::new(LockStore::new(self.lock_dir()), oracle, identity)
    }

    fn user(&self, name: &str) -> LockManager {
        self.manager(OwnerContext {
            user: Some(name.to_string()),
            host: Some("box".to_string()),
            ..OwnerContext::default()
        })
    }

    fn tmux_user(&self, session: &str, window: &str) -> LockManager {
        self.manager(OwnerContext {
            tmux_session: Some(session.to_string()),
            tmux_window: Some(window.to_string()),
            ..OwnerContext::default()
        })
    }
}

#[test]
fn live_holder_blocks_and_dead_holder_is_reclaimed() {
    let world = World::new(&[], &[11, 22]);
    let wt = world.slot(1);
    let a = world.user("a");
    let b = world.user("b");

    let _held = a.acquire_for_pid(&world.repo, &wt, 11).unwrap();
    let err = b.acquire_for_pid(&world.repo, &wt, 22).unwrap_err();
    assert!(err.is_locked(), "{err}");
    assert!(err.to_string().contains("wtx unlock"));

    world.processes.kill(11);
    let taken = b.acquire_for_pid(&world.repo, &wt, 22).unwrap();
    assert_eq!(taken.record().owner_id, "b@box");
    assert_eq!(
        b.holder(&world.repo, &wt).unwrap().map(|r| r.pid),
        Some(22)
    );
}

#[test]
fn ended_tmux_session_frees_the_worktree() {
    let world = World::new(&["$1"], &[11, 22]);
    let wt = world.slot(1);
    let owner = world.tmux_user("$1", "@1");
    let other = world.user("b");

    let _held = owner.acquire_for_pid(&world.repo, &wt, 11).unwrap();
    assert!(!other.is_available(&world.repo, &wt).unwrap());

    world.tmux.end("$1");
    assert!(other.is_available(&world.repo, &wt).unwrap());
    other.acquire_for_pid(&world.repo, &wt, 22).unwrap();
}

#[test]
fn rebind_survives_the_original_pid_exiting() {
    let world = World::new(&["$1"], &[11, 33]);
    let wt = world.slot(1);
    let owner = world.tmux_user("$1", "@1");

    let mut lock = owner.acquire_for_pid(&world.repo, &wt, 11).unwrap();
    let path = lock.lock_path().to_path_buf();
    owner.rebind(&mut lock, 33).unwrap();
    world.processes.kill(11);

    assert_eq!(lock.lock_path(), path);
    let other = world.user("b");
    assert!(!other.is_available(&world.repo, &wt).unwrap());
    assert!(other.acquire_for_pid(&world.repo, &wt, 44).unwrap_err().is_locked());

    lock.release().unwrap();
    assert!(other.is_available(&world.repo, &wt).unwrap());
}

#[test]
fn force_unlock_then_acquire() {
    let world = World::new(&[], &[11, 22]);
    let wt = world.slot(1);
    let a = world.user("a");
    let b = world.user("b");

    let _held = a.acquire_for_pid(&world.repo, &wt, 11).unwrap();
    b.force_unlock(&world.repo, &wt).unwrap();
    assert!(b.is_available(&world.repo, &wt).unwrap());
    b.acquire_for_pid(&world.repo, &wt, 22).unwrap();
}

#[test]
fn create_worktree_allocates_first_free_slot() {
    let world = World::new(&[], &[std::process::id()]);
    fs_err::create_dir_all(world.slot(1)).unwrap();
    fs_err::create_dir_all(world.slot(2)).unwrap();

    let git = Arc::new(MiniGit {
        root: world.repo.clone(),
    });
    let pool = WorktreePool::new(&world.repo, git, world.user("a"));

    let created = pool.create_worktree("feature/q").unwrap();
    assert_eq!(created.path, world.slot(3));
    assert!(created.path.is_dir());

    let leftover = fs_err::read_dir(world.lock_dir())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0, "create must release its slot lock");
}
