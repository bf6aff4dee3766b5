//! Fakes for tmux, git and the process table used by unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, WtxError};
use crate::git::{CommandOutput, GitRunner};
use crate::lock::liveness::ProcessTable;
use crate::tmux::TmuxClient;

#[derive(Default)]
pub struct FakeProcesses {
    alive: Mutex<HashSet<u32>>,
}

impl FakeProcesses {
    pub fn with_alive(pids: &[u32]) -> Self {
        Self {
            alive: Mutex::new(pids.iter().copied().collect()),
        }
    }

    pub fn kill(&self, pid: u32) {
        self.alive.lock().expect("lock alive").remove(&pid);
    }
}

impl ProcessTable for FakeProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().expect("lock alive").contains(&pid)
    }
}

#[derive(Clone)]
pub struct FakePane {
    pub pid: u32,
    pub session_id: String,
    pub window_id: String,
}

pub struct FakeTmux {
    reachable: bool,
    current: Option<(String, String, String)>,
    sessions: Mutex<HashMap<String, Vec<String>>>,
    panes: Mutex<HashMap<String, FakePane>>,
    options: Mutex<HashMap<(String, String), String>>,
    pub respawned: Mutex<Vec<(String, PathBuf, String)>>,
    failing_targets: Mutex<HashSet<String>>,
}

impl Default for FakeTmux {
    fn default() -> Self {
        Self {
            reachable: true,
            current: None,
            sessions: Mutex::new(HashMap::new()),
            panes: Mutex::new(HashMap::new()),
            options: Mutex::new(HashMap::new()),
            respawned: Mutex::new(Vec::new()),
            failing_targets: Mutex::new(HashSet::new()),
        }
    }
}

impl FakeTmux {
    /// A tmux whose server cannot be reached: every existence query is inconclusive.
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::default()
        }
    }

    pub fn with_session(self, session_id: &str, windows: &[&str]) -> Self {
        self.sessions.lock().expect("lock sessions").insert(
            session_id.to_string(),
            windows.iter().map(|w| w.to_string()).collect(),
        );
        self
    }

    pub fn with_pane(self, pane_id: &str, pid: u32, session_id: &str, window_id: &str) -> Self {
        self.panes.lock().expect("lock panes").insert(
            pane_id.to_string(),
            FakePane {
                pid,
                session_id: session_id.to_string(),
                window_id: window_id.to_string(),
            },
        );
        self
    }

    /// Makes the calling process look like it runs in `pane_id`.
    pub fn inside(mut self, pane_id: &str, session_id: &str, window_id: &str) -> Self {
        self.current = Some((
            pane_id.to_string(),
            session_id.to_string(),
            window_id.to_string(),
        ));
        self
    }

    pub fn kill_session(&self, session_id: &str) {
        self.sessions.lock().expect("lock sessions").remove(session_id);
    }

    pub fn respawn_pid(&self, pane_id: &str, pid: u32) {
        if let Some(pane) = self.panes.lock().expect("lock panes").get_mut(pane_id) {
            pane.pid = pid;
        }
    }

    /// Makes `respawn-pane -t <target>` fail.
    pub fn fail_respawn(self, target: &str) -> Self {
        self.failing_targets
            .lock()
            .expect("lock failing targets")
            .insert(target.to_string());
        self
    }

    pub fn option(&self, session_id: &str, name: &str) -> Option<String> {
        self.options
            .lock()
            .expect("lock options")
            .get(&(session_id.to_string(), name.to_string()))
            .cloned()
    }
}

impl TmuxClient for FakeTmux {
    fn in_tmux(&self) -> bool {
        self.current.is_some()
    }

    fn session_exists(&self, session_id: &str) -> Option<bool> {
        if !self.reachable {
            return None;
        }
        Some(self.sessions.lock().expect("lock sessions").contains_key(session_id))
    }

    fn window_exists(&self, session_id: &str, window_id: &str) -> Option<bool> {
        if !self.reachable {
            return None;
        }
        let sessions = self.sessions.lock().expect("lock sessions");
        Some(
            sessions
                .get(session_id)
                .is_some_and(|windows| windows.iter().any(|w| w == window_id)),
        )
    }

    fn display_message(&self, target: Option<&str>, format: &str) -> Option<String> {
        let (pane_id, session_id, window_id) = match target {
            Some(target) => {
                let panes = self.panes.lock().expect("lock panes");
                let pane = panes.get(target)?;
                (
                    target.to_string(),
                    pane.session_id.clone(),
                    pane.window_id.clone(),
                )
            }
            None => self.current.clone()?,
        };
        match format {
            "#{pane_id}" => Some(pane_id),
            "#{session_id}" => Some(session_id),
            "#{window_id}" => Some(window_id),
            "#{pane_pid}" => self
                .panes
                .lock()
                .expect("lock panes")
                .get(&pane_id)
                .map(|pane| pane.pid.to_string()),
            _ => None,
        }
    }

    fn pane_pid(&self, pane_id: &str) -> Result<u32> {
        self.panes
            .lock()
            .expect("lock panes")
            .get(pane_id)
            .map(|pane| pane.pid)
            .ok_or(WtxError::TmuxUnavailable)
    }

    fn show_session_option(&self, session_id: &str, name: &str) -> Option<String> {
        self.option(session_id, name)
    }

    fn set_session_option(&self, session_id: &str, name: &str, value: &str) -> Result<()> {
        self.options.lock().expect("lock options").insert(
            (session_id.to_string(), name.to_string()),
            value.to_string(),
        );
        Ok(())
    }

    fn respawn_pane(&self, target: &str, cwd: &Path, command: &str) -> Result<()> {
        if self
            .failing_targets
            .lock()
            .expect("lock failing targets")
            .contains(target)
        {
            return Err(WtxError::CommandFailed {
                command: "tmux respawn-pane".to_string(),
                details: format!("can't find pane: {target}"),
            });
        }
        self.respawned.lock().expect("lock respawned").push((
            target.to_string(),
            cwd.to_path_buf(),
            command.to_string(),
        ));
        Ok(())
    }
}

/// Scriptable git. `worktree add` behaves like the real command: `-b` creates
/// the branch first, then refuses a non-empty target path. Everything else
/// answers from canned responses keyed by the leading arguments.
pub struct FakeGit {
    repo_root: PathBuf,
    pub calls: Mutex<Vec<Vec<String>>>,
    responses: Mutex<HashMap<String, Vec<CommandOutput>>>,
    branches: Mutex<HashSet<String>>,
    racers: Mutex<Vec<PathBuf>>,
}

impl FakeGit {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            branches: Mutex::new(HashSet::new()),
            racers: Mutex::new(Vec::new()),
        }
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.branches.lock().expect("lock branches").contains(branch)
    }

    /// Another process fills `path` with files right before the next `worktree add`.
    pub fn occupy_before_add(&self, path: &Path) {
        self.racers.lock().expect("lock racers").push(path.to_path_buf());
    }

    fn run_racers(&self) {
        for path in self.racers.lock().expect("lock racers").drain(..) {
            std::fs::create_dir_all(&path).expect("create racer worktree");
            std::fs::write(path.join(".git"), "gitdir: elsewhere\n").expect("fill racer worktree");
        }
    }

    fn worktree_add(&self, new_branch: Option<&str>, path: &str) -> CommandOutput {
        self.run_racers();
        if let Some(branch) = new_branch {
            if !self.branches.lock().expect("lock branches").insert(branch.to_string()) {
                return CommandOutput::failed(&format!(
                    "fatal: a branch named '{branch}' already exists"
                ));
            }
        }
        let occupied = std::fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_some());
        if occupied {
            return CommandOutput::failed(&format!("fatal: '{path}' already exists"));
        }
        std::fs::create_dir_all(path).expect("create fake worktree");
        CommandOutput::ok("")
    }

    /// Queues a response for the next call whose leading args join to `key`.
    pub fn respond(&self, key: &str, output: CommandOutput) {
        self.responses
            .lock()
            .expect("lock responses")
            .entry(key.to_string())
            .or_default()
            .push(output);
    }

    pub fn calls_starting_with(&self, prefix: &[&str]) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .expect("lock calls")
            .iter()
            .filter(|call| call.iter().zip(prefix).all(|(a, b)| a == b) && call.len() >= prefix.len())
            .cloned()
            .collect()
    }

    fn canned(&self, args: &[&str]) -> Option<CommandOutput> {
        let mut responses = self.responses.lock().expect("lock responses");
        for len in (1..=args.len().min(3)).rev() {
            let key = args[..len].join(" ");
            if let Some(queue) = responses.get_mut(&key) {
                if !queue.is_empty() {
                    return Some(queue.remove(0));
                }
            }
        }
        None
    }
}

impl GitRunner for FakeGit {
    fn available(&self) -> bool {
        true
    }

    fn run(&self, _dir: &Path, args: &[&str]) -> Result<CommandOutput> {
        self.calls
            .lock()
            .expect("lock calls")
            .push(args.iter().map(|a| a.to_string()).collect());

        if let Some(output) = self.canned(args) {
            return Ok(output);
        }

        match args {
            ["rev-parse", "--show-toplevel"] => Ok(CommandOutput::ok(&format!(
                "{}\n",
                self.repo_root.display()
            ))),
            ["worktree", "add", "-b", branch, path, ..] => Ok(self.worktree_add(Some(*branch), path)),
            ["worktree", "add", path, ..] => Ok(self.worktree_add(None, path)),
            ["rev-parse", "--verify", "--quiet", reference] => {
                let known = reference
                    .strip_prefix("refs/heads/")
                    .is_some_and(|branch| self.has_branch(branch));
                Ok(if known {
                    CommandOutput::ok("abc123\n")
                } else {
                    CommandOutput::failed("")
                })
            }
            ["worktree", "remove", rest @ ..] => {
                if let Some(path) = rest.last() {
                    let _ = std::fs::remove_dir_all(path);
                }
                Ok(CommandOutput::ok(""))
            }
            ["remote", "get-url", "origin"] => Ok(CommandOutput::failed("error: No such remote 'origin'")),
            ["symbolic-ref", ..] => Ok(CommandOutput::failed("fatal: ref is not a symbolic ref")),
            ["rev-parse", "--verify", "main"] => Ok(CommandOutput::ok("abc123\n")),
            _ => Ok(CommandOutput::ok("")),
        }
    }
}
