//! Liveness oracle: is a lock's owner still around?
//!
//! Two signals are combined, with tmux taking precedence:
//!
//! 1. **tmux session** (owner id `tmux:<session>[:<window>]`): a destroyed session
//!    makes the lock stale even if the recorded PID still resolves. PIDs are reused
//!    by the OS after a crash, sessions ids are not.
//! 2. **Process table**: `kill(pid, 0)`, with zombies treated as dead.
//!
//! Only when neither signal can decide (a non-tmux owner without a PID) does the
//! heartbeat mtime count: a record touched within `stale_after` is live.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};

use super::owner::parse_tmux_owner_id;
use super::store::LockRecord;
use crate::tmux::TmuxClient;

/// Records not touched for this long are stale when nothing else can decide.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

/// Verdict for a persisted lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Stale,
}

impl Liveness {
    pub fn is_active(self) -> bool {
        self == Liveness::Active
    }
}

pub trait ProcessTable: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// The real OS process table.
#[derive(Debug, Clone, Default)]
pub struct SystemProcesses;

impl ProcessTable for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    // kill(0, ..) would address our own process group.
    if pid == 0 {
        return false;
    }
    if !pid_exists(pid) {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(unix)]
fn pid_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs existence and permission checks.
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_exists(pid: u32) -> bool {
    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).is_some()
}

fn is_zombie(pid: u32) -> bool {
    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid)
        .is_some_and(|process| process.status() == ProcessStatus::Zombie)
}

/// True when the last heartbeat is younger than `threshold`.
///
/// An mtime in the future (clock adjustment) counts as fresh.
pub fn heartbeat_is_fresh(last_touched: SystemTime, now: SystemTime, threshold: Duration) -> bool {
    match now.duration_since(last_touched) {
        Ok(age) => age < threshold,
        Err(_) => true,
    }
}

#[derive(Clone)]
pub struct LivenessOracle {
    tmux: Arc<dyn TmuxClient>,
    processes: Arc<dyn ProcessTable>,
    stale_after: Duration,
}

impl LivenessOracle {
    pub fn new(tmux: Arc<dyn TmuxClient>, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            tmux,
            processes,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn tmux(&self) -> &Arc<dyn TmuxClient> {
        &self.tmux
    }

    /// Whether the owner is alive, without the heartbeat fallback.
    ///
    /// Undecidable owners (no tmux verdict, no PID) are inactive.
    pub fn is_owner_active(&self, owner_id: &str, pid: u32) -> bool {
        self.verdict(owner_id, pid).unwrap_or(false)
    }

    /// Whether a persisted record still represents a live holder.
    pub fn assess(&self, record: &LockRecord, last_touched: SystemTime) -> Liveness {
        if self.is_record_active_at(record, last_touched, SystemTime::now()) {
            Liveness::Active
        } else {
            Liveness::Stale
        }
    }

    pub fn is_record_active(&self, record: &LockRecord, last_touched: SystemTime) -> bool {
        self.assess(record, last_touched).is_active()
    }

    pub fn is_record_active_at(
        &self,
        record: &LockRecord,
        last_touched: SystemTime,
        now: SystemTime,
    ) -> bool {
        self.verdict(&record.owner_id, record.pid)
            .unwrap_or_else(|| heartbeat_is_fresh(last_touched, now, self.stale_after))
    }

    /// `Some` when tmux or the process table gives a definite answer.
    fn verdict(&self, owner_id: &str, pid: u32) -> Option<bool> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() && pid == 0 {
            return Some(false);
        }

        if let Some(owner) = parse_tmux_owner_id(owner_id) {
            match self.tmux.session_exists(&owner.session_id) {
                Some(false) => return Some(false),
                Some(true) => {
                    let window_gone = owner.window_id.as_deref().is_some_and(|window| {
                        self.tmux.window_exists(&owner.session_id, window) == Some(false)
                    });
                    if window_gone {
                        return Some(false);
                    }
                    return Some(pid == 0 || self.processes.is_alive(pid));
                }
                None => {}
            }
        }

        (pid > 0).then(|| self.processes.is_alive(pid))
    }
}
