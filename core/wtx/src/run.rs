//! `wtx run`: execute a command inside a worktree for as long as it lives.
//!
//! The lock is taken for our own PID before spawning so nobody can grab the
//! worktree in between, then rebound to the child once it exists.

use std::path::Path;
use std::process::{Child, Command, ExitCode, ExitStatus};

use tracing::{debug, warn};
use wtx_core::WORKTREE_PATH_ENV;

use crate::app::{App, CliError};

pub fn run(app: &App, path: &Path, command: &[String]) -> Result<ExitCode, CliError> {
    let Some((program, args)) = command.split_first() else {
        return Err(CliError::Usage("no command given".to_string()));
    };
    let worktree = app.resolve(path)?;
    let lock = app.pool().acquire_worktree_lock(&worktree)?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(&worktree)
        .env(WORKTREE_PATH_ENV, &worktree)
        .spawn()
        .map_err(|source| CliError::Spawn {
            command: program.clone(),
            source,
        })?;

    let mut lock = match app.binder().bind_pid(&worktree, child.id(), Some(lock)) {
        Ok(lock) => lock,
        Err(err) => {
            abandon(&mut child);
            return Err(err.into());
        }
    };
    if let Err(err) = lock.start_toucher(app.config.heartbeat_interval()) {
        warn!(error = %err, "Lock heartbeat not started");
    }
    debug!(worktree = %worktree.display(), pid = child.id(), "Running command in worktree");

    let status = child.wait();
    if let Err(err) = lock.release() {
        warn!(error = %err, "Failed to release worktree lock");
    }
    let status = status.map_err(|source| CliError::Spawn {
        command: program.clone(),
        source,
    })?;
    Ok(ExitCode::from(exit_status_code(status)))
}

fn abandon(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Child's exit status as ours; signals map to 128 + signo like a shell.
fn exit_status_code(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return u8::try_from(code & 0xff).unwrap_or(1);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return u8::try_from(128 + (signal & 0x7f)).unwrap_or(1);
        }
    }
    1
}
