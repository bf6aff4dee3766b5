//! Wiring shared by every subcommand: config, real git/tmux, the lock manager.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use wtx_core::lock::store::resolve_real_path;
use wtx_core::{
    load_config, CommandGit, CommandTmux, LockManager, LockStore, PaneBinder, WorktreePool,
    WtxConfig, WtxError,
};

/// Exit status when the worktree is held by someone else.
const EXIT_LOCKED: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] WtxError),

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Usage(String),
}

impl CliError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Core(err) if err.is_locked() => ExitCode::from(EXIT_LOCKED),
            _ => ExitCode::FAILURE,
        }
    }
}

pub struct App {
    pub config: WtxConfig,
    pub tmux: Arc<CommandTmux>,
    pub git: Arc<CommandGit>,
    pub locks: LockManager,
    pub cwd: PathBuf,
}

impl App {
    pub fn load() -> Result<Self, CliError> {
        let config = load_config()?;
        let tmux = Arc::new(CommandTmux::new());
        let store = LockStore::new(config.resolved_lock_dir()?);
        let locks = LockManager::system(store, tmux.clone(), config.stale_after());
        let cwd = std::env::current_dir()
            .map_err(|err| WtxError::io("reading current directory", err))?;
        tracing::debug!(
            lock_dir = %locks.store().lock_dir().display(),
            owner_id = %locks.owner_id(),
            "Loaded wtx context"
        );
        Ok(Self {
            config,
            tmux,
            git: Arc::new(CommandGit::new()),
            locks,
            cwd,
        })
    }

    pub fn pool(&self) -> WorktreePool {
        WorktreePool::new(&self.cwd, self.git.clone(), self.locks.clone())
            .with_base_ref_ttl(self.config.base_ref_ttl())
    }

    pub fn binder(&self) -> PaneBinder {
        PaneBinder::new(self.tmux.clone(), self.git.clone(), self.locks.clone())
    }

    /// Absolute, symlink-resolved form of a user-supplied path.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, CliError> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        };
        Ok(resolve_real_path(&joined)?)
    }
}
