//! Lock file persistence.
//!
//! # Layout
//!
//! Location: `<lock_dir>/{hash}.lock` where `{hash}` is
//! `md5(md5(real repo root) + ":" + real worktree path)`. Resolving symlinks first
//! makes `/tmp/x` and `/private/tmp/x` converge on one file.
//!
//! ```text
//! {hash}.lock   # { pid, owner_id, worktree_path, repo_root, timestamp, rebound_from? }
//! ```
//!
//! The file's existence is the lock. Its content only helps decide whether the
//! holder is still alive; its mtime is the heartbeat.

use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WtxError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub owner_id: String,
    pub worktree_path: PathBuf,
    pub repo_root: PathBuf,
    #[serde(rename = "timestamp")]
    pub acquired_at: DateTime<Utc>,
    /// PID that held the record before the most recent rebind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebound_from: Option<u32>,
}

impl LockRecord {
    pub fn new(
        owner_id: String,
        pid: u32,
        repo_root: impl Into<PathBuf>,
        worktree_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pid,
            owner_id,
            worktree_path: worktree_path.into(),
            repo_root: repo_root.into(),
            acquired_at: Utc::now(),
            rebound_from: None,
        }
    }
}

/// Outcome of [`LockStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone)]
pub struct LockStore {
    lock_dir: PathBuf,
    #[cfg(test)]
    hooks: Vec<StoreHook>,
}

/// Store operations a test can interpose on to simulate another process.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreOp {
    Create,
    Read,
}

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct StoreHook(std::sync::Arc<dyn Fn(StoreOp, &Path) + Send + Sync>);

#[cfg(test)]
impl std::fmt::Debug for StoreHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreHook")
    }
}

impl LockStore {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            #[cfg(test)]
            hooks: Vec::new(),
        }
    }

    /// Runs `hook` at the start of every create and read. Hooks stack.
    #[cfg(test)]
    pub(crate) fn with_hook(
        mut self,
        hook: impl Fn(StoreOp, &Path) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.push(StoreHook(std::sync::Arc::new(hook)));
        self
    }

    #[cfg(test)]
    fn fire(&self, op: StoreOp, path: &Path) {
        for hook in &self.hooks {
            (hook.0)(op, path);
        }
    }

    /// `~/.wtx/locks`.
    pub fn default_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or(WtxError::HomeDirNotFound)?;
        Ok(home.join(".wtx").join("locks"))
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn lock_path(&self, repo_root: &Path, worktree_path: &Path) -> Result<PathBuf> {
        let repo = resolve_real_path(repo_root)?;
        let worktree = resolve_real_path(worktree_path)?;
        Ok(self
            .lock_dir
            .join(format!("{}.lock", lock_hash(&repo, &worktree))))
    }

    /// Exclusive create. Never touches an existing file.
    pub fn create(&self, path: &Path, record: &LockRecord) -> Result<CreateOutcome> {
        self.ensure_dir()?;
        #[cfg(test)]
        self.fire(StoreOp::Create, path);
        let contents = encode(path, record)?;
        let mut file = match fs_err::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Ok(CreateOutcome::AlreadyExists)
            }
            Err(err) => return Err(WtxError::io("creating lock file", err)),
        };
        if let Err(err) = file.write_all(&contents).and_then(|_| file.sync_all()) {
            // A half-written lock would read as corrupt; drop it so the slot frees up.
            let _ = fs_err::remove_file(path);
            return Err(WtxError::io("writing lock file", err));
        }
        Ok(CreateOutcome::Created)
    }

    /// Replaces the record via temp file + rename in the lock directory.
    pub fn overwrite(&self, path: &Path, record: &LockRecord) -> Result<()> {
        let parent = path.parent().unwrap_or(&self.lock_dir);
        fs_err::create_dir_all(parent)
            .map_err(|err| WtxError::io("creating lock directory", err))?;
        let contents = encode(path, record)?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|err| WtxError::io(format!("creating temp file in {}", parent.display()), err))?;
        temp.write_all(&contents)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| WtxError::io(format!("writing temp lock for {}", path.display()), err))?;
        temp.persist(path).map_err(|err| {
            WtxError::io(format!("replacing lock file {}", path.display()), err.error)
        })?;
        Ok(())
    }

    /// Record plus mtime. `None` when no lock file exists.
    pub fn read(&self, path: &Path) -> Result<Option<(LockRecord, SystemTime)>> {
        #[cfg(test)]
        self.fire(StoreOp::Read, path);
        let contents = match fs_err::read(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(WtxError::io("reading lock file", err)),
        };
        let modified = match fs_err::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(WtxError::io("reading lock mtime", err)),
        };
        let record = serde_json::from_slice(&contents).map_err(|err| WtxError::CorruptLock {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
        Ok(Some((record, modified)))
    }

    /// Missing files are fine.
    pub fn delete(&self, path: &Path) -> Result<()> {
        match fs_err::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WtxError::io("removing lock file", err)),
        }
    }

    /// Bumps the mtime without rewriting content.
    pub fn touch(&self, path: &Path) -> Result<()> {
        let file = fs_err::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| WtxError::io(format!("opening {} for touch", path.display()), err))?;
        file.file()
            .set_modified(SystemTime::now())
            .map_err(|err| WtxError::io(format!("touching {}", path.display()), err))
    }

    fn ensure_dir(&self) -> Result<()> {
        fs_err::create_dir_all(&self.lock_dir)
            .map_err(|err| WtxError::io("creating lock directory", err))
    }
}

fn encode(path: &Path, record: &LockRecord) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(record)
        .map_err(|err| WtxError::json(format!("encoding lock record for {}", path.display()), err))
}

fn lock_hash(repo_root: &Path, worktree_path: &Path) -> String {
    let repo_id = format!("{:x}", md5::compute(repo_root.to_string_lossy().as_bytes()));
    let key = format!("{}:{}", repo_id, worktree_path.to_string_lossy());
    format!("{:x}", md5::compute(key.as_bytes()))
}

/// Absolute, symlink-free spelling of `path`.
///
/// Paths that do not exist yet (a pool slot about to be created) canonicalize
/// their deepest existing ancestor and re-append the rest.
pub fn resolve_real_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|err| WtxError::io("reading current directory", err))?
            .join(path)
    };
    let absolute = lexically_normalize(&absolute);

    let mut existing = absolute.as_path();
    let mut missing: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(mut real) => {
                for component in missing.iter().rev() {
                    real.push(component);
                }
                return Ok(real);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Ok(absolute.clone());
                };
                missing.push(name.to_os_string());
                existing = parent;
            }
            Err(err) => {
                return Err(WtxError::io(
                    format!("resolving {}", existing.display()),
                    err,
                ))
            }
        }
    }
}

fn lexically_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
