//! Configuration loading.
//!
//! Lives at `~/.wtx/config.json` (directory overridable with `WTX_CONFIG_DIR`).
//! Missing file or missing fields mean defaults; a file that does not parse is an
//! error rather than silently ignored.

use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WtxError};
use crate::lock::store::LockStore;
use crate::lock::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_STALE_AFTER};
use crate::worktree::DEFAULT_BASE_REF_TTL;

pub const CONFIG_DIR_ENV: &str = "WTX_CONFIG_DIR";
pub const LOCK_DIR_ENV: &str = "WTX_LOCK_DIR";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WtxConfig {
    /// Overrides `~/.wtx/locks`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,
    pub heartbeat_interval_ms: u64,
    pub stale_after_ms: u64,
    pub base_ref_ttl_secs: u64,
    /// Command respawned into a pane on hand-back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_command: Option<String>,
}

impl Default for WtxConfig {
    fn default() -> Self {
        Self {
            lock_dir: None,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            stale_after_ms: DEFAULT_STALE_AFTER.as_millis() as u64,
            base_ref_ttl_secs: DEFAULT_BASE_REF_TTL.as_secs(),
            agent_command: None,
        }
    }
}

impl WtxConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn base_ref_ttl(&self) -> Duration {
        Duration::from_secs(self.base_ref_ttl_secs)
    }

    /// `WTX_LOCK_DIR`, then the config file, then `~/.wtx/locks`.
    pub fn resolved_lock_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = env_path(LOCK_DIR_ENV) {
            return Ok(dir);
        }
        match &self.lock_dir {
            Some(dir) => Ok(dir.clone()),
            None => LockStore::default_dir(),
        }
    }
}

/// `~/.wtx`, or `WTX_CONFIG_DIR` when set.
pub fn config_dir() -> Result<PathBuf> {
    if let Some(dir) = env_path(CONFIG_DIR_ENV) {
        return Ok(dir);
    }
    let home = dirs::home_dir().ok_or(WtxError::HomeDirNotFound)?;
    Ok(home.join(".wtx"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

pub fn load_config() -> Result<WtxConfig> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<WtxConfig> {
    let contents = match fs_err::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(WtxConfig::default()),
        Err(err) => return Err(WtxError::io("reading config", err)),
    };
    if contents.trim().is_empty() {
        return Ok(WtxConfig::default());
    }
    serde_json::from_str(&contents).map_err(|err| WtxError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
