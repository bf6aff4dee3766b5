//! Owner identity codec.
//!
//! A lock's `owner_id` says who logically holds it:
//!
//! ```text
//! tmux:$3          session $3, any window
//! tmux:$3:@7       session $3, window @7
//! pete@studio      no tmux; user@host fallback
//! ```
//!
//! Decoding never fails loudly. Anything that is not a well-formed tmux reference
//! decodes to `None` and the caller falls back to PID liveness.

use std::env;

use crate::tmux::TmuxClient;

const TMUX_PREFIX: &str = "tmux:";
const UNKNOWN_OWNER: &str = "unknown";

/// Parsed `tmux:<session>[:<window>]` owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxOwner {
    pub session_id: String,
    pub window_id: Option<String>,
}

/// Everything needed to encode an owner id for the current process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerContext {
    pub tmux_session: Option<String>,
    pub tmux_window: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl OwnerContext {
    /// Captures the calling process's identity.
    pub fn detect(tmux: &dyn TmuxClient) -> Self {
        let (tmux_session, tmux_window) = if tmux.in_tmux() {
            (tmux.current_session_id(), tmux.current_window_id())
        } else {
            (None, None)
        };
        Self {
            tmux_session,
            tmux_window,
            user: current_user(),
            host: current_host(),
        }
    }
}

pub fn encode_owner_id(ctx: &OwnerContext) -> String {
    if let Some(session) = non_empty(ctx.tmux_session.as_deref()) {
        return match non_empty(ctx.tmux_window.as_deref()) {
            Some(window) => format!("{TMUX_PREFIX}{session}:{window}"),
            None => format!("{TMUX_PREFIX}{session}"),
        };
    }

    match (non_empty(ctx.user.as_deref()), non_empty(ctx.host.as_deref())) {
        (Some(user), Some(host)) => format!("{user}@{host}"),
        (Some(user), None) => user.to_string(),
        (None, Some(host)) => host.to_string(),
        (None, None) => UNKNOWN_OWNER.to_string(),
    }
}

pub fn parse_tmux_owner_id(owner_id: &str) -> Option<TmuxOwner> {
    let rest = owner_id.trim().strip_prefix(TMUX_PREFIX)?;
    let (session, window) = match rest.split_once(':') {
        Some((session, window)) => (session.trim(), non_empty(Some(window))),
        None => (rest.trim(), None),
    };
    if session.is_empty() {
        return None;
    }
    Some(TmuxOwner {
        session_id: session.to_string(),
        window_id: window.map(str::to_string),
    })
}

/// Replaces the window component of a tmux owner, keeping its session.
///
/// Non-tmux owners are returned unchanged.
pub fn rebind_owner_window(owner_id: &str, window: Option<&str>) -> String {
    match parse_tmux_owner_id(owner_id) {
        Some(owner) => encode_owner_id(&OwnerContext {
            tmux_session: Some(owner.session_id),
            tmux_window: window.map(str::to_string).or(owner.window_id),
            ..OwnerContext::default()
        }),
        None => owner_id.to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn current_user() -> Option<String> {
    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .or_else(|| {
            dirs::home_dir()
                .and_then(|home| home.file_name().map(|name| name.to_string_lossy().to_string()))
        })
}

fn current_host() -> Option<String> {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            let host = String::from_utf8_lossy(&buf[..end]).trim().to_string();
            if !host.is_empty() {
                return Some(host);
            }
        }
    }
    env::var("HOSTNAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
