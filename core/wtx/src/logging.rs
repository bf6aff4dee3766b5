//! Log setup: a daily file under the config dir, stderr if that is unavailable.
//!
//! `WTX_DEBUG_LOG=1` forces debug level; otherwise `RUST_LOG` applies, then `info`.

use std::env;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "WTX_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "wtx.log";

/// Keep the returned guard alive for the life of the process; dropping it
/// flushes buffered lines.
pub fn init() -> Option<WorkerGuard> {
    let debug = debug_requested(env::var(DEBUG_ENV).ok().as_deref());

    match log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter(debug, "info"))
                .with_timer(UtcTime::rfc_3339())
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .is_ok();
            installed.then_some(guard)
        }
        None => {
            // Terminal output stays quiet unless asked for.
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter(debug, "warn"))
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}

fn debug_requested(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}

fn filter(debug: bool, fallback: &str) -> EnvFilter {
    if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    }
}

fn log_dir() -> Option<PathBuf> {
    let dir = wtx_core::config::config_dir().ok()?.join("logs");
    fs_err::create_dir_all(&dir).ok()?;
    Some(dir)
}
