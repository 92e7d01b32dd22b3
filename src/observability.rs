// SPDX-License-Identifier: Apache-2.0

//! Tracing setup: daily-rolling JSON logs, bounded retention, panic hook.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "queryloom.log";
const LOG_RETENTION_DAYS: u64 = 14;

/// Installs the global subscriber, writing daily JSON logs under the
/// platform data directory. Later calls are no-ops: the first subscriber
/// stays installed.
pub fn init_tracing() {
    init_tracing_in(&default_log_directory());
}

/// Same as [`init_tracing`], but into an explicit directory. Embedders that
/// manage their own data paths (and the test suites) use this form.
pub fn init_tracing_in(log_dir: &Path) {
    let _ = fs::create_dir_all(log_dir);

    let retention = Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);
    if let Err(e) = prune_old_logs(log_dir, retention) {
        eprintln!("failed to prune old log files: {e}");
    }

    let appender: RollingFileAppender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("queryloom=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(appender)
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();

    install_panic_hook();

    tracing::info!(directory = %log_dir.display(), "tracing initialized");
}

/// Routes panics through tracing before the default hook prints to stderr,
/// so a crash shows up in the same log stream as the request that caused it.
fn install_panic_hook() {
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown cause".to_string());
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        tracing::error!(target: "queryloom::panic", %location, %message, "panicked");
        previous_hook(panic_info);
    }));
}

fn default_log_directory() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA")
            .unwrap_or_else(|| std::env::var_os("USERPROFILE").unwrap_or_default());
        [appdata.as_os_str(), "QueryLoom".as_ref(), "logs".as_ref()]
            .iter()
            .collect()
    } else {
        let home = std::env::var_os("HOME").unwrap_or_default();
        [home.as_os_str(), ".queryloom".as_ref(), "logs".as_ref()]
            .iter()
            .collect()
    }
}

/// Removes this crate's rolled log files older than `max_age`. Files that
/// do not carry the log prefix are never touched.
fn prune_old_logs(log_dir: &Path, max_age: Duration) -> std::io::Result<()> {
    let now = SystemTime::now();
    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let ours = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !ours {
            continue;
        }

        let stale = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if stale {
            if let Err(e) = fs::remove_file(&path) {
                eprintln!("failed to remove stale log file {}: {e}", path.display());
            }
        }
    }
    Ok(())
}
