//! Log initialization and retention
//!
//! Log lines go to a daily-rolling file in the configured directory
//! (`gomobile.log.YYYY-MM-DD`). A background sweeper deletes files older
//! than the retention window once per day. `flags.debug` raises the level
//! from INFO to DEBUG; `RUST_LOG` overrides both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::error::{GoMobileError, GoMobileResult};

/// File name prefix the rolling appender writes under
const LOG_PREFIX: &str = "gomobile.log";

/// Handle over the logging backend. Dropping it flushes and closes the
/// current log file, so it must live as long as the process.
pub struct LogManager {
    _guard: WorkerGuard,
    dir: PathBuf,
    retention_days: i64,
}

/// Initialize logging: daily file in `dir`, retention sweep state.
///
/// The directory is created when absent. Fatal at startup on failure.
pub fn init(dir: &str, retain_days: i64, debug: bool) -> GoMobileResult<LogManager> {
    let dir = if dir.is_empty() { "logs" } else { dir };
    let retention_days = if retain_days <= 0 { 7 } else { retain_days };

    std::fs::create_dir_all(dir)
        .map_err(|e| GoMobileError::config_error("logging.directory", e.to_string()))?;

    let appender = tracing_appender::rolling::daily(dir, LOG_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    let mgr = LogManager {
        _guard: guard,
        dir: PathBuf::from(dir),
        retention_days,
    };
    mgr.delete_old();
    Ok(mgr)
}

impl LogManager {
    /// Spawn the daily retention sweeper. Runs until the process exits.
    pub fn spawn_cleaner(&self) -> tokio::task::JoinHandle<()> {
        let dir = self.dir.clone();
        let retention = self.retention_days;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            ticker.tick().await; // first tick fires immediately, already swept at init
            loop {
                ticker.tick().await;
                delete_old_logs(&dir, retention);
            }
        })
    }

    fn delete_old(&self) {
        delete_old_logs(&self.dir, self.retention_days);
    }
}

fn delete_old_logs(dir: &Path, retention_days: i64) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("failed to read log directory '{}': {}", dir.display(), e);
            return;
        }
    };

    let cutoff = Local::now().date_naive() - chrono::Duration::days(retention_days);
    info!(
        "running log cleanup, retention: {} days, cutoff: {}",
        retention_days, cutoff
    );

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(date) = rolled_file_date(&name) else {
            continue;
        };

        if date < cutoff {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => info!("deleted old log file: {}", name),
                Err(e) => warn!("failed to delete old log file {}: {}", name, e),
            }
        } else {
            debug!("keeping log file {}", name);
        }
    }
}

/// Parse the date suffix of a rolled log file (`gomobile.log.2025-11-24`).
/// Returns None for the live file and for unrelated directory entries.
fn rolled_file_date(name: &str) -> Option<NaiveDate> {
    let suffix = name.strip_prefix(LOG_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}
