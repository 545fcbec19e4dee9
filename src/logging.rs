//! Tracing setup for the `kira-jobs` binary.
//!
//! Console output goes to stderr so stdout stays clean JSON. When a log
//! directory is configured, every launch also writes a timestamped file there
//! through a non-blocking writer; only the newest files are kept.

use std::fs;
use std::sync::OnceLock;
use std::time::SystemTime;

use camino::Utf8Path;
use chrono::Utc;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::error::KiraError;
use crate::store;

const MAX_LOG_FILES: usize = 10;
const LOG_FILE_PREFIX: &str = "kira-jobs";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// `RUST_LOG` wins over the default level.
pub fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(verbose: bool, log_dir: Option<&Utf8Path>) -> Result<(), KiraError> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let Some(log_dir) = log_dir else {
        return Registry::default()
            .with(env_filter(verbose))
            .with(stderr_layer)
            .try_init()
            .map_err(|err| KiraError::Logging(err.to_string()));
    };

    store::ensure_dir(log_dir)?;
    let file_name = log_file_name();
    let (file_writer, guard) =
        tracing_appender::non_blocking(rolling::never(log_dir.as_std_path(), &file_name));
    prune_old_logs(log_dir, MAX_LOG_FILES)?;

    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer);
    Registry::default()
        .with(env_filter(verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| KiraError::Logging(err.to_string()))?;
    let _ = LOG_GUARD.set(guard);

    tracing::debug!(log_file = %log_dir.join(&file_name), "logging initialized");
    Ok(())
}

fn log_file_name() -> String {
    format!(
        "{LOG_FILE_PREFIX}-{}.log",
        Utc::now().format("%Y%m%d-%H%M%S")
    )
}

fn prune_old_logs(dir: &Utf8Path, max_files: usize) -> Result<(), KiraError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| KiraError::fs(format!("read {dir}: {err}")))?;
    let mut logs = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(".log"))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.path())
        })
        .collect::<Vec<_>>();

    logs.sort_by_key(|(modified, _)| *modified);
    let excess = logs.len().saturating_sub(max_files);
    for (_, path) in logs.into_iter().take(excess) {
        fs::remove_file(&path)
            .map_err(|err| KiraError::fs(format!("remove {}: {err}", path.display())))?;
    }
    Ok(())
}
