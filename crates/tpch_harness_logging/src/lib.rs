//! Logging setup shared by the harness binary and its tests.
//!
//! Events go to stderr and, when the harness home is writable, to a daily
//! log file under `$TPCH_HARNESS_HOME/logs`. Without a usable log directory
//! the console layer is still installed so warnings are never dropped.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable that relocates the harness home directory.
pub const HOME_ENV: &str = "TPCH_HARNESS_HOME";

const DEFAULT_LOG_FILTER: &str = "tpch_harness=info";
const VERBOSE_LOG_FILTER: &str = "tpch_harness=debug";
const MAX_LOG_FILES: usize = 7;

/// What to initialize.
pub struct LogConfig<'a> {
    /// Prefix of the log file (`<app_name>.<date>.log`).
    pub app_name: &'a str,
    /// Raise the console filter to debug.
    pub verbose: bool,
}

/// Keeps the background file writer alive. Dropping it flushes the file.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Install the global tracing subscriber: daily file plus stderr.
///
/// A log directory that cannot be created only disables the file layer.
/// `RUST_LOG` wins over both defaults when set.
pub fn init_logging(config: LogConfig<'_>) -> Result<LogGuard> {
    let (file, worker) =
        match ensure_logs_dir().and_then(|dir| file_writer(&dir, config.app_name)) {
            Ok((writer, guard)) => (Some(writer), Some(guard)),
            Err(err) => {
                eprintln!("Warning: file logging disabled: {:#}", err);
                (None, None)
            }
        };

    subscriber(file, config.verbose)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(LogGuard { _worker: worker })
}

fn subscriber(file: Option<NonBlocking>, verbose: bool) -> impl Subscriber + Send + Sync {
    let file_layer = file.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(default_filter())
    });
    let console_filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        default_filter()
    };

    tracing_subscriber::registry().with(file_layer).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(console_filter),
    )
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn file_writer(log_dir: &Path, app_name: &str) -> Result<(NonBlocking, WorkerGuard)> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(app_name)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
        .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Harness home: `$TPCH_HARNESS_HOME`, else `~/.tpch_harness`.
pub fn harness_home() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".tpch_harness"))
        .ok_or_else(|| anyhow!("Could not determine home directory; set {}", HOME_ENV))
}

/// `<home>/logs`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(harness_home()?.join("logs"))
}

/// Create the logs directory if needed and return it.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir()?;
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}
