//! Error types for the harness.
//!
//! Every user-visible failure names the offending path, flag or value, and
//! [`HarnessError::suggestion`] supplies the next step the operator should take.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Harness operation result type.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Harness errors.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Bad flag, environment value or missing required setting. Raised before
    /// any side effect.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The checkpoint to restore from does not exist.
    #[error("Checkpoint not found: {}", .path.display())]
    CheckpointMissing { path: PathBuf },

    /// The server did not pass its readiness probe in time.
    #[error("Server at {endpoint} was not ready after {waited:?} ({attempts} attempts)")]
    Timeout {
        endpoint: String,
        attempts: u32,
        waited: Duration,
    },

    /// Graceful shutdown did not complete.
    #[error("Server using {} did not stop: {detail}", .data_dir.display())]
    StopFailed { data_dir: PathBuf, detail: String },

    /// Copying the checkpoint into the data directory failed.
    #[error("Failed to restore {} into {}: {source}", .checkpoint.display(), .target.display())]
    RestoreFailed {
        checkpoint: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Copying the data directory into the checkpoint failed or was refused.
    #[error("Failed to save {} as checkpoint {}: {reason}", .source_dir.display(), .checkpoint.display())]
    SaveFailed {
        source_dir: PathBuf,
        checkpoint: PathBuf,
        reason: String,
    },

    /// The workload could not reach the server at all.
    #[error("Cannot connect to {endpoint}: {reason}")]
    WorkloadConnect { endpoint: String, reason: String },

    /// A session hook statement failed before the measured pass.
    #[error("Session hook failed ({sql}): {reason}")]
    WorkloadHook { sql: String, reason: String },

    /// An external tool could not be spawned or exited unsuccessfully.
    #[error("{program} failed: {detail}")]
    Command { program: String, detail: String },

    /// SQL error while preparing the dataset.
    #[error("Database error during {operation}: {source}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// Filesystem error outside checkpoint copies.
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A lifecycle operation was called on a server in the wrong state.
    #[error("Invalid server state: {0}")]
    InvalidState(String),

    /// A blocking filesystem task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Result artifact could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarnessError {
    /// Create an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an IO error tied to a path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a database error for the named operation.
    pub fn database(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source,
        }
    }

    /// Whether repeating the same invocation could succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidConfig(_) | Self::CheckpointMissing { .. } | Self::InvalidState(_)
        )
    }

    /// Actionable next step for the operator.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::InvalidConfig(_) => Some("TRY: tpch-harness <command> --help".to_string()),
            Self::CheckpointMissing { path } => Some(format!(
                "TRY: tpch-harness setup   # creates the checkpoint at {}",
                path.display()
            )),
            Self::Timeout { .. } => Some(
                "TRY: check the server log, or raise --ready-attempts / --ready-interval-ms"
                    .to_string(),
            ),
            Self::StopFailed { data_dir, .. } => Some(format!(
                "TRY: pg_ctl -D {} -m immediate stop",
                data_dir.display()
            )),
            Self::RestoreFailed { target, .. } => Some(format!(
                "TRY: check free space and permissions for {}, then rerun (restore always starts from the checkpoint)",
                target.display()
            )),
            Self::SaveFailed { source_dir, .. } => Some(format!(
                "TRY: make sure no server is running on {} and rerun setup",
                source_dir.display()
            )),
            Self::WorkloadConnect { .. } => {
                Some("TRY: verify --host/--port/--dbname/--user and that the server is running".to_string())
            }
            Self::Command { program, .. } => Some(format!(
                "TRY: run {} by hand to see its full output, or check --pg-bin / --dbgen-dir",
                program
            )),
            Self::WorkloadHook { .. } => {
                Some("TRY: check the --before-sql statements against the database".to_string())
            }
            Self::Database { .. } => {
                Some("TRY: rerun setup from a clean state (partially loaded data is not rolled back)".to_string())
            }
            Self::Io { path, .. } => Some(format!("TRY: ls -la {}", path.display())),
            Self::InvalidState(_) | Self::Serialization(_) | Self::Task(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_are_not_retryable() {
        assert!(!HarnessError::invalid_config("bad port").is_retryable());
        assert!(!HarnessError::CheckpointMissing {
            path: PathBuf::from("/ckpt")
        }
        .is_retryable());
        assert!(HarnessError::Timeout {
            endpoint: "localhost:5432".to_string(),
            attempts: 30,
            waited: Duration::from_secs(30),
        }
        .is_retryable());
    }

    #[test]
    fn test_checkpoint_missing_points_at_setup() {
        let err = HarnessError::CheckpointMissing {
            path: PathBuf::from("/data/ckpt"),
        };
        assert!(err.to_string().contains("/data/ckpt"));
        let hint = err.suggestion().unwrap();
        assert!(hint.contains("tpch-harness setup"));
    }

    #[test]
    fn test_stop_failed_names_data_dir() {
        let err = HarnessError::StopFailed {
            data_dir: PathBuf::from("/pgdata"),
            detail: "timed out".to_string(),
        };
        assert!(err.to_string().contains("/pgdata"));
        assert!(err.suggestion().unwrap().contains("immediate"));
    }
}
