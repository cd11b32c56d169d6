use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Database not reachable after {attempts} attempt(s) in {:.1}s: {last_error}",
        .elapsed.as_secs_f64()
    )]
    ReachabilityTimeout {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Dump produced no output even though the dump command reported success")]
    EmptyDump,

    #[error("Upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },

    #[error("Storage listing failed: {0}")]
    List(String),

    #[error("Delete of {key} failed: {reason}")]
    Delete { key: String, reason: String },

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl BackupError {
    /// Whether this error must fail the run. Storage listing, delete and cleanup errors only
    /// ever surface from the retention step, which runs after the backup is durable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BackupError::List(_) | BackupError::Delete { .. } | BackupError::Cleanup(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
