// pgvault/src/backup/logic.rs
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::db_dump::DumpSource;
use super::probe::{BackoffPolicy, LivenessProbe, wait_until_reachable};
use super::retention::{CleanupReport, apply_retention};
use super::s3_store::{CONTENT_TYPE, ObjectStore, backup_key};
use crate::config::BackupConfig;
use crate::errors::{BackupError, Result};
use crate::utils::redact_url;

/// Everything one backup cycle needs to know. Built once, never persisted.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub database_url: String,
    pub bucket: String,
    pub key_prefix: String,
    pub retention_count: usize,
    pub ready_timeout: Duration,
    pub list_limit: usize,
}

impl BackupRun {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            database_url: config.database_url.clone(),
            bucket: config.storage.bucket_name.clone(),
            key_prefix: config.storage.key_prefix.clone(),
            retention_count: config.retention_count,
            ready_timeout: config.ready_timeout,
            list_limit: config.list_limit,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(BackupError::Config("database URL is empty".into()));
        }
        if self.bucket.trim().is_empty() {
            return Err(BackupError::Config("bucket name is empty".into()));
        }
        if !self.key_prefix.ends_with('/') {
            return Err(BackupError::Config(format!(
                "key prefix '{}' must end with '/'",
                self.key_prefix
            )));
        }
        if self.retention_count == 0 {
            return Err(BackupError::Config("retention count must be at least 1".into()));
        }
        if self.ready_timeout.is_zero() {
            return Err(BackupError::Config("reachability timeout must be positive".into()));
        }
        if self.list_limit == 0 {
            return Err(BackupError::Config("listing limit must be at least 1".into()));
        }
        Ok(())
    }
}

/// Result of the best-effort retention step. Never turns into a run failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Completed(CleanupReport),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub key: String,
    pub size_bytes: usize,
    pub probe_attempts: u32,
    pub cleanup: CleanupOutcome,
}

/// The external capabilities a run is wired against.
pub struct Collaborators<'a> {
    pub probe: &'a dyn LivenessProbe,
    pub dumper: &'a dyn DumpSource,
    pub store: &'a dyn ObjectStore,
}

async fn until_cancelled<T, F>(cancel: &CancellationToken, stage: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled(format!("interrupted during {}", stage))),
        result = fut => result,
    }
}

/// Runs one backup cycle: probe, dump, upload, then prune.
///
/// Every stage before the upload is fatal. Retention runs only once the new backup is stored
/// and any failure there is reported through [`CleanupOutcome::Failed`] instead.
pub async fn perform_backup_orchestration(
    run: &BackupRun,
    collaborators: &Collaborators<'_>,
    policy: BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<BackupReport> {
    run.validate()?;
    info!(
        database = %redact_url(&run.database_url),
        bucket = %run.bucket,
        prefix = %run.key_prefix,
        retention = run.retention_count,
        "🚀 Starting backup"
    );

    let probe_attempts = wait_until_reachable(
        collaborators.probe,
        &run.database_url,
        run.ready_timeout,
        policy,
        cancel,
    )
    .await?;

    let dump = until_cancelled(
        cancel,
        "dump",
        collaborators.dumper.produce_dump(&run.database_url),
    )
    .await?;
    let size_bytes = dump.len();

    let key = backup_key(&run.key_prefix, Utc::now());
    until_cancelled(
        cancel,
        "upload",
        collaborators.store.put(&key, dump, CONTENT_TYPE),
    )
    .await?;
    info!(key = %key, bytes = size_bytes, "✅ Backup stored");

    let cleanup = match until_cancelled(
        cancel,
        "retention cleanup",
        apply_retention(
            collaborators.store,
            &run.key_prefix,
            run.retention_count,
            run.list_limit,
        ),
    )
    .await
    {
        Ok(report) => CleanupOutcome::Completed(report),
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(error = %e, "Retention cleanup failed; the backup itself succeeded");
            CleanupOutcome::Failed(e.to_string())
        }
    };

    Ok(BackupReport {
        key,
        size_bytes,
        probe_attempts,
        cleanup,
    })
}

/// Logs the final summary of a finished run.
pub fn log_report(report: &BackupReport) {
    match &report.cleanup {
        CleanupOutcome::Completed(cleanup) if cleanup.failed.is_empty() => info!(
            key = %report.key,
            bytes = report.size_bytes,
            probe_attempts = report.probe_attempts,
            kept = cleanup.kept,
            deleted = cleanup.deleted_count(),
            "🎉 Backup completed"
        ),
        CleanupOutcome::Completed(cleanup) => warn!(
            key = %report.key,
            bytes = report.size_bytes,
            kept = cleanup.kept,
            deleted = cleanup.deleted_count(),
            delete_failures = cleanup.failed.len(),
            "Backup completed, some old backups could not be deleted"
        ),
        CleanupOutcome::Failed(reason) => error!(
            key = %report.key,
            bytes = report.size_bytes,
            cleanup_error = %reason,
            "Backup completed, retention cleanup skipped"
        ),
    }
}
