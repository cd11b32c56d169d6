pub(crate) mod db_dump;
pub(crate) mod logic;
pub(crate) mod probe;
pub(crate) mod retention;
pub(crate) mod s3_store;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::BackupConfig;
use db_dump::PgDumpProducer;
use logic::{BackupReport, BackupRun, Collaborators};
use probe::{BackoffPolicy, PgLivenessProbe};
use s3_store::S3ObjectStore;

/// Public entry point for the backup process: wires the real collaborators and runs one cycle.
pub async fn run_backup_flow(
    config: &BackupConfig,
    cancel: &CancellationToken,
) -> Result<BackupReport> {
    let run = BackupRun::from_config(config);

    // Fail fast on a missing pg_dump before waking the database up.
    let dumper = PgDumpProducer::locate(config.pg_dump_path.as_deref())?;
    let probe = PgLivenessProbe::new();
    let store = S3ObjectStore::connect(&config.storage).await;

    let collaborators = Collaborators {
        probe: &probe,
        dumper: &dumper,
        store: &store,
    };

    let report = logic::perform_backup_orchestration(
        &run,
        &collaborators,
        BackoffPolicy::default(),
        cancel,
    )
    .await
    .context("Backup process failed")?;

    logic::log_report(&report);
    Ok(report)
}
