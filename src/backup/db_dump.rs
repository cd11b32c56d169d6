// pgvault/src/backup/db_dump.rs
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::{BackupError, Result};
use crate::utils::find_pg_dump_executable;

/// Produces a compressed logical dump of a database.
#[async_trait]
pub trait DumpSource: Send + Sync {
    async fn produce_dump(&self, locator: &str) -> Result<Vec<u8>>;
}

/// Runs `pg_dump` and gzips its plain-SQL output in memory.
pub struct PgDumpProducer {
    program: PathBuf,
}

impl PgDumpProducer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// Resolves the executable from `PG_DUMP_PATH` or `PATH`.
    pub fn locate(configured: Option<&Path>) -> anyhow::Result<Self> {
        let program = find_pg_dump_executable(configured)?;
        info!(pg_dump = %program.display(), "Using pg_dump executable");
        Ok(Self::new(program))
    }
}

/// Builds the dump invocation. The locator is a single argv element; no shell ever sees it.
fn dump_command(program: &Path, locator: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("--no-owner")
        .arg("--no-privileges")
        .arg("--dbname")
        .arg(locator)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

#[async_trait]
impl DumpSource for PgDumpProducer {
    async fn produce_dump(&self, locator: &str) -> Result<Vec<u8>> {
        let output = dump_command(&self.program, locator)
            .output()
            .await
            .map_err(|e| {
                BackupError::Dump(format!("failed to spawn {}: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            return Err(BackupError::Dump(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "pg_dump wrote to stderr");
        }

        if output.stdout.is_empty() {
            return Err(BackupError::EmptyDump);
        }

        let raw_len = output.stdout.len();
        let compressed = tokio::task::spawn_blocking(move || gzip(&output.stdout))
            .await
            .map_err(|e| BackupError::Dump(format!("compression task failed: {}", e)))?
            .map_err(|e| BackupError::Dump(format!("gzip compression failed: {}", e)))?;

        info!(
            raw_bytes = raw_len,
            compressed_bytes = compressed.len(),
            "Database dump captured"
        );
        Ok(compressed)
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
