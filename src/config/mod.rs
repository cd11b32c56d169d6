// pgvault/src/config/mod.rs
use anyhow::{Context, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::utils::redact_url;

pub const DEFAULT_REGION: &str = "auto";
pub const DEFAULT_RETENTION: usize = 30;
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LIST_LIMIT: usize = 10_000;
const FALLBACK_PREFIX: &str = "backups/";

// S3-compatible storage settings (AWS, R2, Spaces, MinIO...)
#[derive(Clone)]
pub struct StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub key_prefix: String,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("bucket_name", &self.bucket_name)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

#[derive(Clone)]
pub struct BackupConfig {
    pub database_url: String,
    pub storage: StorageConfig,
    pub retention_count: usize,
    pub ready_timeout: Duration,
    pub list_limit: usize,
    pub pg_dump_path: Option<PathBuf>,
}

impl fmt::Debug for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupConfig")
            .field("database_url", &redact_url(&self.database_url))
            .field("storage", &self.storage)
            .field("retention_count", &self.retention_count)
            .field("ready_timeout", &self.ready_timeout)
            .field("list_limit", &self.list_limit)
            .field("pg_dump_path", &self.pg_dump_path)
            .finish()
    }
}

impl BackupConfig {
    /// Loads `.env` (if present) and reads the configuration from the process environment.
    pub fn load_from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset, so `BACKUP_PREFIX=` falls back to the derived prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| {
            get(key).with_context(|| format!("{} must be set for backup", key))
        };

        let database_url = require("DATABASE_URL")?;
        let parsed = Url::parse(&database_url)
            .with_context(|| format!("Invalid DATABASE_URL: {}", redact_url(&database_url)))?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            anyhow::bail!(
                "DATABASE_URL must use the postgres:// or postgresql:// scheme, got '{}'",
                parsed.scheme()
            );
        }

        let key_prefix = match get("BACKUP_PREFIX") {
            Some(prefix) => normalize_prefix(&prefix),
            None => derive_prefix(&parsed),
        };

        let storage = StorageConfig {
            endpoint_url: require("S3_ENDPOINT")?,
            region: get("S3_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            access_key_id: require("S3_ACCESS_KEY_ID")?,
            secret_access_key: require("S3_SECRET_ACCESS_KEY")?,
            bucket_name: require("S3_BUCKET")?,
            key_prefix,
        };

        let retention_count = parse_or(&get, "BACKUP_RETENTION", DEFAULT_RETENTION)?;
        if retention_count == 0 {
            anyhow::bail!("BACKUP_RETENTION must be at least 1; 0 would delete the backup just taken");
        }

        let timeout_secs = parse_or(&get, "DB_READY_TIMEOUT_SECS", DEFAULT_READY_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            anyhow::bail!("DB_READY_TIMEOUT_SECS must be at least 1");
        }

        let list_limit = parse_or(&get, "BACKUP_LIST_LIMIT", DEFAULT_LIST_LIMIT)?;
        if list_limit == 0 {
            anyhow::bail!("BACKUP_LIST_LIMIT must be at least 1");
        }

        Ok(BackupConfig {
            database_url,
            storage,
            retention_count,
            ready_timeout: Duration::from_secs(timeout_secs),
            list_limit,
            pg_dump_path: get("PG_DUMP_PATH").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, raw)),
        None => Ok(default),
    }
}

/// Strips leading slashes and guarantees exactly one trailing slash.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        FALLBACK_PREFIX.to_string()
    } else {
        format!("{}/", trimmed)
    }
}

fn derive_prefix(database_url: &Url) -> String {
    let db_name = database_url.path().trim_start_matches('/');
    normalize_prefix(db_name)
}
