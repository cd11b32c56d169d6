pub mod setting;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use url::Url;
use which::which;

/// Resolves the pg_dump executable, preferring an explicitly configured path.
pub fn find_pg_dump_executable(configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) => which(path).with_context(|| {
            format!("Configured pg_dump at {} is not an executable", path.display())
        }),
        None => which("pg_dump").context(
            "pg_dump executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
        ),
    }
}

/// Returns the URL with its password replaced by `***`, for logging.
///
/// Unparseable input is collapsed entirely since it may still contain credentials.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}
