// Single-shot database liveness check
use anyhow::{Context, Result};
use sqlx::{Connection, PgConnection};
use std::time::Duration;
use tokio::time::timeout;

use super::redact_url;

/// Opens a fresh connection, runs `SELECT 1` and closes the connection again, all within
/// `attempt_timeout`.
///
/// The connection never outlives this call: it is closed after the query whatever the
/// query's outcome, and dropped (socket shut) on any early return or timeout.
pub async fn check_db_connection(db_url: &str, attempt_timeout: Duration) -> Result<()> {
    timeout(attempt_timeout, select_one(db_url))
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Liveness check against {} timed out after {}ms",
                redact_url(db_url),
                attempt_timeout.as_millis()
            )
        })?
}

async fn select_one(db_url: &str) -> Result<()> {
    let mut conn = PgConnection::connect(db_url)
        .await
        .with_context(|| format!("Failed to connect to {}", redact_url(db_url)))?;

    let probe = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&mut conn)
        .await;

    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Closing probe connection failed");
    }

    let value = probe.context("Liveness query SELECT 1 failed")?;
    anyhow::ensure!(value == 1, "Liveness query returned unexpected value {}", value);
    Ok(())
}
