// pgvault/src/backup/probe.rs
//! Waits for a (possibly sleeping or still booting) database to accept connections.
//!
//! Serverless Postgres offerings suspend idle instances and take a few seconds to resume, so
//! the first connection attempts of a nightly backup routinely fail. The prober retries with
//! deterministic exponential backoff until the database answers or the deadline passes.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{BackupError, Result};
use crate::utils::redact_url;
use crate::utils::setting::check_db_connection;

pub const INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(30);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// One liveness check against the database.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn check(&self, locator: &str) -> anyhow::Result<()>;
}

/// Probes Postgres with `SELECT 1` over a fresh connection per attempt.
pub struct PgLivenessProbe {
    attempt_timeout: Duration,
}

impl PgLivenessProbe {
    pub fn new() -> Self {
        Self { attempt_timeout: ATTEMPT_TIMEOUT }
    }
}

impl Default for PgLivenessProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessProbe for PgLivenessProbe {
    async fn check(&self, locator: &str) -> anyhow::Result<()> {
        check_db_connection(locator, self.attempt_timeout).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: INITIAL_DELAY,
            max_delay: MAX_DELAY,
        }
    }
}

/// Delay before retry `attempt` (0-indexed): `min(2^attempt * base, cap)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}

/// Retry state carried across probe attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    delay: Duration,
    policy: BackoffPolicy,
    started: Instant,
    deadline: Instant,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy, timeout: Duration, started: Instant) -> Self {
        Self {
            attempt: 0,
            delay: policy.initial_delay.min(policy.max_delay),
            policy,
            started,
            deadline: started + timeout,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// How long the attempt starting at `now` may run: the time left before the deadline,
    /// floored at the initial delay and never above the maximum delay.
    pub fn attempt_budget(&self, now: Instant) -> Duration {
        let floor = self.policy.initial_delay.min(self.policy.max_delay);
        self.deadline
            .saturating_duration_since(now)
            .max(floor)
            .min(self.policy.max_delay)
    }

    /// Records a failed attempt observed at `now` and returns how long to sleep before the
    /// next one, or `None` once the deadline has been reached.
    pub fn on_failure(&mut self, now: Instant) -> Option<Duration> {
        self.attempt += 1;
        let remaining = self.deadline.saturating_duration_since(now);
        if remaining.is_zero() {
            return None;
        }
        let sleep = self.delay.min(remaining).min(self.policy.max_delay);
        self.delay = backoff_delay(self.attempt, self.policy.initial_delay, self.policy.max_delay);
        Some(sleep)
    }
}

/// Blocks until `probe` succeeds against `locator`, the timeout elapses, or `cancel` fires.
///
/// Returns the number of attempts it took.
pub async fn wait_until_reachable(
    probe: &dyn LivenessProbe,
    locator: &str,
    timeout: Duration,
    policy: BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<u32> {
    let mut backoff = Backoff::new(policy, timeout, Instant::now());
    info!(
        database = %redact_url(locator),
        timeout_secs = timeout.as_secs(),
        "Waiting for database to become reachable"
    );

    loop {
        let budget = backoff.attempt_budget(Instant::now());
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(BackupError::Cancelled(format!(
                    "reachability wait interrupted after {} attempt(s)",
                    backoff.attempts()
                )));
            }
            outcome = tokio::time::timeout(budget, probe.check(locator)) => outcome,
        };

        let last_error = match outcome {
            Ok(Ok(())) => {
                let attempts = backoff.attempts() + 1;
                info!(
                    attempts,
                    elapsed_ms = backoff.elapsed(Instant::now()).as_millis() as u64,
                    "Database is reachable"
                );
                return Ok(attempts);
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("attempt timed out after {}ms", budget.as_millis()),
        };

        let now = Instant::now();
        let Some(sleep) = backoff.on_failure(now) else {
            return Err(BackupError::ReachabilityTimeout {
                attempts: backoff.attempts(),
                elapsed: backoff.elapsed(now),
                last_error,
            });
        };

        warn!(
            attempt = backoff.attempts(),
            retry_in_ms = sleep.as_millis() as u64,
            error = %last_error,
            "Database not reachable yet"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(BackupError::Cancelled(format!(
                    "reachability wait interrupted after {} attempt(s)",
                    backoff.attempts()
                )));
            }
            _ = tokio::time::sleep(sleep) => {
                debug!(attempt = backoff.attempts(), "Retrying liveness probe");
            }
        }
    }
}
