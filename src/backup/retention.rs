// pgvault/src/backup/retention.rs
//! Keeps the newest `max_count` backups under a prefix and deletes the rest.
//!
//! Nothing is persisted between runs: every pass recomputes the decision from a live listing,
//! which makes the step safe to rerun after a crash or a partially failed pass.

use tracing::{info, warn};

use super::s3_store::{BACKUP_SUFFIX, ObjectStore, StoredBackupObject};
use crate::errors::{BackupError, Result};

/// Partition of the current backups into those kept and those to delete.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionDecision {
    pub keep: Vec<StoredBackupObject>,
    pub delete: Vec<StoredBackupObject>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub kept: usize,
    pub deleted: Vec<String>,
    /// Keys whose deletion failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Decides which backups are stale. Objects without the backup suffix are ignored; the rest are
/// ordered by key (oldest first) and everything beyond the newest `max_count` is marked for
/// deletion.
pub fn plan_retention(objects: &[StoredBackupObject], max_count: usize) -> RetentionDecision {
    let mut backups: Vec<StoredBackupObject> = objects
        .iter()
        .filter(|o| o.key.ends_with(BACKUP_SUFFIX))
        .cloned()
        .collect();

    if backups.len() <= max_count {
        return RetentionDecision {
            keep: backups,
            delete: Vec::new(),
        };
    }

    backups.sort_by(|a, b| a.key.cmp(&b.key));
    let keep = backups.split_off(backups.len() - max_count);
    RetentionDecision {
        keep,
        delete: backups,
    }
}

/// Deletes the stale backups in `objects`, oldest first. Individual failures are logged and
/// recorded but never stop the pass.
pub async fn reconcile(
    store: &dyn ObjectStore,
    objects: &[StoredBackupObject],
    max_count: usize,
) -> CleanupReport {
    let decision = plan_retention(objects, max_count);
    let mut report = CleanupReport {
        kept: decision.keep.len(),
        ..Default::default()
    };

    if decision.delete.is_empty() {
        info!(backups = decision.keep.len(), max_count, "Retention satisfied, nothing to delete");
        return report;
    }

    info!(
        backups = decision.keep.len() + decision.delete.len(),
        max_count,
        to_delete = decision.delete.len(),
        "Pruning old backups"
    );

    for object in &decision.delete {
        match store.delete(&object.key).await {
            Ok(()) => {
                info!(
                    key = %object.key,
                    bytes = object.size,
                    last_modified = ?object.last_modified,
                    "🗑 Deleted old backup"
                );
                report.deleted.push(object.key.clone());
            }
            Err(e) => {
                warn!(key = %object.key, error = %e, "Failed to delete old backup");
                report.failed.push((object.key.clone(), e.to_string()));
            }
        }
    }

    if !report.failed.is_empty() {
        warn!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Retention pass finished with failures; they will be retried on the next run"
        );
    }
    report
}

/// Lists the prefix and reconciles it. A truncated listing is refused: deciding retention on a
/// partial view would keep the wrong set of backups.
pub async fn apply_retention(
    store: &dyn ObjectStore,
    prefix: &str,
    max_count: usize,
    list_limit: usize,
) -> Result<CleanupReport> {
    let listing = store.list(prefix, list_limit).await?;
    if listing.truncated {
        return Err(BackupError::Cleanup(format!(
            "listing of '{}' was truncated at {} objects; raise BACKUP_LIST_LIMIT or prune manually",
            prefix, list_limit
        )));
    }
    Ok(reconcile(store, &listing.objects, max_count).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::s3_store::memory::{MemoryObjectStore, object};

    fn keys(objects: &[StoredBackupObject]) -> Vec<&str> {
        objects.iter().map(|o| o.key.as_str()).collect()
    }

    #[test]
    fn test_plan_deletes_oldest_first() {
        let objects = vec![
            object("db/2024-05-01T12-00-00-000Z.sql.gz"),
            object("db/2024-05-01T10-00-00-000Z.sql.gz"),
            object("db/2024-05-01T11-00-00-000Z.sql.gz"),
        ];
        let decision = plan_retention(&objects, 2);

        assert_eq!(keys(&decision.delete), vec!["db/2024-05-01T10-00-00-000Z.sql.gz"]);
        assert_eq!(
            keys(&decision.keep),
            vec![
                "db/2024-05-01T11-00-00-000Z.sql.gz",
                "db/2024-05-01T12-00-00-000Z.sql.gz"
            ]
        );
    }

    #[test]
    fn test_plan_is_noop_at_or_below_limit() {
        let objects = vec![object("db/a.sql.gz"), object("db/b.sql.gz")];
        assert!(plan_retention(&objects, 2).delete.is_empty());
        assert!(plan_retention(&objects, 5).delete.is_empty());
        assert!(plan_retention(&[], 1).delete.is_empty());
    }

    #[test]
    fn test_plan_ignores_foreign_objects() {
        let objects = vec![
            object("db/2024-01-01T00-00-00-000Z.sql.gz"),
            object("db/2024-01-02T00-00-00-000Z.sql.gz"),
            object("db/README.txt"),
            object("db/0000-manual-export.tar"),
        ];
        let decision = plan_retention(&objects, 1);
        assert_eq!(keys(&decision.delete), vec!["db/2024-01-01T00-00-00-000Z.sql.gz"]);
        assert_eq!(keys(&decision.keep), vec!["db/2024-01-02T00-00-00-000Z.sql.gz"]);
    }

    #[test]
    fn test_plan_never_deletes_more_than_excess() {
        for total in 0..12usize {
            for max_count in 1..8usize {
                let objects: Vec<_> = (0..total)
                    .map(|i| object(&format!("db/{:04}.sql.gz", (total - i) * 7 % 13 + i * 100)))
                    .collect();
                let decision = plan_retention(&objects, max_count);
                assert_eq!(decision.delete.len(), total.saturating_sub(max_count));
                assert_eq!(decision.keep.len(), total.min(max_count));

                let newest_deleted = decision.delete.iter().map(|o| &o.key).max();
                let oldest_kept = decision.keep.iter().map(|o| &o.key).min();
                if let (Some(d), Some(k)) = (newest_deleted, oldest_kept) {
                    assert!(d < k, "deleted {d} is not older than kept {k}");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_reconcile_example_three_hourly_backups() {
        let store = MemoryObjectStore::with_keys(&[
            "db/2024-05-01T10-00-00-000Z.sql.gz",
            "db/2024-05-01T11-00-00-000Z.sql.gz",
            "db/2024-05-01T12-00-00-000Z.sql.gz",
        ]);
        let report = apply_retention(&store, "db/", 2, 1000).await.unwrap();

        assert_eq!(report.deleted, vec!["db/2024-05-01T10-00-00-000Z.sql.gz"]);
        assert_eq!(report.kept, 2);
        assert_eq!(
            store.keys(),
            vec![
                "db/2024-05-01T11-00-00-000Z.sql.gz",
                "db/2024-05-01T12-00-00-000Z.sql.gz"
            ]
        );
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = MemoryObjectStore::with_keys(&[
            "db/01.sql.gz",
            "db/02.sql.gz",
            "db/03.sql.gz",
            "db/04.sql.gz",
            "db/05.sql.gz",
        ]);
        let first = apply_retention(&store, "db/", 3, 1000).await.unwrap();
        assert_eq!(first.deleted_count(), 2);

        let second = apply_retention(&store, "db/", 3, 1000).await.unwrap();
        assert_eq!(second.deleted_count(), 0);
        assert!(second.failed.is_empty());
        assert_eq!(store.keys(), vec!["db/03.sql.gz", "db/04.sql.gz", "db/05.sql.gz"]);
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_stop_the_pass() {
        let mut store = MemoryObjectStore::with_keys(&[
            "db/01.sql.gz",
            "db/02.sql.gz",
            "db/03.sql.gz",
            "db/04.sql.gz",
            "db/05.sql.gz",
        ]);
        store.failing_deletes.insert("db/01.sql.gz".to_string());

        let report = apply_retention(&store, "db/", 2, 1000).await.unwrap();

        assert_eq!(
            store.delete_calls(),
            vec!["db/01.sql.gz", "db/02.sql.gz", "db/03.sql.gz"]
        );
        assert_eq!(report.deleted, vec!["db/02.sql.gz", "db/03.sql.gz"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "db/01.sql.gz");
        assert_eq!(
            store.keys(),
            vec!["db/01.sql.gz", "db/04.sql.gz", "db/05.sql.gz"]
        );
    }

    #[tokio::test]
    async fn test_rerun_after_partial_failure_converges() {
        let mut store = MemoryObjectStore::with_keys(&["db/01.sql.gz", "db/02.sql.gz", "db/03.sql.gz"]);
        store.failing_deletes.insert("db/01.sql.gz".to_string());
        apply_retention(&store, "db/", 1, 1000).await.unwrap();
        assert_eq!(store.keys(), vec!["db/01.sql.gz", "db/03.sql.gz"]);

        store.failing_deletes.clear();
        let report = apply_retention(&store, "db/", 1, 1000).await.unwrap();
        assert_eq!(report.deleted, vec!["db/01.sql.gz"]);
        assert_eq!(store.keys(), vec!["db/03.sql.gz"]);
    }

    #[tokio::test]
    async fn test_truncated_listing_refuses_to_delete() {
        let store = MemoryObjectStore::with_keys(&[
            "db/01.sql.gz",
            "db/02.sql.gz",
            "db/03.sql.gz",
            "db/04.sql.gz",
        ]);
        let err = apply_retention(&store, "db/", 1, 3).await.unwrap_err();

        assert!(matches!(err, BackupError::Cleanup(_)));
        assert!(!err.is_fatal());
        assert!(store.delete_calls().is_empty());
        assert_eq!(store.keys().len(), 4);
    }

    #[tokio::test]
    async fn test_listing_failure_surfaces_as_non_fatal_error() {
        let mut store = MemoryObjectStore::with_keys(&["db/01.sql.gz"]);
        store.fail_list = true;
        let err = apply_retention(&store, "db/", 1, 1000).await.unwrap_err();
        assert!(matches!(err, BackupError::List(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_prefix_scopes_the_listing() {
        let store = MemoryObjectStore::with_keys(&[
            "orders/01.sql.gz",
            "orders/02.sql.gz",
            "users/01.sql.gz",
            "users/02.sql.gz",
        ]);
        let report = apply_retention(&store, "orders/", 1, 1000).await.unwrap();
        assert_eq!(report.deleted, vec!["orders/01.sql.gz"]);
        assert!(store.keys().contains(&"users/01.sql.gz".to_string()));
    }
}
