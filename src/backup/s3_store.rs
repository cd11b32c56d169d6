// pgvault/src/backup/s3_store.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, SecondsFormat, Utc};
use std::future::Future;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::errors::{BackupError, Result};

pub const BACKUP_SUFFIX: &str = ".sql.gz";
pub const CONTENT_TYPE: &str = "application/gzip";
const LIST_PAGE_SIZE: usize = 1000;

/// An object as reported by a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBackupObject {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub objects: Vec<StoredBackupObject>,
    /// More objects exist under the prefix than were returned.
    pub truncated: bool,
}

/// put/list/delete against S3-compatible storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Lists up to `max_results` objects under `prefix`.
    async fn list(&self, prefix: &str, max_results: usize) -> Result<ObjectListing>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Object key for a backup taken at `at`: `<prefix><timestamp>.sql.gz`.
///
/// The timestamp is fixed-width RFC 3339 in UTC with `:` and `.` replaced by `-`, so
/// lexical key order is chronological order.
pub fn backup_key(prefix: &str, at: DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{}{}{}", prefix, stamp, BACKUP_SUFFIX)
}

/// One page of a bucket listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<StoredBackupObject>,
    /// The server has more results after this page.
    pub more: bool,
    pub next_token: Option<String>,
}

/// Pages through a listing until it is exhausted or `max_results` objects have been
/// collected. `fetch_page` receives the page size to request and the continuation token.
///
/// The result is truncated when objects beyond the cap exist, or when the server reports
/// more results without handing out a token to fetch them.
pub async fn collect_listing<F, Fut>(
    prefix: &str,
    max_results: usize,
    page_limit: usize,
    mut fetch_page: F,
) -> Result<ObjectListing>
where
    F: FnMut(usize, Option<String>) -> Fut,
    Fut: Future<Output = Result<ListPage>>,
{
    let mut listing = ObjectListing::default();
    let mut continuation: Option<String> = None;

    loop {
        let page_size = page_limit.min(max_results - listing.objects.len()).max(1);
        let page = fetch_page(page_size, continuation.take()).await?;
        listing.objects.extend(page.objects);
        debug!(prefix, fetched = listing.objects.len(), more = page.more, "Listed page");

        if listing.objects.len() >= max_results {
            listing.truncated = page.more || listing.objects.len() > max_results;
            listing.objects.truncate(max_results);
            break;
        }
        if !page.more {
            break;
        }
        match page.next_token {
            Some(token) => continuation = Some(token),
            None => {
                warn!(
                    prefix,
                    fetched = listing.objects.len(),
                    "Listing reported more results without a continuation token"
                );
                listing.truncated = true;
                break;
            }
        }
    }

    Ok(listing)
}

pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(storage: &StorageConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&storage.endpoint_url)
            .region(Region::new(storage.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &storage.access_key_id,
                &storage.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        // Path-style addressing keeps MinIO and other self-hosted endpoints working.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: storage.bucket_name.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| BackupError::Upload {
                key: key.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        info!(bucket = %self.bucket, key, bytes = size, "Uploaded object");
        Ok(())
    }

    async fn list(&self, prefix: &str, max_results: usize) -> Result<ObjectListing> {
        let client = &self.client;
        let bucket = self.bucket.as_str();
        collect_listing(prefix, max_results, LIST_PAGE_SIZE, move |page_size, token| async move {
            let page = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .max_keys(page_size as i32)
                .set_continuation_token(token)
                .send()
                .await
                .map_err(|e| BackupError::List(DisplayErrorContext(&e).to_string()))?;

            let objects = page
                .contents()
                .iter()
                .filter_map(|object| {
                    Some(StoredBackupObject {
                        key: object.key()?.to_string(),
                        size: object.size().unwrap_or_default(),
                        last_modified: object
                            .last_modified()
                            .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                    })
                })
                .collect();

            Ok::<_, BackupError>(ListPage {
                objects,
                more: page.is_truncated().unwrap_or(false),
                next_token: page.next_continuation_token().map(str::to_string),
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackupError::Delete {
                key: key.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::backup::s3_store::memory::{object, page_at};

    fn numbered(count: usize) -> Vec<StoredBackupObject> {
        (0..count).map(|i| object(&format!("db/{:02}.sql.gz", i))).collect()
    }

    #[tokio::test]
    async fn test_listing_walks_every_page() {
        let objects = numbered(5);
        let mut requests = Vec::new();
        let listing = collect_listing("db/", 10, 2, |page_size, token| {
            requests.push((page_size, token.clone()));
            std::future::ready(Ok(page_at(&objects, token, page_size)))
        })
        .await
        .unwrap();

        assert_eq!(listing.objects, objects);
        assert!(!listing.truncated);
        assert_eq!(
            requests,
            vec![
                (2, None),
                (2, Some("2".to_string())),
                (2, Some("4".to_string()))
            ]
        );
    }

    #[tokio::test]
    async fn test_listing_exactly_at_cap_is_complete() {
        let objects = numbered(4);
        let listing = collect_listing("db/", 4, 2, |page_size, token| {
            std::future::ready(Ok(page_at(&objects, token, page_size)))
        })
        .await
        .unwrap();

        assert_eq!(listing.objects.len(), 4);
        assert!(!listing.truncated);
    }

    #[tokio::test]
    async fn test_listing_beyond_cap_is_truncated() {
        let objects = numbered(5);
        let mut sizes = Vec::new();
        let listing = collect_listing("db/", 3, 2, |page_size, token| {
            sizes.push(page_size);
            std::future::ready(Ok(page_at(&objects, token, page_size)))
        })
        .await
        .unwrap();

        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(listing.objects, objects[..3].to_vec());
        assert!(listing.truncated);
    }

    #[tokio::test]
    async fn test_oversized_page_is_cut_to_cap() {
        let objects = numbered(3);
        let listing = collect_listing("db/", 2, 1000, |_, _| {
            std::future::ready(Ok(ListPage {
                objects: objects.clone(),
                more: false,
                next_token: None,
            }))
        })
        .await
        .unwrap();

        assert_eq!(listing.objects.len(), 2);
        assert!(listing.truncated);
    }

    #[tokio::test]
    async fn test_missing_continuation_token_marks_truncated() {
        let objects = numbered(2);
        let mut calls = 0;
        let listing = collect_listing("db/", 10, 2, |_, _| {
            calls += 1;
            std::future::ready(Ok(ListPage {
                objects: objects.clone(),
                more: true,
                next_token: None,
            }))
        })
        .await
        .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(listing.objects.len(), 2);
        assert!(listing.truncated);
    }

    #[tokio::test]
    async fn test_listing_error_propagates() {
        let objects = numbered(4);
        let mut calls = 0;
        let err = collect_listing("db/", 10, 2, |page_size, token| {
            calls += 1;
            std::future::ready(if calls == 1 {
                Ok(page_at(&objects, token, page_size))
            } else {
                Err(BackupError::List("throttled".into()))
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, BackupError::List(_)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_backup_key_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(
            backup_key("orders/", at),
            "orders/2024-03-09T07-05-03-042Z.sql.gz"
        );
    }

    #[test]
    fn test_backup_keys_sort_chronologically() {
        let base = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let instants = [
            base,
            base + chrono::Duration::milliseconds(1),
            base + chrono::Duration::seconds(1),
            base + chrono::Duration::hours(10),
            base + chrono::Duration::days(400),
        ];
        let keys: Vec<String> = instants.iter().map(|t| backup_key("db/", *t)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_backup_key_has_no_colons_or_inner_dots() {
        let key = backup_key("p/", Utc::now());
        assert!(!key.contains(':'));
        assert_eq!(key.matches('.').count(), 2);
        assert!(key.ends_with(BACKUP_SUFFIX));
    }
}
