//! Persistent sync state keyed by normalized URL.
//!
//! Each write is a single SQL statement, so concurrent workers sharing the
//! pool observe either the old or the new row, never a mix. SQLite serializes
//! writers; the pool's busy timeout makes contending writers wait.

use std::path::Path;

use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::db;
use crate::migrate;
use crate::models::{RecordUpsert, SyncRecord, TitleSource};

/// Meta key holding the incremental push watermark.
pub const WATERMARK_KEY: &str = "last_push_new_end_ts";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid stored status: {0}")]
    InvalidStatus(i64),
}

/// Counts shown by `rw-sync stats`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSummary {
    pub documents: i64,
    pub with_remote_id: i64,
    pub with_error: i64,
    pub last_updated_at: Option<i64>,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect_path(path).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        migrate::apply(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn lookup(&self, normalized_url: &str) -> Result<Option<SyncRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT norm_url, source_url, title, title_source, file_path, file_mtime, remote_id, \
             last_status, last_error, created_at, updated_at FROM documents WHERE norm_url = ?1",
        )
        .bind(normalized_url)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let title_source: Option<String> = row.try_get("title_source")?;
        let last_status: Option<i64> = row.try_get("last_status")?;
        let last_status = last_status
            .map(|s| u16::try_from(s).map_err(|_| StoreError::InvalidStatus(s)))
            .transpose()?;

        Ok(Some(SyncRecord {
            normalized_url: row.try_get("norm_url")?,
            source_url: row.try_get("source_url")?,
            title: row.try_get("title")?,
            title_source: title_source.as_deref().map(TitleSource::parse),
            file_path: row.try_get("file_path")?,
            file_mtime: row.try_get("file_mtime")?,
            remote_id: row.try_get("remote_id")?,
            last_status,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    /// Merge-or-insert by normalized URL. A null remote id keeps the stored one.
    pub async fn upsert(&self, record: &RecordUpsert) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO documents (
                norm_url, source_url, title, title_source, file_path, file_mtime,
                remote_id, last_status, last_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT(norm_url) DO UPDATE SET
                source_url = excluded.source_url,
                title = excluded.title,
                title_source = excluded.title_source,
                file_path = excluded.file_path,
                file_mtime = excluded.file_mtime,
                remote_id = COALESCE(excluded.remote_id, documents.remote_id),
                last_status = excluded.last_status,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.normalized_url)
        .bind(&record.source_url)
        .bind(&record.title)
        .bind(record.title_source.map(|s| s.as_str()))
        .bind(&record.file_path)
        .bind(record.file_mtime)
        .bind(&record.remote_id)
        .bind(record.last_status.map(i64::from))
        .bind(&record.last_error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Touch only status, error and `updated_at`. No-op for unknown URLs.
    pub async fn update_status(
        &self,
        normalized_url: &str,
        status: Option<u16>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE documents SET last_status = ?1, last_error = ?2, updated_at = ?3 WHERE norm_url = ?4",
        )
        .bind(status.map(i64::from))
        .bind(error)
        .bind(now)
        .bind(normalized_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The incremental watermark; unparseable values read as absent.
    pub async fn watermark(&self) -> Result<Option<f64>, StoreError> {
        Ok(self
            .get_meta(WATERMARK_KEY)
            .await?
            .and_then(|raw| raw.trim().parse::<f64>().ok()))
    }

    pub async fn set_watermark(&self, value: f64) -> Result<(), StoreError> {
        self.set_meta(WATERMARK_KEY, &value.to_string()).await
    }

    pub async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS documents,
                COUNT(remote_id) AS with_remote_id,
                COUNT(last_error) AS with_error,
                MAX(updated_at) AS last_updated_at
            FROM documents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreSummary {
            documents: row.try_get("documents")?,
            with_remote_id: row.try_get("with_remote_id")?,
            with_error: row.try_get("with_error")?,
            last_updated_at: row.try_get("last_updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> StateStore {
        StateStore::open(&tmp.path().join("state/test.db"))
            .await
            .unwrap()
    }

    fn upsert(url: &str, remote_id: Option<&str>) -> RecordUpsert {
        RecordUpsert {
            normalized_url: url.to_string(),
            source_url: url.to_string(),
            title: Some("Title".to_string()),
            title_source: Some(TitleSource::Local),
            file_path: "/inbox/a.html".to_string(),
            file_mtime: 100.5,
            remote_id: remote_id.map(str::to_string),
            last_status: Some(201),
            last_error: None,
        }
    }

    #[tokio::test]
    async fn lookup_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        assert!(store.lookup("https://example.com/").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_then_lookup() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        store
            .upsert(&upsert("https://example.com/a", Some("r1")))
            .await
            .unwrap();

        let record = store.lookup("https://example.com/a").await.unwrap().unwrap();
        assert_eq!(record.remote_id.as_deref(), Some("r1"));
        assert_eq!(record.title_source, Some(TitleSource::Local));
        assert_eq!(record.last_status, Some(201));
        assert_eq!(record.file_mtime, 100.5);
        assert!(record.created_at > 0);
    }

    #[tokio::test]
    async fn null_remote_id_preserves_existing() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        store
            .upsert(&upsert("https://example.com/a", Some("r1")))
            .await
            .unwrap();

        let mut second = upsert("https://example.com/a", None);
        second.file_path = "/inbox/moved.html".to_string();
        second.last_error = Some("boom".to_string());
        store.upsert(&second).await.unwrap();

        let record = store.lookup("https://example.com/a").await.unwrap().unwrap();
        assert_eq!(record.remote_id.as_deref(), Some("r1"));
        assert_eq!(record.file_path, "/inbox/moved.html");
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn update_status_leaves_other_fields() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        store
            .upsert(&upsert("https://example.com/a", Some("r1")))
            .await
            .unwrap();

        store
            .update_status("https://example.com/a", Some(500), Some("unexpected status 500"))
            .await
            .unwrap();

        let record = store.lookup("https://example.com/a").await.unwrap().unwrap();
        assert_eq!(record.last_status, Some(500));
        assert_eq!(record.last_error.as_deref(), Some("unexpected status 500"));
        assert_eq!(record.title.as_deref(), Some("Title"));
        assert_eq!(record.remote_id.as_deref(), Some("r1"));

        // Unknown keys are ignored
        store
            .update_status("https://example.com/missing", Some(500), None)
            .await
            .unwrap();
        assert!(store
            .lookup("https://example.com/missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn meta_round_trip_and_watermark() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        assert_eq!(store.get_meta("k").await.unwrap(), None);
        store.set_meta("k", "v1").await.unwrap();
        store.set_meta("k", "v2").await.unwrap();
        assert_eq!(store.get_meta("k").await.unwrap().as_deref(), Some("v2"));

        assert_eq!(store.watermark().await.unwrap(), None);
        store.set_watermark(1_700_000_000.25).await.unwrap();
        assert_eq!(store.watermark().await.unwrap(), Some(1_700_000_000.25));

        store.set_meta(WATERMARK_KEY, "garbage").await.unwrap();
        assert_eq!(store.watermark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_upserts_all_land() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.spawn(async move {
                let url = format!("https://example.com/{}", i % 5);
                store.upsert(&upsert(&url, Some(&format!("r{i}")))).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.documents, 5);
        assert_eq!(summary.with_remote_id, 5);
        assert_eq!(summary.with_error, 0);
    }
}
