use crate::{
    artifact::ExifMap,
    dialect::{CurrentDialect, CurrentRow, Dialect},
    record::{ImageId, ImageMetadata, ImageRecord, ImageStats, ImageStatus, Thumbnails},
};
use chrono::{DateTime, SecondsFormat, Utc};
pub use crate::dialect::Db;
pub use sqlx::Pool;
use sqlx::{
    Execute, FromRow, Row,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, time::Duration};
use thiserror::Error;

pub async fn run_migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error> {
    CurrentDialect::migration(pool).await
}

/// Timestamps are stored as RFC 3339 text with microsecond precision.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
}

impl FromRow<'_, CurrentRow> for ImageRecord {
    fn from_row(row: &CurrentRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let filename: String = row.try_get("filename")?;

        let status: String = row.try_get("status")?;
        let status = ImageStatus::from_str(&status).map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?;

        let uploaded_at: String = row.try_get("uploaded_at")?;
        let uploaded_at = parse_timestamp("uploaded_at", &uploaded_at)?;
        let processed_at: Option<String> = row.try_get("processed_at")?;
        let processed_at = processed_at
            .map(|ts| parse_timestamp("processed_at", &ts))
            .transpose()?;

        let width: Option<i64> = row.try_get("width")?;
        let height: Option<i64> = row.try_get("height")?;
        let format: Option<String> = row.try_get("format")?;
        let size_bytes: Option<i64> = row.try_get("size_bytes")?;
        let metadata = match (width, height, format, size_bytes) {
            (Some(width), Some(height), Some(format), Some(size_bytes)) => Some(ImageMetadata {
                width: width as u32,
                height: height as u32,
                format,
                size_bytes: size_bytes as u64,
            }),
            _ => None,
        };

        // A mangled blob reads back as "no EXIF" rather than failing the record.
        let exif: Option<String> = row.try_get("exif")?;
        let exif: ExifMap = exif
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        Ok(ImageRecord {
            id: ImageId::from(id),
            filename,
            status,
            uploaded_at,
            processed_at,
            metadata,
            exif,
            thumbnails: Thumbnails {
                small: row.try_get("small_thumb")?,
                medium: row.try_get("medium_thumb")?,
            },
            caption: row.try_get("caption")?,
        })
    }
}

/// The record store: one row per uploaded image, keyed by id.
///
/// This struct wraps an SQLx connection pool. Every method leases a
/// connection for the duration of one statement and hands it back when the
/// statement finishes or fails, so no caller ever holds a handle across
/// pipeline stages.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Db>,
}

impl Database {
    pub async fn with_migration(pool: sqlx::Pool<Db>) -> Result<Self, sqlx::Error> {
        run_migration(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens (creating if needed) the database at `url` and migrates it.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        Self::with_migration(pool).await
    }

    /// A migrated in-memory database.
    ///
    /// The pool holds exactly one connection that never expires, since every
    /// SQLite in-memory connection is a separate database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::with_migration(pool).await
    }

    async fn retry<F, Fut, T>(&self, mut op: F) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, DatabaseError>>,
    {
        let max_retries = 3;
        for attempt in 0..max_retries {
            let result = op().await;
            match result {
                Ok(v) => return Ok(v),
                Err(ref e) if e.is_retryable() && attempt + 1 < max_retries => {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("Retry loop should return before exceeding max_retries")
    }

    /// Runs a write statement and returns the number of affected rows.
    async fn execute<'q>(
        &self,
        operation: impl Fn() -> DbOperation,
        build: impl Fn() -> sqlx::query::Query<'q, Db, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> Result<u64, DatabaseError> {
        self.retry(|| async {
            let query = build();
            let sql = query.sql().to_string();
            query
                .execute(&self.pool)
                .await
                .map(|done| done.rows_affected())
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: operation(),
                    sql,
                    source: e,
                })
        })
        .await
    }

    /// Inserts a new record.
    ///
    /// Fails with `DatabaseError::QueryFailed` if the id is already taken.
    pub async fn create(
        &self,
        id: &ImageId,
        filename: &str,
        status: ImageStatus,
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let stmt = CurrentDialect::insert_image_statement();
        let uploaded_at = format_timestamp(&uploaded_at);

        self.execute(
            || DbOperation::InsertImage { id: id.clone() },
            || {
                sqlx::query(&stmt)
                    .bind(id.as_str())
                    .bind(filename)
                    .bind(status.as_str())
                    .bind(uploaded_at.as_str())
            },
        )
        .await?;

        Ok(())
    }

    pub async fn update_exif(&self, id: &ImageId, exif: &ExifMap) -> Result<(), DatabaseError> {
        let stmt = CurrentDialect::update_exif_statement();
        let json = serde_json::to_string(exif).map_err(|e| DatabaseError::Encode {
            operation: DbOperation::UpdateExif { id: id.clone() },
            source: e,
        })?;

        self.execute(
            || DbOperation::UpdateExif { id: id.clone() },
            || sqlx::query(&stmt).bind(json.as_str()).bind(id.as_str()),
        )
        .await?;

        Ok(())
    }

    /// Writes width, height, format and size together. Leaves `status` alone.
    pub async fn update_metadata(
        &self,
        id: &ImageId,
        metadata: &ImageMetadata,
    ) -> Result<(), DatabaseError> {
        let stmt = CurrentDialect::update_metadata_statement();

        self.execute(
            || DbOperation::UpdateMetadata {
                id: id.clone(),
                metadata: metadata.clone(),
            },
            || {
                sqlx::query(&stmt)
                    .bind(metadata.width as i64)
                    .bind(metadata.height as i64)
                    .bind(metadata.format.as_str())
                    .bind(metadata.size_bytes as i64)
                    .bind(id.as_str())
            },
        )
        .await?;

        Ok(())
    }

    pub async fn update_thumbnails(
        &self,
        id: &ImageId,
        thumbnails: &Thumbnails,
    ) -> Result<(), DatabaseError> {
        let stmt = CurrentDialect::update_thumbnails_statement();

        self.execute(
            || DbOperation::UpdateThumbnails { id: id.clone() },
            || {
                sqlx::query(&stmt)
                    .bind(thumbnails.small.as_deref())
                    .bind(thumbnails.medium.as_deref())
                    .bind(id.as_str())
            },
        )
        .await?;

        Ok(())
    }

    pub async fn update_caption(&self, id: &ImageId, caption: &str) -> Result<(), DatabaseError> {
        let stmt = CurrentDialect::update_caption_statement();

        self.execute(
            || DbOperation::UpdateCaption { id: id.clone() },
            || sqlx::query(&stmt).bind(caption).bind(id.as_str()),
        )
        .await?;

        Ok(())
    }

    /// Moves a `processing` record to `status`.
    ///
    /// Returns `false` when nothing changed: the id is unknown or the record
    /// already reached a terminal status.
    pub async fn update_status(
        &self,
        id: &ImageId,
        status: ImageStatus,
    ) -> Result<bool, DatabaseError> {
        let stmt = CurrentDialect::update_status_statement();

        let affected = self
            .execute(
                || DbOperation::UpdateStatus {
                    id: id.clone(),
                    status,
                },
                || sqlx::query(&stmt).bind(status.as_str()).bind(id.as_str()),
            )
            .await?;

        Ok(affected > 0)
    }

    /// Marks a `processing` record `processed` and records when.
    ///
    /// Returns `false` when nothing changed, in which case `processed_at`
    /// keeps whatever value it had.
    pub async fn mark_processed(
        &self,
        id: &ImageId,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let stmt = CurrentDialect::mark_processed_statement();
        let processed_at = format_timestamp(&processed_at);

        let affected = self
            .execute(
                || DbOperation::MarkProcessed { id: id.clone() },
                || {
                    sqlx::query(&stmt)
                        .bind(processed_at.as_str())
                        .bind(id.as_str())
                },
            )
            .await?;

        Ok(affected > 0)
    }

    pub async fn get(&self, id: &ImageId) -> Result<Option<ImageRecord>, DatabaseError> {
        let stmt = CurrentDialect::query_image_statement();

        self.retry(|| async {
            sqlx::query_as(&stmt)
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryImage { id: id.clone() },
                    sql: stmt.to_string(),
                    source: e,
                })
        })
        .await
    }

    /// Every record, in insertion order.
    pub async fn list_all(&self) -> Result<Vec<ImageRecord>, DatabaseError> {
        let stmt = CurrentDialect::query_images_statement();

        self.retry(|| async {
            sqlx::query_as(&stmt)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryImages,
                    sql: stmt.to_string(),
                    source: e,
                })
        })
        .await
    }

    pub async fn stats(&self) -> Result<ImageStats, DatabaseError> {
        let count_stmt = CurrentDialect::count_images_statement();
        let durations_stmt = CurrentDialect::query_durations_statement();

        let counts = self
            .retry(|| async {
                sqlx::query(&count_stmt)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QueryStats,
                        sql: count_stmt.to_string(),
                        source: e,
                    })
            })
            .await?;
        let decode = |column: &str| {
            counts
                .try_get::<i64, _>(column)
                .map(|v| v as u64)
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::QueryStats,
                    sql: count_stmt.to_string(),
                    source: e,
                })
        };
        let (total, success, failed) = (decode("total")?, decode("success")?, decode("failed")?);

        let rows: Vec<(String, String)> = self
            .retry(|| async {
                sqlx::query_as(&durations_stmt)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::QueryStats,
                        sql: durations_stmt.to_string(),
                        source: e,
                    })
            })
            .await?;

        let mut durations = Vec::with_capacity(rows.len());
        for (uploaded_at, processed_at) in rows {
            let to_error = |e| DatabaseError::QueryFailed {
                operation: DbOperation::QueryStats,
                sql: durations_stmt.to_string(),
                source: e,
            };
            let start = parse_timestamp("uploaded_at", &uploaded_at).map_err(to_error)?;
            let end = parse_timestamp("processed_at", &processed_at).map_err(to_error)?;
            durations.push((end - start).num_milliseconds() as f64 / 1000.0);
        }

        let avg_processing_seconds = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        Ok(ImageStats {
            total,
            success,
            failed,
            avg_processing_seconds,
        })
    }
}

/// Represents errors that can occur during database operations.
///
/// Each variant includes contextual information to assist with debugging and error handling.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A general SQL query failure, with full context including operation and SQL.
    #[error("Query failed during {operation:?}: sql={sql}")]
    QueryFailed {
        operation: DbOperation,
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    /// A value could not be serialized for storage.
    #[error("Failed to encode value during {operation:?}")]
    Encode {
        operation: DbOperation,
        #[source]
        source: serde_json::Error,
    },
}

/// Enum representing the kind of database operation being performed,
/// used for attaching context to [`DatabaseError`].
#[derive(Debug)]
pub enum DbOperation {
    /// INSERT INTO images
    InsertImage { id: ImageId },
    /// UPDATE images SET exif
    UpdateExif { id: ImageId },
    /// UPDATE images SET width, height, format, size_bytes
    UpdateMetadata { id: ImageId, metadata: ImageMetadata },
    /// UPDATE images SET small_thumb, medium_thumb
    UpdateThumbnails { id: ImageId },
    /// UPDATE images SET caption
    UpdateCaption { id: ImageId },
    /// UPDATE images SET status
    UpdateStatus { id: ImageId, status: ImageStatus },
    /// UPDATE images SET status = 'processed', processed_at
    MarkProcessed { id: ImageId },
    /// SELECT ... WHERE id = ...
    QueryImage { id: ImageId },
    /// SELECT ... ORDER BY insertion
    QueryImages,
    /// Aggregate counters and durations
    QueryStats,
}

impl DatabaseError {
    fn is_retryable(&self) -> bool {
        let is_retryable_kind = |e: &sqlx::Error| {
            matches!(e, sqlx::Error::Io(_))
                || matches!(e, sqlx::Error::Protocol(_))
                || matches!(e, sqlx::Error::PoolTimedOut)
        };

        match self {
            DatabaseError::QueryFailed { source, .. } => is_retryable_kind(source),
            DatabaseError::Encode { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        artifact::{ExifMap, ExifValue},
        database::Database,
        record::{ImageId, ImageMetadata, ImageStatus, Thumbnails},
    };
    use chrono::{DateTime, Duration, Utc};
    use std::str::FromStr;

    fn t0() -> DateTime<Utc> {
        DateTime::from_str("2025-05-02T01:18:49.678809Z").unwrap()
    }

    async fn db_with_image(id: &ImageId) -> Database {
        let db = Database::in_memory().await.unwrap();
        db.create(id, "cat.jpg", ImageStatus::Processing, t0())
            .await
            .unwrap();
        db
    }

    /// Verifies that `Database::with_migration` can be called multiple times
    /// on the same pool without error.
    #[tokio::test]
    async fn test_migration_idempotency() {
        let db = Database::in_memory().await.unwrap();

        Database::with_migration(db.pool.clone()).await.unwrap();
        Database::with_migration(db.pool.clone()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let id = ImageId::from("img-1");
        let db = db_with_image(&id).await;

        let record = db.get(&id).await.unwrap().unwrap();
        assert_eq!(id, record.id);
        assert_eq!("cat.jpg", record.filename);
        assert_eq!(ImageStatus::Processing, record.status);
        assert_eq!(t0(), record.uploaded_at);
        assert_eq!(None, record.processed_at);
        assert_eq!(None, record.metadata);
        assert!(record.exif.is_empty());
        assert_eq!(Thumbnails::default(), record.thumbnails);
        assert_eq!(None, record.caption);

        assert_eq!(None, db.get(&ImageId::from("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_duplicate_id_fails() {
        let id = ImageId::from("img-1");
        let db = db_with_image(&id).await;

        assert!(
            db.create(&id, "dog.jpg", ImageStatus::Processing, t0())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_update_fields() {
        let id = ImageId::from("img-1");
        let db = db_with_image(&id).await;

        let mut exif = ExifMap::new();
        exif.insert("Make".to_string(), ExifValue::Text("Canon".to_string()));
        let metadata = ImageMetadata {
            width: 800,
            height: 600,
            format: "jpeg".to_string(),
            size_bytes: 1337,
        };
        let thumbnails = Thumbnails {
            small: Some("/tmp/small.jpg".to_string()),
            medium: None,
        };

        db.update_exif(&id, &exif).await.unwrap();
        db.update_metadata(&id, &metadata).await.unwrap();
        db.update_thumbnails(&id, &thumbnails).await.unwrap();
        db.update_caption(&id, "a cat").await.unwrap();

        let record = db.get(&id).await.unwrap().unwrap();
        assert_eq!(exif, record.exif);
        assert_eq!(Some(metadata), record.metadata);
        assert_eq!(thumbnails, record.thumbnails);
        assert_eq!(Some("a cat".to_string()), record.caption);
        // Metadata alone never flips the status.
        assert_eq!(ImageStatus::Processing, record.status);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let id = ImageId::from("img-1");
        let db = db_with_image(&id).await;
        let done = t0() + Duration::seconds(2);

        assert!(db.mark_processed(&id, done).await.unwrap());
        assert!(!db.update_status(&id, ImageStatus::Failed).await.unwrap());
        assert!(!db.update_status(&id, ImageStatus::Processing).await.unwrap());
        assert!(!db.mark_processed(&id, done + Duration::seconds(5)).await.unwrap());

        let record = db.get(&id).await.unwrap().unwrap();
        assert_eq!(ImageStatus::Processed, record.status);
        assert_eq!(Some(done), record.processed_at);
    }

    #[tokio::test]
    async fn test_failed_is_final() {
        let id = ImageId::from("img-1");
        let db = db_with_image(&id).await;

        assert!(db.update_status(&id, ImageStatus::Failed).await.unwrap());
        assert!(!db.mark_processed(&id, Utc::now()).await.unwrap());

        let record = db.get(&id).await.unwrap().unwrap();
        assert_eq!(ImageStatus::Failed, record.status);
        assert_eq!(None, record.processed_at);
    }

    #[tokio::test]
    async fn test_update_status_unknown_id() {
        let db = Database::in_memory().await.unwrap();
        assert!(
            !db.update_status(&ImageId::from("nope"), ImageStatus::Failed)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_list_all_in_insertion_order() {
        let db = Database::in_memory().await.unwrap();
        for name in ["c", "a", "b"] {
            db.create(&ImageId::from(name), name, ImageStatus::Processing, t0())
                .await
                .unwrap();
        }

        let ids: Vec<String> = db
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.into())
            .collect();
        assert_eq!(vec!["c", "a", "b"], ids);
    }

    #[tokio::test]
    async fn test_stats_empty() {
        let db = Database::in_memory().await.unwrap();
        let stats = db.stats().await.unwrap();

        assert_eq!(0, stats.total);
        assert_eq!(0, stats.success);
        assert_eq!(0, stats.failed);
        assert_eq!(0.0, stats.avg_processing_seconds);
    }

    #[tokio::test]
    async fn test_stats() {
        let db = Database::in_memory().await.unwrap();
        let ids: Vec<ImageId> = ["a", "b", "c", "d"].into_iter().map(ImageId::from).collect();
        for id in &ids {
            db.create(id, "x.png", ImageStatus::Processing, t0())
                .await
                .unwrap();
        }

        db.mark_processed(&ids[0], t0() + Duration::seconds(2))
            .await
            .unwrap();
        db.mark_processed(&ids[1], t0() + Duration::milliseconds(4500))
            .await
            .unwrap();
        db.update_status(&ids[2], ImageStatus::Failed).await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(4, stats.total);
        assert_eq!(2, stats.success);
        assert_eq!(1, stats.failed);
        assert!(stats.success + stats.failed <= stats.total);
        assert!((stats.avg_processing_seconds - 3.25).abs() < 1e-9);
    }
}
