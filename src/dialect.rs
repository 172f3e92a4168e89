//! # SQL Dialect Module
//!
//! This module defines the `Dialect` trait, which abstracts over the differences in
//! SQL syntax across database systems. The record store builds every statement it
//! runs through `CurrentDialect`, so the higher-level code never spells SQL itself.
//!
//! The dialect in use is chosen at compile time by feature flags. When the `sqlite`
//! feature is enabled, `CurrentDialect` is `sqlite::SqliteDialect`.
//!
//! Status transitions are guarded in SQL: every statement that changes `status`
//! only matches rows that are still `processing`, which keeps `processed` and
//! `failed` terminal no matter who issues the write.

#[cfg(feature = "sqlite")]
mod sqlite;

/// The current SQL dialect used at compile time, determined by feature flags.
#[cfg(feature = "sqlite")]
pub type CurrentDialect = sqlite::SqliteDialect;

#[cfg(feature = "sqlite")]
pub type Db = sqlx::Sqlite;

#[cfg(feature = "sqlite")]
pub type CurrentRow = sqlx::sqlite::SqliteRow;

/// Columns selected whenever a full record is read.
const RECORD_COLUMNS: &str = "id, filename, status, uploaded_at, processed_at, width, height, \
                              format, size_bytes, exif, small_thumb, medium_thumb, caption";

/// A trait for SQL dialects to support database-specific query generation.
pub trait Dialect {
    /// Returns the SQL placeholder syntax for the given parameter index.
    ///
    /// - SQLite: `?`
    ///
    /// # Parameters
    /// - `idx`: The 1-based parameter index (used in dialects that number placeholders).
    fn placeholder(idx: usize) -> String;

    /// Inserts a fresh record: `(id, filename, status, uploaded_at)`.
    fn insert_image_statement() -> String {
        format!(
            "INSERT INTO images (id, filename, status, uploaded_at) VALUES ({}, {}, {}, {})",
            Self::placeholder(1),
            Self::placeholder(2),
            Self::placeholder(3),
            Self::placeholder(4)
        )
    }

    /// Binds: `(exif_json, id)`.
    fn update_exif_statement() -> String {
        format!(
            "UPDATE images SET exif = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2)
        )
    }

    /// Writes the four metadata columns in one statement.
    ///
    /// Binds: `(width, height, format, size_bytes, id)`.
    fn update_metadata_statement() -> String {
        format!(
            "UPDATE images SET width = {}, height = {}, format = {}, size_bytes = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2),
            Self::placeholder(3),
            Self::placeholder(4),
            Self::placeholder(5)
        )
    }

    /// Binds: `(small_thumb, medium_thumb, id)`.
    fn update_thumbnails_statement() -> String {
        format!(
            "UPDATE images SET small_thumb = {}, medium_thumb = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2),
            Self::placeholder(3)
        )
    }

    /// Binds: `(caption, id)`.
    fn update_caption_statement() -> String {
        format!(
            "UPDATE images SET caption = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2)
        )
    }

    /// Moves a `processing` record to another status.
    ///
    /// Binds: `(status, id)`.
    fn update_status_statement() -> String {
        format!(
            "UPDATE images SET status = {} WHERE id = {} AND status = 'processing'",
            Self::placeholder(1),
            Self::placeholder(2)
        )
    }

    /// Flips a `processing` record to `processed` and stamps `processed_at`.
    ///
    /// Binds: `(processed_at, id)`.
    fn mark_processed_statement() -> String {
        format!(
            "UPDATE images SET status = 'processed', processed_at = {} \
             WHERE id = {} AND status = 'processing'",
            Self::placeholder(1),
            Self::placeholder(2)
        )
    }

    /// Binds: `(id)`.
    fn query_image_statement() -> String {
        format!(
            "SELECT {} FROM images WHERE id = {}",
            RECORD_COLUMNS,
            Self::placeholder(1)
        )
    }

    /// All records in insertion order.
    fn query_images_statement() -> String;

    /// Returns the `total`, `success` and `failed` counters in one row.
    fn count_images_statement() -> String {
        r#"SELECT
            COUNT(*) AS total,
            COALESCE(SUM(CASE WHEN status = 'processed' THEN 1 ELSE 0 END), 0) AS success,
            COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed
        FROM images"#
            .to_string()
    }

    /// Upload and completion timestamps of every processed record.
    fn query_durations_statement() -> String {
        "SELECT uploaded_at, processed_at FROM images WHERE processed_at IS NOT NULL".to_string()
    }

    /// Creates or upgrades the schema. Must be idempotent.
    async fn migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error>;
}

#[cfg(test)]
mod tests {
    use super::{CurrentDialect, Dialect};

    #[test]
    fn test_status_writes_are_guarded() {
        assert!(CurrentDialect::update_status_statement().contains("status = 'processing'"));
        assert!(CurrentDialect::mark_processed_statement().contains("status = 'processing'"));
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(
            "UPDATE images SET caption = ? WHERE id = ?",
            CurrentDialect::update_caption_statement()
        );
    }
}
