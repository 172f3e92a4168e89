use super::{Db, Dialect, RECORD_COLUMNS};
use sqlx::Row;

/// SQLite dialect implementation of the `Dialect` trait.
#[cfg(feature = "sqlite")]
pub struct SqliteDialect;

#[cfg(feature = "sqlite")]
impl Dialect for SqliteDialect {
    fn placeholder(_idx: usize) -> String {
        "?".to_string()
    }

    fn query_images_statement() -> String {
        format!("SELECT {} FROM images ORDER BY rowid", RECORD_COLUMNS)
    }

    async fn migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error> {
        let stmts = vec![
            r#"CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                status TEXT NOT NULL,
                uploaded_at TEXT NOT NULL,
                width INTEGER,
                height INTEGER,
                format TEXT,
                size_bytes INTEGER,
                caption TEXT,
                small_thumb TEXT,
                medium_thumb TEXT
            );"#,
            r#"CREATE INDEX IF NOT EXISTS images_status ON images (status);"#,
        ];

        for stmt in stmts {
            sqlx::query(stmt).execute(pool).await?;
        }

        maybe_add_column(pool, "exif", "TEXT").await?;
        maybe_add_column(pool, "processed_at", "TEXT").await?;

        Ok(())
    }
}

/// Adds a column introduced after the first schema, for databases created
/// before it existed.
async fn maybe_add_column(
    pool: &sqlx::Pool<Db>,
    column: &str,
    sql_type: &str,
) -> Result<(), sqlx::Error> {
    let rows = sqlx::query("PRAGMA table_info(images);")
        .fetch_all(pool)
        .await?;

    let has_column = rows.iter().any(|row| {
        let name: &str = row.get("name");
        name == column
    });

    if !has_column {
        sqlx::query(&format!("ALTER TABLE images ADD COLUMN {column} {sql_type};"))
            .execute(pool)
            .await?;
    }

    Ok(())
}
