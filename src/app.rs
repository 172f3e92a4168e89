//! # Application Module
//!
//! High-level entry points used by the web and CLI binaries.
//!
//! ## Ingress
//!
//! - **UploadImageCommand**: stores the raw bytes, creates a `processing`
//!   record and hands the upload to the [`Pipeline`]. `execute` returns as
//!   soon as the record exists; processing happens on a background task.
//!
//! ## Queries
//!
//! - **find_image** / **list_images**: read records as they currently are,
//!   including records still being processed.
//! - **read_thumbnail**: loads the bytes of one thumbnail size.
//! - **image_stats**: counters and the mean processing time.
//!
//! ## Error Handling
//!
//! Every function returns [`AppError`], which wraps the module errors and
//! adds the `NotFound` and `InvalidArgument` cases the callers map to
//! user-facing responses.

use crate::{
    database::{Database, DatabaseError},
    pipeline::{Pipeline, PipelineJob},
    record::{ImageId, ImageRecord, ImageStats, ImageStatus, ThumbnailSize, ThumbnailSizeParseError},
    storage::{Storage, StorageError},
};
use chrono::Utc;
use std::path::Path;
use tracing::{debug, info};

/// Represents a command for accepting one uploaded image.
///
/// ```no_run
/// use darkroom::prelude::*;
///
/// async fn upload(pipeline: &Pipeline, storage: &Storage, db: &Database, bytes: &[u8]) {
///     let id = UploadImageCommand::new(bytes, "holiday.jpg")
///         .execute(pipeline, storage, db)
///         .await
///         .unwrap();
///     println!("accepted {id}");
/// }
/// ```
pub struct UploadImageCommand {
    /// Raw upload bytes.
    pub bytes: Vec<u8>,
    /// Client-supplied file name, stored verbatim in the record.
    pub filename: String,
}

impl UploadImageCommand {
    pub fn new(bytes: &[u8], filename: &str) -> Self {
        UploadImageCommand {
            bytes: bytes.to_vec(),
            filename: filename.to_string(),
        }
    }

    /// Persists the bytes and creates the `processing` record, without
    /// scheduling anything.
    ///
    /// Returns the job the pipeline needs. Callers that want to wait for the
    /// outcome (the CLI) run it themselves.
    pub async fn stage(self, storage: &Storage, db: &Database) -> Result<PipelineJob, AppError> {
        let id = ImageId::generate();

        let path = storage.create_file(&id, &self.filename, &self.bytes).await?;
        db.create(&id, &self.filename, ImageStatus::Processing, Utc::now())
            .await?;

        info!(
            image_id = %id,
            filename = %self.filename,
            bytes = self.bytes.len(),
            "upload accepted"
        );

        Ok(PipelineJob {
            id,
            path,
            filename: self.filename,
        })
    }

    /// Stages the upload and schedules processing in the background.
    ///
    /// Returns the new id without waiting for any processing stage.
    pub async fn execute(
        self,
        pipeline: &Pipeline,
        storage: &Storage,
        db: &Database,
    ) -> Result<ImageId, AppError> {
        let job = self.stage(storage, db).await?;
        let id = job.id.clone();

        // The task outlives this call; its result lands in the record store.
        drop(pipeline.schedule(job));

        Ok(id)
    }
}

/// Retrieves one record by id.
pub async fn find_image(db: &Database, id: &ImageId) -> Result<ImageRecord, AppError> {
    db.get(id)
        .await?
        .ok_or_else(|| AppError::NotFound { id: id.clone() })
}

/// Every record in upload order.
pub async fn list_images(db: &Database) -> Result<Vec<ImageRecord>, AppError> {
    Ok(db.list_all().await?)
}

/// Reads the thumbnail bytes of `size` for `id`.
///
/// The record is looked up before `size` is validated, so an unknown id is
/// `NotFound` even with an invalid size.
///
/// # Errors
///
/// - `AppError::NotFound` for an unknown id, or when that size was never
///   produced or its file cannot be read.
/// - `AppError::InvalidArgument` when `size` is neither `small` nor `medium`.
pub async fn read_thumbnail(
    db: &Database,
    storage: &Storage,
    id: &ImageId,
    size: &str,
) -> Result<Vec<u8>, AppError> {
    let record = find_image(db, id).await?;
    let size: ThumbnailSize = size.parse()?;

    let path = record
        .thumbnails
        .get(size)
        .ok_or_else(|| AppError::ThumbnailNotFound {
            id: id.clone(),
            size,
        })?;

    match storage.read_file(Path::new(path)).await {
        Ok(bytes) => Ok(bytes),
        Err(StorageError::FileNotFound { path }) => {
            debug!(image_id = %id, %size, path = %path.display(), "thumbnail file missing");
            Err(AppError::ThumbnailNotFound {
                id: id.clone(),
                size,
            })
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn image_stats(db: &Database) -> Result<ImageStats, AppError> {
    Ok(db.stats().await?)
}

/// Error types within the application, encapsulating storage, database, and lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("image not found: {id}")]
    NotFound { id: ImageId },

    #[error("thumbnail {size} not found for image {id}")]
    ThumbnailNotFound { id: ImageId, size: ThumbnailSize },

    #[error("{0}")]
    InvalidArgument(String),
}

impl From<ThumbnailSizeParseError> for AppError {
    fn from(value: ThumbnailSizeParseError) -> Self {
        AppError::InvalidArgument(value.to_string())
    }
}

impl AppError {
    /// Whether the error means the requested resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::NotFound { .. } | AppError::ThumbnailNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::tests::encoded_image,
        caption::DisabledCaptioner,
        pipeline::{RunOutcome, tests::StubCaptioner},
    };
    use image::{GenericImageView, ImageFormat};
    use std::{sync::Arc, time::Duration};
    use tempfile::TempDir;

    struct Env {
        _tmp_dir: TempDir,
        db: Database,
        storage: Storage,
        pipeline: Pipeline,
    }

    async fn env() -> Env {
        let tmp_dir = TempDir::new().unwrap();
        let storage = Storage::new(tmp_dir.path().to_path_buf());
        let db = Database::in_memory().await.unwrap();
        let pipeline = Pipeline::new(
            db.clone(),
            storage.clone(),
            Arc::new(StubCaptioner::default()),
        );

        Env {
            _tmp_dir: tmp_dir,
            db,
            storage,
            pipeline,
        }
    }

    async fn wait_terminal(db: &Database, id: &ImageId) -> ImageRecord {
        for _ in 0..200 {
            let record = find_image(db, id).await.unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("image {id} never left processing");
    }

    #[tokio::test]
    async fn test_stage_creates_processing_record() {
        let env = env().await;
        let bytes = encoded_image(10, 10, ImageFormat::Png);

        let job = UploadImageCommand::new(&bytes, "../etc/x.png")
            .stage(&env.storage, &env.db)
            .await
            .unwrap();

        assert_eq!(
            env.storage.root().join(format!("{}_x.png", job.id)),
            job.path
        );
        assert_eq!(bytes, std::fs::read(&job.path).unwrap());

        let record = find_image(&env.db, &job.id).await.unwrap();
        assert_eq!(ImageStatus::Processing, record.status);
        assert_eq!("../etc/x.png", record.filename);
        assert_eq!(None, record.processed_at);
        assert!(record.exif.is_empty());
    }

    #[tokio::test]
    async fn test_execute_processes_in_background() {
        let env = env().await;
        let bytes = encoded_image(800, 600, ImageFormat::Jpeg);

        let id = UploadImageCommand::new(&bytes, "photo.jpg")
            .execute(&env.pipeline, &env.storage, &env.db)
            .await
            .unwrap();

        let record = wait_terminal(&env.db, &id).await;
        assert_eq!(ImageStatus::Processed, record.status);

        let small = read_thumbnail(&env.db, &env.storage, &id, "small")
            .await
            .unwrap();
        let (w, h) = image::load_from_memory(&small).unwrap().dimensions();
        assert!(w <= 128 && h <= 128);

        let stats = image_stats(&env.db).await.unwrap();
        assert_eq!(1, stats.total);
        assert_eq!(1, stats.success);
        assert!(stats.avg_processing_seconds >= 0.0);
    }

    #[tokio::test]
    async fn test_read_thumbnail_errors() {
        let env = env().await;
        let unknown = ImageId::generate();

        // Unknown id wins over an invalid size.
        let err = read_thumbnail(&env.db, &env.storage, &unknown, "large")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));

        let job = UploadImageCommand::new(b"not an image", "a.png")
            .stage(&env.storage, &env.db)
            .await
            .unwrap();

        let err = read_thumbnail(&env.db, &env.storage, &job.id, "large")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let err = read_thumbnail(&env.db, &env.storage, &job.id, "small")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ThumbnailNotFound { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failed_upload_counts_as_failed() {
        let env = env().await;
        let pipeline = Pipeline::new(
            env.db.clone(),
            env.storage.clone(),
            Arc::new(DisabledCaptioner),
        );

        let bad = UploadImageCommand::new(&[7u8; 16], "r.bin")
            .stage(&env.storage, &env.db)
            .await
            .unwrap();
        assert_eq!(RunOutcome::Failed, pipeline.run(bad).await);

        let good = UploadImageCommand::new(&encoded_image(30, 20, ImageFormat::Png), "g.png")
            .stage(&env.storage, &env.db)
            .await
            .unwrap();
        assert_eq!(
            RunOutcome::Processed { captioned: false },
            pipeline.run(good).await
        );

        let stats = image_stats(&env.db).await.unwrap();
        assert_eq!(2, stats.total);
        assert_eq!(1, stats.success);
        assert_eq!(1, stats.failed);
        assert!(stats.success + stats.failed <= stats.total);

        let ids: Vec<String> = list_images(&env.db)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(vec!["r.bin".to_string(), "g.png".to_string()], ids);
    }
}
