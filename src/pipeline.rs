//! # Processing Pipeline
//!
//! Drives one uploaded image from `processing` to a terminal status.
//!
//! A run has two stage groups, executed in order:
//!
//! - **Ingest** (gating): decode, EXIF, metadata, thumbnails, then mark the
//!   record `processed`. A decode failure (or a record-store failure) marks
//!   the record `failed` and ends the run. EXIF problems and a failed
//!   thumbnail size are logged and leave only their own fields unset.
//! - **Caption** (best-effort): only runs after a successful ingest. Its
//!   failure is logged and never touches `status` or `processed_at`.
//!
//! Every stage writes its own subset of fields as soon as it has them, so a
//! concurrent reader may see a record fill in one field at a time.

use crate::{
    artifact::{self, ArtifactError, DecodedImage, ExifMap},
    caption::{CaptionError, Captioner},
    database::{Database, DatabaseError},
    record::{ImageId, ImageStatus, ThumbnailSize, Thumbnails},
    storage::{Storage, StorageError},
};
use chrono::Utc;
use std::{fmt::Display, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// One unit of scheduled work: an upload that is already on disk and has a
/// `processing` record.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineJob {
    pub id: ImageId,
    /// Where the raw upload was stored.
    pub path: PathBuf,
    /// Client-supplied file name, used to name the thumbnails.
    pub filename: String,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Processed { captioned: bool },
    Failed,
}

/// Named steps of a run, for logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Exif,
    Metadata,
    Thumbnail(ThumbnailSize),
    /// Storing the thumbnail paths that were produced.
    Thumbnails,
    Finalize,
    Caption,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Decode => f.write_str("decode"),
            Stage::Exif => f.write_str("exif"),
            Stage::Metadata => f.write_str("metadata"),
            Stage::Thumbnail(size) => write!(f, "thumbnail:{size}"),
            Stage::Thumbnails => f.write_str("thumbnails"),
            Stage::Finalize => f.write_str("finalize"),
            Stage::Caption => f.write_str("caption"),
        }
    }
}

/// The orchestrator. Cheap to clone; clones share the same store and captioner.
#[derive(Clone)]
pub struct Pipeline {
    db: Database,
    storage: Storage,
    captioner: Arc<dyn Captioner>,
}

impl Pipeline {
    pub fn new(db: Database, storage: Storage, captioner: Arc<dyn Captioner>) -> Self {
        Self {
            db,
            storage,
            captioner,
        }
    }

    /// Runs `job` on its own task and returns immediately.
    ///
    /// The handle may be dropped; the run continues regardless and reports
    /// its result only through the record store.
    pub fn schedule(&self, job: PipelineJob) -> JoinHandle<RunOutcome> {
        let pipeline = self.clone();
        let span = info_span!("pipeline", image_id = %job.id);

        tokio::spawn(async move { pipeline.run(job).await }.instrument(span))
    }

    /// Executes every stage for `job` and waits for the outcome.
    pub async fn run(&self, job: PipelineJob) -> RunOutcome {
        info!(image_id = %job.id, path = %job.path.display(), "pipeline run started");

        if let Err(e) = self.ingest(&job).await {
            error!(image_id = %job.id, stage = %e.stage(), error = %e, "ingest failed");
            self.mark_failed(&job.id).await;
            return RunOutcome::Failed;
        }

        let captioned = match self.caption(&job).await {
            Ok(()) => true,
            Err(e) => {
                warn!(image_id = %job.id, stage = %e.stage(), error = %e, "caption skipped");
                false
            }
        };

        info!(image_id = %job.id, captioned, "pipeline run finished");
        RunOutcome::Processed { captioned }
    }

    /// Decode, EXIF, metadata, thumbnails, then `processed`.
    async fn ingest(&self, job: &PipelineJob) -> Result<(), PipelineError> {
        let bytes = self
            .storage
            .read_file(&job.path)
            .await
            .map_err(|e| PipelineError::Storage {
                stage: Stage::Decode,
                source: e,
            })?;

        let (decoded, exif) = tokio::task::spawn_blocking(move || {
            let decoded = artifact::decode(&bytes)?;
            Ok::<_, ArtifactError>((decoded, artifact::read_exif(&bytes)))
        })
        .await
        .map_err(|e| PipelineError::Join {
            stage: Stage::Decode,
            message: e.to_string(),
        })?
        .map_err(|e| PipelineError::Decode {
            id: job.id.clone(),
            source: e,
        })?;

        let exif = match exif {
            Ok(exif) => exif,
            Err(::exif::Error::NotFound(_)) => {
                debug!(image_id = %job.id, "no EXIF data");
                ExifMap::new()
            }
            Err(e) => {
                warn!(image_id = %job.id, stage = %Stage::Exif, error = %e, "unreadable EXIF data");
                ExifMap::new()
            }
        };
        self.db
            .update_exif(&job.id, &exif)
            .await
            .map_err(|e| PipelineError::Database {
                stage: Stage::Exif,
                source: e,
            })?;

        let metadata = decoded.metadata();
        self.db
            .update_metadata(&job.id, &metadata)
            .await
            .map_err(|e| PipelineError::Database {
                stage: Stage::Metadata,
                source: e,
            })?;
        debug!(
            image_id = %job.id,
            width = metadata.width,
            height = metadata.height,
            format = %metadata.format,
            "metadata stored"
        );

        let thumbnails = self.render_thumbnails(job, decoded).await;
        self.db
            .update_thumbnails(&job.id, &thumbnails)
            .await
            .map_err(|e| PipelineError::Database {
                stage: Stage::Thumbnails,
                source: e,
            })?;

        let transitioned = self
            .db
            .mark_processed(&job.id, Utc::now())
            .await
            .map_err(|e| PipelineError::Database {
                stage: Stage::Finalize,
                source: e,
            })?;
        if !transitioned {
            warn!(image_id = %job.id, "record was no longer processing; status left unchanged");
        }

        Ok(())
    }

    /// Renders every thumbnail size. A failed size is logged and left out.
    async fn render_thumbnails(&self, job: &PipelineJob, decoded: DecodedImage) -> Thumbnails {
        let format = decoded.format;
        let image = Arc::new(decoded.image);
        let mut thumbnails = Thumbnails::default();

        for size in ThumbnailSize::ALL {
            let dest = self.storage.derive_thumbnail_path(&job.id, size, &job.filename);
            let image = Arc::clone(&image);
            let target = dest.clone();

            let result = tokio::task::spawn_blocking(move || {
                artifact::write_thumbnail(&image, size, format, &target)
            })
            .await;

            match result {
                Ok(Ok(())) => thumbnails.set(size, dest.to_string_lossy().to_string()),
                Ok(Err(e)) => {
                    warn!(image_id = %job.id, stage = %Stage::Thumbnail(size), error = %e, "thumbnail failed");
                }
                Err(e) => {
                    warn!(image_id = %job.id, stage = %Stage::Thumbnail(size), error = %e, "thumbnail task aborted");
                }
            }
        }

        thumbnails
    }

    /// Re-opens the upload as RGB and stores its caption.
    async fn caption(&self, job: &PipelineJob) -> Result<(), PipelineError> {
        let bytes = self
            .storage
            .read_file(&job.path)
            .await
            .map_err(|e| PipelineError::Storage {
                stage: Stage::Caption,
                source: e,
            })?;

        let image = tokio::task::spawn_blocking(move || artifact::decode_rgb(&bytes))
            .await
            .map_err(|e| PipelineError::Join {
                stage: Stage::Caption,
                message: e.to_string(),
            })?
            .map_err(|e| PipelineError::Artifact {
                stage: Stage::Caption,
                source: e,
            })?;

        let caption = self.captioner.caption(&image).await?;
        debug!(image_id = %job.id, captioner = self.captioner.name(), %caption, "caption generated");

        self.db
            .update_caption(&job.id, &caption)
            .await
            .map_err(|e| PipelineError::Database {
                stage: Stage::Caption,
                source: e,
            })
    }

    async fn mark_failed(&self, id: &ImageId) {
        match self.db.update_status(id, ImageStatus::Failed).await {
            Ok(true) => {}
            Ok(false) => warn!(image_id = %id, "record was no longer processing; not marked failed"),
            Err(e) => error!(image_id = %id, error = %e, "could not mark record failed"),
        }
    }
}

/// Why a stage did not complete.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The upload is not a decodable image. Fatal to the run.
    #[error("image {id} could not be decoded: {source}")]
    Decode {
        id: ImageId,
        #[source]
        source: ArtifactError,
    },

    #[error("{stage} stage failed: {source}")]
    Artifact {
        stage: Stage,
        #[source]
        source: ArtifactError,
    },

    #[error("{stage} stage could not read the upload: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StorageError,
    },

    #[error("{stage} stage could not write the record: {source}")]
    Database {
        stage: Stage,
        #[source]
        source: DatabaseError,
    },

    #[error("captioner failed: {0}")]
    Caption(#[from] CaptionError),

    #[error("{stage} stage task did not complete: {message}")]
    Join { stage: Stage, message: String },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Decode { .. } => Stage::Decode,
            PipelineError::Caption(_) => Stage::Caption,
            PipelineError::Artifact { stage, .. }
            | PipelineError::Storage { stage, .. }
            | PipelineError::Database { stage, .. }
            | PipelineError::Join { stage, .. } => *stage,
        }
    }
}
