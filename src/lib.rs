//! # Darkroom
//!
//! Accepts uploaded images, stores them, and derives metadata, EXIF tags,
//! thumbnails and a caption in the background. Results are read back from a
//! SQLite record store while processing is still under way.
//!
//! ## Lifecycle
//!
//! Every upload gets a record in `processing`. The [`pipeline::Pipeline`]
//! then moves it to `processed` or `failed`, both terminal:
//!
//! - decoding, metadata and thumbnails decide the final status;
//! - EXIF parsing and individual thumbnail sizes may fail without affecting it;
//! - captioning runs last and never changes the status.
//!
//! ## Usage
//!
//! ```no_run
//! use darkroom::prelude::*;
//! use std::{path::PathBuf, sync::Arc};
//!
//! async fn accept(bytes: &[u8]) -> Result<ImageId, AppError> {
//!     let db = Database::connect("sqlite:./darkroom.db").await.unwrap();
//!     let storage = Storage::new(PathBuf::from("./uploads"));
//!     let pipeline = Pipeline::new(db.clone(), storage.clone(), Arc::new(DisabledCaptioner));
//!
//!     UploadImageCommand::new(bytes, "photo.jpg")
//!         .execute(&pipeline, &storage, &db)
//!         .await
//! }
//! ```

pub mod app;
pub mod artifact;
pub mod caption;
pub mod config;
pub mod database;
mod dialect;
pub mod logging;
pub mod pipeline;
pub mod record;
pub mod storage;

pub mod prelude {
    pub use crate::app::{
        AppError, UploadImageCommand, find_image, image_stats, list_images, read_thumbnail,
    };
    pub use crate::caption::{Captioner, DisabledCaptioner, HttpCaptioner};
    pub use crate::config::{AppConfig, LogFormat};
    pub use crate::database::{Database, DatabaseError};
    pub use crate::pipeline::{Pipeline, PipelineJob, RunOutcome};
    pub use crate::record::{
        ImageId, ImageMetadata, ImageRecord, ImageStats, ImageStatus, ThumbnailSize, Thumbnails,
    };
    pub use crate::storage::{Storage, StorageError};
}
