//! Image records and the value types stored alongside them.

use crate::artifact::ExifMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier of an uploaded image.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        ImageId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ImageId {
    fn from(value: String) -> Self {
        ImageId(value)
    }
}

impl From<&str> for ImageId {
    fn from(value: &str) -> Self {
        ImageId(value.to_string())
    }
}

impl From<ImageId> for String {
    fn from(value: ImageId) -> Self {
        value.0
    }
}

/// Processing state of an image.
///
/// `Processed` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Processing,
    Processed,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Processing => "processing",
            ImageStatus::Processed => "processed",
            ImageStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ImageStatus::Processing)
    }
}

impl Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown image status: {0}")]
pub struct StatusParseError(String);

impl FromStr for ImageStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ImageStatus::Processing),
            "processed" => Ok(ImageStatus::Processed),
            "failed" => Ok(ImageStatus::Failed),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// The thumbnail variants produced for every decodable image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailSize {
    Small,
    Medium,
}

impl ThumbnailSize {
    pub const ALL: [ThumbnailSize; 2] = [ThumbnailSize::Small, ThumbnailSize::Medium];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailSize::Small => "small",
            ThumbnailSize::Medium => "medium",
        }
    }

    /// The box `(width, height)` a thumbnail of this size must fit in.
    pub fn bound(&self) -> (u32, u32) {
        match self {
            ThumbnailSize::Small => (128, 128),
            ThumbnailSize::Medium => (512, 512),
        }
    }
}

impl Display for ThumbnailSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid thumbnail size '{0}', choose 'small' or 'medium'")]
pub struct ThumbnailSizeParseError(pub String);

impl FromStr for ThumbnailSize {
    type Err = ThumbnailSizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(ThumbnailSize::Small),
            "medium" => Ok(ThumbnailSize::Medium),
            other => Err(ThumbnailSizeParseError(other.to_string())),
        }
    }
}

/// Dimensions, format and byte size of a decoded upload.
///
/// These four values are always written together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size_bytes: u64,
}

/// Paths of the generated thumbnails. Either may be missing when its
/// generation failed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnails {
    pub small: Option<String>,
    pub medium: Option<String>,
}

impl Thumbnails {
    pub fn get(&self, size: ThumbnailSize) -> Option<&str> {
        match size {
            ThumbnailSize::Small => self.small.as_deref(),
            ThumbnailSize::Medium => self.medium.as_deref(),
        }
    }

    pub fn set(&mut self, size: ThumbnailSize, path: String) {
        match size {
            ThumbnailSize::Small => self.small = Some(path),
            ThumbnailSize::Medium => self.medium = Some(path),
        }
    }
}

/// Everything known about one uploaded image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    /// Client-supplied file name, as received.
    pub filename: String,
    pub status: ImageStatus,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Present once the metadata stage has succeeded.
    pub metadata: Option<ImageMetadata>,
    pub exif: ExifMap,
    pub thumbnails: Thumbnails,
    pub caption: Option<String>,
}

/// Aggregate counters over all records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Mean of `processed_at - uploaded_at` over records that have
    /// `processed_at`, or `0.0` if there are none.
    pub avg_processing_seconds: f64,
}
