//! Storage module to manage uploaded files and their thumbnails.
//!
//! Everything lives flat under a single upload directory. Raw uploads are
//! named `{id}_{filename}` and thumbnails `{id}_{size}_{filename}`.

use crate::record::{ImageId, ThumbnailSize};
use std::{
    error::Error,
    fmt::Display,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Name used for the on-disk file when the client-supplied one is unusable.
const FALLBACK_FILENAME: &str = "upload";

#[derive(Debug, Clone)]
pub struct Storage {
    root_path: PathBuf,
}

impl Storage {
    /// Creates a new `Storage` instance with the specified root path.
    ///
    /// # Arguments
    /// * `root` - Directory where uploads and thumbnails will be stored.
    pub fn new(root: PathBuf) -> Storage {
        Storage { root_path: root }
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    /// Creates the root directory if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root_path).await?;
        Ok(())
    }

    /// Writes the raw bytes of an upload to disk.
    ///
    /// The write completes before this returns, so the file is durable by
    /// the time the caller hands out the identifier.
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier of the image the bytes belong to.
    /// * `filename` - Client-supplied file name. Only its final path
    ///   component is used.
    /// * `bytes` - The raw byte array of the upload.
    ///
    /// # Returns
    /// * `Ok(PathBuf)` - Absolute path of the stored upload.
    /// * `Err(StorageError::Io)` - If directory creation or file writing fails.
    pub async fn create_file(
        &self,
        id: &ImageId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StorageError> {
        self.ensure_root().await?;

        let path = self.derive_upload_path(id, filename);
        tokio::fs::write(&path, bytes).await?;

        Ok(path)
    }

    /// Reads a stored file back.
    ///
    /// # Errors
    /// - `StorageError::FileNotFound` if nothing exists at `path`.
    /// - `StorageError::Io` for any other I/O failure.
    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::FileNotFound {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Path of the raw upload: `{root}/{id}_{filename}`.
    pub fn derive_upload_path(&self, id: &ImageId, filename: &str) -> PathBuf {
        self.root_path
            .join(format!("{}_{}", id, sanitize_filename(filename)))
    }

    /// Path of a thumbnail: `{root}/{id}_{size}_{filename}`.
    pub fn derive_thumbnail_path(
        &self,
        id: &ImageId,
        size: ThumbnailSize,
        filename: &str,
    ) -> PathBuf {
        self.root_path
            .join(format!("{}_{}_{}", id, size, sanitize_filename(filename)))
    }
}

/// Reduces a client-supplied name to a single safe path component.
pub fn sanitize_filename(filename: &str) -> String {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    match name {
        "" | "." | ".." => FALLBACK_FILENAME.to_string(),
        name => name.to_string(),
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// No file at the given path.
    FileNotFound { path: PathBuf },
    /// Filesystem IO error.
    Io(std::io::Error),
}

/// Allows automatic conversion from std::io::Error.
impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Io(value)
    }
}

/// Formats StorageError for display.
impl Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound { path } => {
                write!(f, "File not found: {}", path.display())
            }
            StorageError::Io(inner) => {
                write!(f, "Filesystem error: {}", inner)
            }
        }
    }
}

/// Enables StorageError to be used as a standard error type.
impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StorageError::Io(inner) => Some(inner),
            StorageError::FileNotFound { .. } => None,
        }
    }
}
