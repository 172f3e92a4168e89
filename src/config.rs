//! Runtime configuration shared by the binaries.
//!
//! [`AppConfig`] is flattened into each binary's clap parser. Every field
//! can also come from a `DARKROOM_*` environment variable, and `.env` files
//! are loaded with `dotenvy` before parsing.

use crate::{
    caption::{Captioner, DisabledCaptioner, HttpCaptioner},
    database::Database,
    storage::{Storage, StorageError},
};
use clap::{Args, ValueEnum};
use std::{path::PathBuf, sync::Arc, time::Duration};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Args)]
pub struct AppConfig {
    /// Directory holding raw uploads and thumbnails.
    #[arg(long, env = "DARKROOM_UPLOAD_DIR", default_value = "./uploads")]
    pub upload_dir: PathBuf,

    /// SQLite connection string for the record store.
    #[arg(long, env = "DARKROOM_DATABASE_URL", default_value = "sqlite:./darkroom.db")]
    pub database_url: String,

    /// Image-to-text inference endpoint. Captioning is disabled when unset.
    #[arg(long, env = "DARKROOM_CAPTION_URL")]
    pub caption_url: Option<String>,

    /// Bearer token sent to the caption endpoint.
    #[arg(long, env = "DARKROOM_CAPTION_TOKEN", hide_env_values = true)]
    pub caption_token: Option<String>,

    /// Seconds to wait for a caption before giving up. No limit when unset.
    #[arg(long, env = "DARKROOM_CAPTION_TIMEOUT_SECS")]
    pub caption_timeout_secs: Option<u64>,

    /// Largest accepted upload body, in megabytes.
    #[arg(long, env = "DARKROOM_MAX_UPLOAD_MB", default_value_t = 50)]
    pub max_upload_mb: usize,

    /// Log output format.
    #[arg(long, env = "DARKROOM_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl AppConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn storage(&self) -> Storage {
        Storage::new(self.upload_dir.clone())
    }

    /// Opens the storage root, creating it if needed.
    pub async fn open_storage(&self) -> Result<Storage, StorageError> {
        let storage = self.storage();
        storage.ensure_root().await?;
        Ok(storage)
    }

    pub async fn open_database(&self) -> Result<Database, sqlx::Error> {
        Database::connect(&self.database_url).await
    }

    /// The configured captioner, or one that always fails when no endpoint is set.
    pub fn captioner(&self) -> Arc<dyn Captioner> {
        let Some(url) = &self.caption_url else {
            return Arc::new(DisabledCaptioner);
        };

        let mut captioner = HttpCaptioner::new(url);
        if let Some(token) = &self.caption_token {
            captioner = captioner.with_token(token);
        }
        if let Some(secs) = self.caption_timeout_secs {
            captioner = captioner.with_timeout(Duration::from_secs(secs));
        }
        Arc::new(captioner)
    }
}

/// Loads `.env` from the working directory if one exists.
///
/// Logging is not set up yet at this point, so a malformed file is reported
/// on stderr.
pub fn load_dotenv() {
    if let Some(warning) = dotenv_warning(dotenvy::dotenv()) {
        eprintln!("{warning}");
    }
}

/// A missing file is the normal case and yields no warning.
fn dotenv_warning<T>(result: Result<T, dotenvy::Error>) -> Option<String> {
    match result {
        Ok(_) => None,
        Err(e) if e.not_found() => None,
        Err(e) => Some(format!("ignoring .env file: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: AppConfig,
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = TestCli::try_parse_from([
            "darkroom",
            "--upload-dir",
            "/tmp/up",
            "--max-upload-mb",
            "2",
            "--log-format",
            "json",
            "--caption-url",
            "http://localhost:8080/caption",
        ])
        .unwrap();

        assert_eq!(PathBuf::from("/tmp/up"), cli.config.upload_dir);
        assert_eq!(2 * 1024 * 1024, cli.config.max_upload_bytes());
        assert_eq!(LogFormat::Json, cli.config.log_format);
        assert_eq!("http", cli.config.captioner().name());
    }

    #[test]
    fn test_captioner_disabled_without_url() {
        let cli = TestCli::try_parse_from(["darkroom", "--caption-token", "t"]).unwrap();
        assert_eq!(None, cli.config.caption_url);
        assert_eq!("disabled", cli.config.captioner().name());
    }

    #[test]
    fn test_dotenv_warning() {
        let tmp_dir = tempfile::TempDir::new().unwrap();

        let missing = tmp_dir.path().join("absent.env");
        assert_eq!(None, dotenv_warning(dotenvy::from_path(&missing)));

        let malformed = tmp_dir.path().join("broken.env");
        std::fs::write(&malformed, "DARKROOM_BROKEN LINE\n").unwrap();
        let warning = dotenv_warning(dotenvy::from_path(&malformed)).unwrap();
        assert!(warning.starts_with("ignoring .env file"));
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        assert!(TestCli::try_parse_from(["darkroom", "--log-format", "xml"]).is_err());
    }
}
