use clap::{Parser, Subcommand};
use darkroom::{logging, prelude::*};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "darkroom-cli")]
#[command(about = "Ingest and inspect images in a darkroom store", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: AppConfig,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store an image and process it before exiting.
    Ingest {
        #[arg(help = "Path to image file")]
        path: PathBuf,

        #[arg(short, long, help = "File name to record instead of the path's own")]
        name: Option<String>,
    },
    /// Print every record.
    List,
    /// Print one record.
    Show {
        #[arg(help = "Image id")]
        id: String,
    },
    /// Print processing statistics.
    Stats,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    App(#[from] AppError),

    #[error("failed to open the record store: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to prepare the upload directory: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    darkroom::config::load_dotenv();
    let cli = Cli::parse();
    logging::init(cli.config.log_format, cli.config.verbose);

    let db = cli.config.open_database().await?;

    match cli.command {
        Commands::Ingest { path, name } => {
            let storage = cli.config.open_storage().await?;
            let bytes = tokio::fs::read(&path).await.map_err(|e| CliError::Read {
                path: path.clone(),
                source: e,
            })?;
            let filename = name.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "upload".to_string())
            });

            let pipeline = Pipeline::new(db.clone(), storage.clone(), cli.config.captioner());
            let job = UploadImageCommand::new(&bytes, &filename)
                .stage(&storage, &db)
                .await?;
            let id = job.id.clone();

            let outcome = pipeline.run(job).await;
            tracing::info!(image_id = %id, ?outcome, "ingest finished");

            print_json(&find_image(&db, &id).await?)?;
        }
        Commands::List => {
            print_json(&list_images(&db).await?)?;
        }
        Commands::Show { id } => {
            print_json(&find_image(&db, &ImageId::from(id)).await?)?;
        }
        Commands::Stats => {
            print_json(&image_stats(&db).await?)?;
        }
    }

    Ok(())
}
