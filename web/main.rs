mod images;
mod stats;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::get,
};
use clap::Parser;
use darkroom::{logging, prelude::*};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

#[derive(Parser)]
#[command(name = "darkroom-web")]
#[command(about = "HTTP API for uploading and inspecting processed images", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: AppConfig,

    /// Address the HTTP server listens on.
    #[arg(long, env = "DARKROOM_BIND", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub storage: Arc<Storage>,
    pub pipeline: Arc<Pipeline>,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let api = Router::new()
        .route("/images", get(images::get_images).post(images::post_image))
        .route("/images/{id}", get(images::get_image))
        .route("/images/{id}/thumbnails/{size}", get(images::get_thumbnail))
        .route("/stats", get(stats::get_stats));

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    darkroom::config::load_dotenv();
    let cli = Cli::parse();
    logging::init(cli.config.log_format, cli.config.verbose);

    let db = cli
        .config
        .open_database()
        .await
        .expect("failed to open the record store");
    let storage = cli
        .config
        .open_storage()
        .await
        .expect("failed to create the upload directory");
    let captioner = cli.config.captioner();
    info!(captioner = captioner.name(), upload_dir = %storage.root().display(), "starting");

    let pipeline = Pipeline::new(db.clone(), storage.clone(), captioner);
    let state = AppState {
        db: Arc::new(db),
        storage: Arc::new(storage),
        pipeline: Arc::new(pipeline),
    };

    let app = router(state, cli.config.max_upload_bytes());

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .expect("failed to bind the listen address");
    info!(addr = %cli.bind, "listening");
    axum::serve(listener, app).await.expect("server error");
}
