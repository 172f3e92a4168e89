use crate::{AppState, images::{ApiError, Envelope}};
use axum::{Json, extract::State};
use darkroom::prelude::*;
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct StatsResponse {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Mean seconds from upload to `processed`.
    pub avg_time: f64,
}

impl From<ImageStats> for StatsResponse {
    fn from(value: ImageStats) -> Self {
        Self {
            total: value.total,
            success: value.success,
            failed: value.failed,
            avg_time: value.avg_processing_seconds,
        }
    }
}

pub async fn get_stats(
    State(app): State<AppState>,
) -> Result<Json<Envelope<StatsResponse>>, ApiError> {
    let stats = image_stats(&app.db).await?;

    Ok(Json(Envelope::success(stats.into())))
}
