use crate::AppState;
use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::IntoResponse,
};
use bytes::BytesMut;
use darkroom::{artifact::ExifMap, prelude::*};
use futures::TryStreamExt;
use serde::Serialize;
use tracing::error;

/// Body shape shared by every JSON endpoint.
#[derive(Serialize, Debug)]
pub struct Envelope<T> {
    pub status: &'static str,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success",
            data: Some(data),
            error: None,
        }
    }
}

impl Envelope<()> {
    pub fn error(message: String) -> Self {
        Self {
            status: "error",
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct UploadResponse {
    pub image_id: ImageId,
    pub original_name: String,
}

#[derive(Serialize, Debug)]
pub struct MetadataResponse {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub size_bytes: Option<u64>,
}

#[derive(Serialize, Debug)]
pub struct ImageResponse {
    pub image_id: ImageId,
    pub original_name: String,
    pub status: ImageStatus,
    pub uploaded_at: String,
    pub processed_at: Option<String>,
    pub metadata: MetadataResponse,
    pub thumbnails: Thumbnails,
    pub caption: Option<String>,
    pub exif: ExifMap,
}

impl From<ImageRecord> for ImageResponse {
    fn from(value: ImageRecord) -> Self {
        let metadata = match value.metadata {
            Some(m) => MetadataResponse {
                width: Some(m.width),
                height: Some(m.height),
                format: Some(m.format),
                size_bytes: Some(m.size_bytes),
            },
            None => MetadataResponse {
                width: None,
                height: None,
                format: None,
                size_bytes: None,
            },
        };

        Self {
            image_id: value.id,
            original_name: value.filename,
            status: value.status,
            uploaded_at: value.uploaded_at.to_rfc3339(),
            processed_at: value.processed_at.map(|t| t.to_rfc3339()),
            metadata,
            thumbnails: value.thumbnails,
            caption: value.caption,
            exif: value.exif,
        }
    }
}

pub async fn post_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Envelope<UploadResponse>>, ApiError> {
    let mut upload = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        let mut data = BytesMut::new();
        let mut stream = field.into_stream();
        while let Some(chunk) = stream.try_next().await? {
            data.extend_from_slice(&chunk);
        }
        upload = Some((filename, data.freeze()));
    }

    let (filename, bytes) = match upload {
        Some(u) => u,
        None => return Err(ApiError::BadRequest("missing file".to_string())),
    };

    let image_id = UploadImageCommand::new(&bytes, &filename)
        .execute(&state.pipeline, &state.storage, &state.db)
        .await?;

    Ok(Json(Envelope::success(UploadResponse {
        image_id,
        original_name: filename,
    })))
}

pub async fn get_images(
    State(app): State<AppState>,
) -> Result<Json<Envelope<Vec<ImageResponse>>>, ApiError> {
    let records = list_images(&app.db).await?;

    Ok(Json(Envelope::success(
        records.into_iter().map(ImageResponse::from).collect(),
    )))
}

pub async fn get_image(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<ImageResponse>>, ApiError> {
    let record = find_image(&app.db, &ImageId::from(id)).await?;

    Ok(Json(Envelope::success(record.into())))
}

pub async fn get_thumbnail(
    State(app): State<AppState>,
    Path((id, size)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = read_thumbnail(&app.db, &app.storage, &ImageId::from(id), &size).await?;

    let content_type = infer::get(&bytes)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream");

    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

pub enum ApiError {
    App(AppError),

    BadRequest(String),
}

impl From<AppError> for ApiError {
    fn from(value: AppError) -> Self {
        ApiError::App(value)
    }
}

impl From<MultipartError> for ApiError {
    fn from(value: MultipartError) -> Self {
        ApiError::BadRequest(value.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::App(app_error) if app_error.is_not_found() => {
                (StatusCode::NOT_FOUND, app_error.to_string())
            }
            ApiError::App(AppError::InvalidArgument(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::App(app_error) => {
                error!(error = %app_error, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, app_error.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        (status, Json(Envelope::error(message))).into_response()
    }
}
