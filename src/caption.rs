//! Caption generation.
//!
//! The model is never run in-process. A [`Captioner`] hands the image to
//! something that can describe it and returns the text.

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use std::{io::Cursor, time::Duration};
use thiserror::Error;

/// Turns an image into a short free-text description.
///
/// Uses `async_trait` so the pipeline can hold an `Arc<dyn Captioner>`.
#[async_trait]
pub trait Captioner: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Describes `image`, which is always 8-bit RGB.
    async fn caption(&self, image: &DynamicImage) -> Result<String, CaptionError>;
}

/// Captioner used when no endpoint is configured. Every call fails.
#[derive(Debug, Default, Clone)]
pub struct DisabledCaptioner;

#[async_trait]
impl Captioner for DisabledCaptioner {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn caption(&self, _image: &DynamicImage) -> Result<String, CaptionError> {
        Err(CaptionError::Disabled)
    }
}

/// Posts the image as JPEG to an image-to-text inference endpoint.
///
/// Accepts the response shapes `[{"generated_text": "..."}]`,
/// `{"generated_text": "..."}` and `{"caption": "..."}`.
pub struct HttpCaptioner {
    endpoint: String,
    token: Option<String>,
    timeout: Option<Duration>,
    client: reqwest::Client,
}

impl HttpCaptioner {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            token: None,
            timeout: None,
            client: reqwest::Client::new(),
        }
    }

    /// Sends `token` as a bearer token with every request.
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Deserialize)]
struct GeneratedText {
    generated_text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaptionResponse {
    Batch(Vec<GeneratedText>),
    Generated(GeneratedText),
    Caption { caption: String },
}

impl CaptionResponse {
    fn into_text(self) -> Option<String> {
        match self {
            CaptionResponse::Batch(items) => items.into_iter().next().map(|g| g.generated_text),
            CaptionResponse::Generated(g) => Some(g.generated_text),
            CaptionResponse::Caption { caption } => Some(caption),
        }
    }
}

#[async_trait]
impl Captioner for HttpCaptioner {
    fn name(&self) -> &str {
        "http"
    }

    async fn caption(&self, image: &DynamicImage) -> Result<String, CaptionError> {
        let mut body = Cursor::new(Vec::new());
        image
            .write_to(&mut body, ImageFormat::Jpeg)
            .map_err(CaptionError::Encode)?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body.into_inner());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CaptionError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: CaptionResponse = resp.json().await?;
        parse_caption(parsed.into_text())
    }
}

fn parse_caption(text: Option<String>) -> Result<String, CaptionError> {
    let text = text.map(|t| t.trim().to_string()).unwrap_or_default();
    if text.is_empty() {
        return Err(CaptionError::Empty);
    }
    Ok(text)
}

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("captioning is disabled")]
    Disabled,

    #[error("failed to encode image for captioning: {0}")]
    Encode(#[source] image::ImageError),

    #[error("caption request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("caption endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("captioner returned an empty caption")]
    Empty,

    /// Failure reported by a custom captioner.
    #[error("{0}")]
    Other(String),
}
