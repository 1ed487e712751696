//! Remote image-generation API.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::CollaboratorError;

/// Output dimensions accepted by the generation API.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageSize {
    #[serde(rename = "1024x1024")]
    #[default]
    Square,
    #[serde(rename = "1536x1024")]
    Landscape,
    #[serde(rename = "1024x1536")]
    Portrait,
}

impl ImageSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::Square => "1024x1024",
            ImageSize::Landscape => "1536x1024",
            ImageSize::Portrait => "1024x1536",
        }
    }
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, size: ImageSize) -> Result<Vec<u8>, CollaboratorError>;

    /// Edit `source` following `prompt`, guided by optional reference images.
    async fn edit(
        &self,
        prompt: &str,
        source: Vec<u8>,
        references: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>, CollaboratorError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    size: &'a str,
    response_format: &'a str,
}

#[derive(Debug, Serialize)]
struct EditRequest<'a> {
    prompt: &'a str,
    image: String,
    references: Vec<String>,
    response_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: String,
}

/// JSON-over-HTTP client for the generation service. Requests that exceed the
/// configured timeout are aborted.
#[derive(Debug, Clone)]
pub struct HttpImageGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpImageGenerator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Upstream(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<Vec<u8>, CollaboratorError> {
        let mut request = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CollaboratorError::Upstream(format!("{path}: request timed out"))
            } else {
                CollaboratorError::Upstream(format!("{path}: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Upstream(format!("{path}: {status}: {body}")));
        }

        let body: ImageResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Upstream(format!("{path}: malformed response: {e}")))?;
        decode_first_image(body)
    }
}

fn decode_first_image(body: ImageResponse) -> Result<Vec<u8>, CollaboratorError> {
    let first = body
        .data
        .into_iter()
        .next()
        .ok_or_else(|| CollaboratorError::Upstream("response contained no image".to_owned()))?;
    STANDARD
        .decode(first.b64_json)
        .map_err(|e| CollaboratorError::Upstream(format!("invalid base64 image: {e}")))
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    #[instrument(skip_all, fields(size = size.as_str()))]
    async fn generate(&self, prompt: &str, size: ImageSize) -> Result<Vec<u8>, CollaboratorError> {
        let body = GenerateRequest {
            prompt,
            size: size.as_str(),
            response_format: "b64_json",
        };
        let bytes = self.post("images/generations", &body).await?;
        debug!(bytes = bytes.len(), "image generated");
        Ok(bytes)
    }

    #[instrument(skip_all, fields(references = references.len()))]
    async fn edit(
        &self,
        prompt: &str,
        source: Vec<u8>,
        references: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>, CollaboratorError> {
        let body = EditRequest {
            prompt,
            image: STANDARD.encode(source),
            references: references.iter().map(|r| STANDARD.encode(r)).collect(),
            response_format: "b64_json",
        };
        self.post("images/edits", &body).await
    }
}
