use crate::bounding_box::{BoundingBox, DetectionBatch, Prediction};
use crate::camera::CapturedFrame;
use crate::config::BackendConfig;
use crate::readiness::{HealthProbe, HealthStatus};
use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

const DETECT_PATH: &str = "/detect";
const HEALTH_PATH: &str = "/";
const FILE_FIELD: &str = "file";
const FILE_NAME: &str = "webcam.jpg";
const UNKNOWN_ERROR: &str = "Unknown error";

#[derive(Error, Debug)]
pub enum DetectionClientError {
    #[error("Failed to reach detection backend: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("Backend error ({status}): {detail}")]
    Status { status: StatusCode, detail: String },
    #[error("Malformed backend response: {0}")]
    MalformedBody(String),
}

impl DetectionClientError {
    pub fn is_transport(&self) -> bool {
        matches!(self, DetectionClientError::Transport(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DetectionClientError::Transport(_) => "transport",
            DetectionClientError::Status { .. } => "status",
            DetectionClientError::MalformedBody(_) => "malformed_body",
        }
    }
}

#[async_trait]
pub trait Detector: Send + Sync + 'static {
    async fn detect(&self, frame: &CapturedFrame) -> Result<DetectionBatch, DetectionClientError>;
}

/// Everything a session needs from the backend.
pub trait Backend: Detector + HealthProbe {}

impl<T: Detector + HealthProbe> Backend for T {}

#[derive(Deserialize)]
struct DetectResponse {
    predictions: Vec<WirePrediction>,
}

#[derive(Deserialize)]
struct WirePrediction {
    bbox: [f32; 4],
    class: String,
    score: f32,
}

impl From<WirePrediction> for Prediction {
    fn from(wire: WirePrediction) -> Self {
        let [x, y, width, height] = wire.bbox;
        Prediction {
            bbox: BoundingBox::new(x, y, width, height),
            label: wire.class,
            confidence: wire.score.clamp(0.0, 1.0),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

/// Single-shot HTTP wrapper around the detection backend. Never retries; the
/// caller owns the retry policy.
#[derive(Debug, Clone)]
pub struct DetectionClient {
    client: Client,
    base_url: String,
}

impl DetectionClient {
    pub fn new(config: &BackendConfig) -> Result<Self, DetectionClientError> {
        let client = Client::builder()
            .timeout(config.get_request_timeout())
            .build()
            .map_err(DetectionClientError::Transport)?;

        Ok(Self {
            client,
            base_url: config.get_base_url().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[instrument(skip(self, frame), fields(bytes = frame.jpeg.len()))]
    pub async fn detect(
        &self,
        frame: &CapturedFrame,
    ) -> Result<DetectionBatch, DetectionClientError> {
        let part = multipart::Part::bytes(frame.jpeg.to_vec())
            .file_name(FILE_NAME)
            .mime_str("image/jpeg")
            .map_err(DetectionClientError::Transport)?;
        let form = multipart::Form::new().part(FILE_FIELD, part);

        let response = self
            .client
            .post(format!("{}{}", self.base_url, DETECT_PATH))
            .multipart(form)
            .send()
            .await
            .map_err(DetectionClientError::Transport)?;

        let body: DetectResponse = read_json(response).await?;
        tracing::debug!("Received {} predictions", body.predictions.len());

        Ok(body.predictions.into_iter().map(Prediction::from).collect())
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<HealthStatus, DetectionClientError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, HEALTH_PATH))
            .send()
            .await
            .map_err(DetectionClientError::Transport)?;

        tracing::debug!("Backend health status: {}", response.status());
        read_json(response).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, DetectionClientError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(DetectionClientError::Transport)?;

    if !status.is_success() {
        return Err(DetectionClientError::Status {
            status,
            detail: error_detail(status, &body),
        });
    }

    serde_json::from_slice(&body).map_err(|e| DetectionClientError::MalformedBody(e.to_string()))
}

/// Unparseable or missing bodies degrade to a generic message.
fn error_detail(status: StatusCode, body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: Some(serde_json::Value::String(detail)),
        }) => detail,
        Ok(ErrorBody {
            detail: Some(other),
        }) if !other.is_null() => other.to_string(),
        Ok(_) => status
            .canonical_reason()
            .unwrap_or(UNKNOWN_ERROR)
            .to_string(),
        Err(_) => UNKNOWN_ERROR.to_string(),
    }
}

#[async_trait]
impl Detector for DetectionClient {
    async fn detect(&self, frame: &CapturedFrame) -> Result<DetectionBatch, DetectionClientError> {
        DetectionClient::detect(self, frame).await
    }
}

#[async_trait]
impl HealthProbe for DetectionClient {
    async fn check(&self) -> Result<HealthStatus, DetectionClientError> {
        self.health().await
    }
}
