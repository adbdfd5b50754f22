use crate::core::error::PipelineError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub prompt: String,
    pub start_image: Vec<u8>,
    /// Closing frame for interpolated shots.
    pub end_image: Option<Vec<u8>>,
    pub duration_seconds: u32,
    pub aspect_ratio: String,
}

/// Opaque handle of a long-running generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoHandle(pub String);

#[derive(Debug)]
pub enum PollStatus {
    Pending,
    Done(Vec<u8>),
}

/// Video generation service.
#[async_trait]
pub trait VideoClient: Send + Sync {
    async fn submit(&self, request: &VideoRequest) -> Result<VideoHandle>;
    async fn poll(&self, handle: &VideoHandle) -> Result<PollStatus>;
}

pub struct VeoClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl VeoClient {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VeoImage {
    bytes_base64_encoded: String,
    mime_type: String,
}

impl VeoImage {
    fn png(data: &[u8]) -> Self {
        Self {
            bytes_base64_encoded: base64::engine::general_purpose::STANDARD.encode(data),
            mime_type: "image/png".to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VeoInstance {
    prompt: String,
    image: VeoImage,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_frame: Option<VeoImage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VeoParameters {
    duration_seconds: u32,
    aspect_ratio: String,
}

#[derive(Serialize)]
struct VeoRequest {
    instances: Vec<VeoInstance>,
    parameters: VeoParameters,
}

#[derive(Deserialize)]
struct VeoOperation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    done: bool,
    response: Option<VeoOperationResponse>,
    error: Option<VeoError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VeoOperationResponse {
    generate_video_response: Option<VeoGenerated>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VeoGenerated {
    #[serde(default)]
    generated_samples: Vec<VeoSample>,
}

#[derive(Deserialize)]
struct VeoSample {
    video: VeoVideo,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VeoVideo {
    uri: Option<String>,
    bytes_base64_encoded: Option<String>,
}

#[derive(Deserialize, Debug)]
struct VeoError {
    message: String,
}

/// Where the finished video lives once an operation reports `done`.
#[derive(Debug, PartialEq)]
enum VideoLocation {
    Uri(String),
    Inline(Vec<u8>),
}

fn finished_video(op: VeoOperation) -> Result<Option<VideoLocation>> {
    if let Some(err) = op.error {
        return Err(PipelineError::external("veo", err.message).into());
    }
    if !op.done {
        return Ok(None);
    }
    let sample = op
        .response
        .and_then(|r| r.generate_video_response)
        .and_then(|g| g.generated_samples.into_iter().next())
        .ok_or_else(|| PipelineError::external("veo", "operation finished without a video"))?;

    if let Some(data) = sample.video.bytes_base64_encoded {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|e| anyhow!("Invalid video payload: {}", e))?;
        return Ok(Some(VideoLocation::Inline(bytes)));
    }
    match sample.video.uri {
        Some(uri) => Ok(Some(VideoLocation::Uri(uri))),
        None => Err(PipelineError::external("veo", "video sample has neither uri nor bytes").into()),
    }
}

impl VeoClient {
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let error_text = resp.text().await.unwrap_or_default();
        Err(PipelineError::external("veo", format!("{}: {}", status, error_text)).into())
    }
}

#[async_trait]
impl VideoClient for VeoClient {
    async fn submit(&self, request: &VideoRequest) -> Result<VideoHandle> {
        let url = format!(
            "{}/models/{}:predictLongRunning?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = VeoRequest {
            instances: vec![VeoInstance {
                prompt: request.prompt.clone(),
                image: VeoImage::png(&request.start_image),
                last_frame: request.end_image.as_deref().map(VeoImage::png),
            }],
            parameters: VeoParameters {
                duration_seconds: request.duration_seconds,
                aspect_ratio: request.aspect_ratio.clone(),
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::external("veo", e.to_string()))?;
        let op: VeoOperation = Self::check(resp).await?.json().await?;
        if let Some(err) = op.error {
            return Err(PipelineError::external("veo", err.message).into());
        }
        if op.name.is_empty() {
            return Err(anyhow!("Veo returned an operation without a name"));
        }
        Ok(VideoHandle(op.name))
    }

    async fn poll(&self, handle: &VideoHandle) -> Result<PollStatus> {
        let url = format!("{}/{}?key={}", self.base_url, handle.0, self.api_key);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::external("veo", e.to_string()))?;
        let op: VeoOperation = Self::check(resp).await?.json().await?;

        match finished_video(op)? {
            None => Ok(PollStatus::Pending),
            Some(VideoLocation::Inline(bytes)) => Ok(PollStatus::Done(bytes)),
            Some(VideoLocation::Uri(uri)) => {
                let resp = self
                    .client
                    .get(&uri)
                    .header("x-goog-api-key", &self.api_key)
                    .send()
                    .await
                    .map_err(|e| PipelineError::external("veo", e.to_string()))?;
                let bytes = Self::check(resp).await?.bytes().await?;
                Ok(PollStatus::Done(bytes.to_vec()))
            }
        }
    }
}
