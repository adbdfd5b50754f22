use crate::core::error::PipelineError;
use crate::core::store::{ProjectStore, ProjectUpdate};
use crate::utils::text::{strip_code_blocks, summarize_thought};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One piece of multimodal request content.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Image { mime_type: String, data: Vec<u8> },
}

impl Part {
    pub fn text(s: impl Into<String>) -> Self {
        Part::Text(s.into())
    }

    pub fn png(data: Vec<u8>) -> Self {
        Part::Image {
            mime_type: "image/png".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub parts: Vec<Part>,
    pub temperature: f32,
    /// Ask for a JSON document instead of free text.
    pub json: bool,
}

impl GenerateRequest {
    pub fn new(temperature: f32) -> Self {
        Self {
            parts: Vec::new(),
            temperature,
            json: false,
        }
    }

    pub fn text(mut self, s: impl Into<String>) -> Self {
        self.parts.push(Part::text(s));
        self
    }

    pub fn image(mut self, data: Vec<u8>) -> Self {
        self.parts.push(Part::png(data));
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Concatenated text parts, mostly useful to mocks.
    pub fn prompt_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                Part::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A streamed fragment of model output. Reasoning fragments have
/// `thought = true` and never reach the final answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub thought: bool,
    pub text: String,
}

impl Chunk {
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            thought: false,
            text: text.into(),
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self {
            thought: true,
            text: text.into(),
        }
    }
}

/// Structured generation service.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Streams the response into `tx` in arrival order. Returns once the
    /// model is done; dropping `tx` ends the stream for the reader.
    async fn stream(&self, request: &GenerateRequest, tx: mpsc::UnboundedSender<Chunk>) -> Result<()>;
}

/// Drives an [`LlmClient`] stream, keeps only final-answer text and, when a
/// project id is given, mirrors a summary of the reasoning into
/// `current_thought` at most once per interval.
pub struct Generator {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn ProjectStore>,
    thought_interval: Duration,
}

impl Generator {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn ProjectStore>, thought_interval: Duration) -> Self {
        Self {
            llm,
            store,
            thought_interval,
        }
    }

    pub async fn text(&self, pid: Option<&str>, request: &GenerateRequest) -> Result<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let produce = self.llm.stream(request, tx);
        let consume = async {
            let mut answer = String::new();
            let mut thoughts = String::new();
            let mut last_update: Option<Instant> = None;

            while let Some(chunk) = rx.recv().await {
                if !chunk.thought {
                    answer.push_str(&chunk.text);
                    continue;
                }
                thoughts.push_str(&chunk.text);
                let Some(pid) = pid else { continue };
                if last_update.is_some_and(|t| t.elapsed() < self.thought_interval) {
                    continue;
                }
                let update = ProjectUpdate::new().thought(Some(summarize_thought(&thoughts)));
                if let Err(e) = self.store.update(pid, update).await {
                    warn!("[{}] Failed to publish thought: {}", pid, e);
                }
                last_update = Some(Instant::now());
            }
            answer
        };

        let (produced, answer) = tokio::join!(produce, consume);

        if let Some(pid) = pid {
            if let Err(e) = self.store.update(pid, ProjectUpdate::new().thought(None)).await {
                warn!("[{}] Failed to clear thought: {}", pid, e);
            }
        }

        if let Err(e) = produced {
            error!("Generation failed: {}", e);
            return Err(e);
        }
        Ok(answer)
    }

    /// Like [`Generator::text`] but parses the answer as `T`. A body that
    /// does not match the expected shape is a validation failure.
    pub async fn json<T: DeserializeOwned>(&self, pid: Option<&str>, request: &GenerateRequest) -> Result<T> {
        let request = request.clone().json();
        let raw = self.text(pid, &request).await?;
        let clean = strip_code_blocks(&raw);
        serde_json::from_str(&clean).map_err(|e| {
            error!("JSON parse error for {}: {}", std::any::type_name::<T>(), clean);
            PipelineError::Validation(format!(
                "failed to parse {}: {}",
                std::any::type_name::<T>().rsplit("::").next().unwrap_or("response"),
                e
            ))
            .into()
        })
    }
}

// --- Gemini wire format ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize)]
pub(crate) struct GeminiContent {
    pub role: String,
    pub parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(untagged)]
pub(crate) enum GeminiPart {
    Text {
        text: String,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: GeminiBlob,
    },
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiBlob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<GeminiThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_config: Option<GeminiImageConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiThinkingConfig {
    pub thinking_budget: i32,
    pub include_thoughts: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiImageConfig {
    pub aspect_ratio: String,
}

#[derive(Deserialize)]
pub(crate) struct GeminiResponse {
    pub candidates: Option<Vec<GeminiCandidate>>,
    pub error: Option<GeminiError>,
}

#[derive(Deserialize)]
pub(crate) struct GeminiCandidate {
    pub content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct GeminiContentResponse {
    #[serde(default)]
    pub parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiPartResponse {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: Option<bool>,
    #[serde(default)]
    pub inline_data: Option<GeminiBlob>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct GeminiError {
    pub message: String,
}

pub(crate) fn to_gemini_contents(parts: &[Part]) -> Vec<GeminiContent> {
    let parts = parts
        .iter()
        .map(|p| match p {
            Part::Text(text) => GeminiPart::Text { text: text.clone() },
            Part::Image { mime_type, data } => GeminiPart::Inline {
                inline_data: GeminiBlob {
                    mime_type: mime_type.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(data),
                },
            },
        })
        .collect();
    vec![GeminiContent {
        role: "user".to_string(),
        parts,
    }]
}

/// Chunks carried by one `data:` line of a streamGenerateContent response.
fn parse_sse_line(line: &str) -> Result<Vec<Chunk>> {
    let Some(json_str) = line.trim_end_matches('\r').strip_prefix("data:") else {
        return Ok(Vec::new());
    };
    let json_str = json_str.trim();
    if json_str.is_empty() || json_str == "[DONE]" {
        return Ok(Vec::new());
    }

    let event: GeminiResponse = serde_json::from_str(json_str)
        .map_err(|e| anyhow!("Failed to parse Gemini event: {}. Body: {}", e, json_str))?;
    if let Some(err) = event.error {
        return Err(PipelineError::external("gemini", err.message).into());
    }

    let mut chunks = Vec::new();
    for candidate in event.candidates.unwrap_or_default().into_iter().take(1) {
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                chunks.push(Chunk {
                    thought: part.thought.unwrap_or(false),
                    text,
                });
            }
        }
    }
    Ok(chunks)
}

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn stream(&self, request: &GenerateRequest, tx: mpsc::UnboundedSender<Chunk>) -> Result<()> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        );

        let body = GeminiRequest {
            contents: to_gemini_contents(&request.parts),
            generation_config: Some(GeminiGenerationConfig {
                temperature: Some(request.temperature),
                response_mime_type: request.json.then(|| "application/json".to_string()),
                thinking_config: Some(GeminiThinkingConfig {
                    thinking_budget: -1,
                    include_thoughts: true,
                }),
                ..Default::default()
            }),
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::external("gemini", e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::external("gemini", format!("{}: {}", status, error_text)).into());
        }

        let mut stream = resp.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(item) = stream.next().await {
            let bytes = item.map_err(|e| PipelineError::external("gemini", e.to_string()))?;
            pending.extend_from_slice(&bytes);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                for chunk in parse_sse_line(line.trim_end_matches('\n'))? {
                    if tx.send(chunk).is_err() {
                        debug!("Generation reader went away");
                        return Ok(());
                    }
                }
            }
        }
        if !pending.is_empty() {
            for chunk in parse_sse_line(&String::from_utf8_lossy(&pending))? {
                let _ = tx.send(chunk);
            }
        }
        Ok(())
    }
}
