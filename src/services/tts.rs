use crate::core::error::PipelineError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Speech synthesis service. Returns MP3 bytes. `language` is a BCP-47
/// code, see [`normalize_language`].
#[async_trait]
pub trait SpeechClient: Send + Sync {
    async fn synthesize(&self, text: &str, voice_style: &str, language: &str, voice: &str) -> Result<Vec<u8>>;
}

/// Maps loose language names the planner emits to a BCP-47 code.
pub fn normalize_language(lang: &str) -> String {
    match lang.trim().to_lowercase().as_str() {
        "english" | "en" | "" => "en-US".to_string(),
        _ => lang.trim().to_string(),
    }
}

pub struct GoogleTtsClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl GoogleTtsClient {
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
struct SynthesisInput {
    text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    prompt: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection {
    language_code: String,
    name: String,
    model_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest {
    input: SynthesisInput,
    voice: VoiceSelection,
    audio_config: AudioConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: Option<String>,
}

#[async_trait]
impl SpeechClient for GoogleTtsClient {
    async fn synthesize(&self, text: &str, voice_style: &str, language: &str, voice: &str) -> Result<Vec<u8>> {
        let url = format!("{}/text:synthesize?key={}", self.base_url, self.api_key);
        let body = SynthesizeRequest {
            input: SynthesisInput {
                text: text.to_string(),
                prompt: voice_style.to_string(),
            },
            voice: VoiceSelection {
                language_code: language.to_string(),
                name: voice.to_string(),
                model_name: self.model.clone(),
            },
            audio_config: AudioConfig {
                audio_encoding: "MP3".to_string(),
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::external("tts", e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::external("tts", format!("{}: {}", status, error_text)).into());
        }

        let result: SynthesizeResponse = resp.json().await?;
        let content = result
            .audio_content
            .ok_or_else(|| anyhow!("TTS response carried no audio"))?;
        base64::engine::general_purpose::STANDARD
            .decode(content.as_bytes())
            .map_err(|e| anyhow!("Invalid audio payload: {}", e))
    }
}
