use crate::core::error::PipelineError;
use crate::services::llm::{
    to_gemini_contents, GeminiGenerationConfig, GeminiImageConfig, GeminiRequest, GeminiResponse, Part,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;

/// Image generation service: prompt text plus optional reference images
/// in, one encoded image out.
#[async_trait]
pub trait ImageClient: Send + Sync {
    async fn generate(&self, parts: &[Part], aspect_ratio: &str) -> Result<Vec<u8>>;
}

pub struct GeminiImageClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiImageClient {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

/// First inline image in a generateContent response.
fn extract_image(result: GeminiResponse) -> Result<Vec<u8>> {
    if let Some(err) = result.error {
        return Err(PipelineError::external("imagen", err.message).into());
    }
    let candidate = result
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| anyhow!("Image response had no candidates"))?;

    let reason = candidate.finish_reason.clone().unwrap_or_else(|| "UNKNOWN".to_string());
    let blob = candidate
        .content
        .map(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .find_map(|p| p.inline_data)
        .ok_or_else(|| anyhow!("No image data. Finish reason: {}", reason))?;

    base64::engine::general_purpose::STANDARD
        .decode(blob.data.as_bytes())
        .map_err(|e| anyhow!("Invalid image payload: {}", e))
}

#[async_trait]
impl ImageClient for GeminiImageClient {
    async fn generate(&self, parts: &[Part], aspect_ratio: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = GeminiRequest {
            contents: to_gemini_contents(parts),
            generation_config: Some(GeminiGenerationConfig {
                response_modalities: Some(vec!["IMAGE".to_string()]),
                image_config: Some(GeminiImageConfig {
                    aspect_ratio: aspect_ratio.to_string(),
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
            .map_err(|e| PipelineError::external("imagen", e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::external("imagen", format!("{}: {}", status, error_text)).into());
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| anyhow!("Failed to parse image response: {}", e))?;
        extract_image(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns a tiny valid PNG for every call and records the prompts and
    /// how many images were attached. Prompts containing `fail_on` error,
    /// as do the first `fail_first` calls.
    pub(crate) struct MockImages {
        pub calls: Mutex<Vec<(String, usize, String)>>,
        pub fail_on: Option<String>,
        pub fail_first: usize,
    }

    impl MockImages {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: None,
                fail_first: 0,
            }
        }

        pub fn failing_on(marker: &str) -> Self {
            Self {
                fail_on: Some(marker.to_string()),
                ..Self::new()
            }
        }

        /// Down for the first `n` calls, then healthy.
        pub fn flaky(n: usize) -> Self {
            Self {
                fail_first: n,
                ..Self::new()
            }
        }
    }

    pub(crate) fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 20, 30]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[async_trait]
    impl ImageClient for MockImages {
        async fn generate(&self, parts: &[Part], aspect_ratio: &str) -> Result<Vec<u8>> {
            let text = parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text(t) => Some(t.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            let images = parts.iter().filter(|p| matches!(p, Part::Image { .. })).count();
            let seen = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((text.clone(), images, aspect_ratio.to_string()));
                calls.len()
            };
            if seen <= self.fail_first {
                return Err(PipelineError::external("imagen", "service unavailable").into());
            }
            if let Some(marker) = &self.fail_on {
                if text.contains(marker.as_str()) {
                    return Err(PipelineError::external("imagen", "quota exceeded").into());
                }
            }
            Ok(tiny_png())
        }
    }

    #[test]
    fn test_extract_image_decodes_inline_data() {
        let json = r#"{"candidates":[{"content":{"parts":[{"text":"here"},{"inlineData":{"mimeType":"image/png","data":"AQID"}}]},"finishReason":"STOP"}]}"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(extract_image(result).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_extract_image_reports_finish_reason() {
        let json = r#"{"candidates":[{"content":{"parts":[{"text":"I can't"}]},"finishReason":"IMAGE_SAFETY"}]}"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let err = extract_image(result).unwrap_err();
        assert!(err.to_string().contains("IMAGE_SAFETY"));
    }
}
