use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_storage")]
    pub storage_folder: String,

    #[serde(default = "default_projects")]
    pub projects_folder: String,

    #[serde(default = "default_temp")]
    pub temp_folder: String,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default = "default_thought_interval")]
    pub thought_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_tts_base_url")]
    pub tts_base_url: String,
    #[serde(default = "default_thinking_model")]
    pub thinking_model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_video_model")]
    pub video_model: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_voice_name")]
    pub voice_name: String,
}

/// Pool widths per resource class. Video is narrow because of the external
/// concurrency quota.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_asset_workers")]
    pub assets: usize,
    #[serde(default = "default_video_workers")]
    pub video: usize,
    #[serde(default = "default_speech_workers")]
    pub speech: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first for generic network tasks.
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: u64,
    /// Inline attempts for image/video generation.
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde(default = "default_attempt_delay")]
    pub attempt_delay_seconds: u64,
    #[serde(default = "default_video_attempt_delay")]
    pub video_attempt_delay_seconds: u64,
    #[serde(default = "default_attempts")]
    pub download_attempts: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// No deadline when unset.
    #[serde(default)]
    pub poll_timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MediaConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
}

fn default_storage() -> String {
    "output/storage".to_string()
}
fn default_projects() -> String {
    "output/projects".to_string()
}
fn default_temp() -> String {
    "output/temp".to_string()
}
fn default_thought_interval() -> u64 {
    500
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_tts_base_url() -> String {
    "https://texttospeech.googleapis.com/v1beta1".to_string()
}
fn default_thinking_model() -> String {
    "gemini-2.5-flash-preview-09-2025".to_string()
}
fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}
fn default_video_model() -> String {
    "veo-3.1-generate-preview".to_string()
}
fn default_tts_model() -> String {
    "gemini-2.5-pro-tts".to_string()
}
fn default_voice_name() -> String {
    "Algieba".to_string()
}
fn default_asset_workers() -> usize {
    8
}
fn default_video_workers() -> usize {
    4
}
fn default_speech_workers() -> usize {
    16
}
fn default_retries() -> usize {
    2
}
fn default_base_delay() -> u64 {
    5
}
fn default_attempts() -> usize {
    3
}
fn default_attempt_delay() -> u64 {
    2
}
fn default_video_attempt_delay() -> u64 {
    5
}
fn default_poll_interval() -> u64 {
    5
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_ffprobe() -> String {
    "ffprobe".to_string()
}
fn default_frame_rate() -> u32 {
    24
}
fn default_pixel_format() -> String {
    "yuv420p".to_string()
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            tts_base_url: default_tts_base_url(),
            thinking_model: default_thinking_model(),
            image_model: default_image_model(),
            video_model: default_video_model(),
            tts_model: default_tts_model(),
            voice_name: default_voice_name(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            assets: default_asset_workers(),
            video: default_video_workers(),
            speech: default_speech_workers(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            base_delay_seconds: default_base_delay(),
            attempts: default_attempts(),
            attempt_delay_seconds: default_attempt_delay(),
            video_attempt_delay_seconds: default_video_attempt_delay(),
            download_attempts: default_attempts(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            poll_timeout_seconds: None,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            frame_rate: default_frame_rate(),
            pixel_format: default_pixel_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_folder: default_storage(),
            projects_folder: default_projects(),
            temp_folder: default_temp(),
            generation: GenerationConfig::default(),
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
            video: VideoConfig::default(),
            media: MediaConfig::default(),
            thought_interval_ms: default_thought_interval(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_seconds)
    }

    pub fn attempt_delay(&self) -> Duration {
        Duration::from_secs(self.attempt_delay_seconds)
    }

    pub fn video_attempt_delay(&self) -> Duration {
        Duration::from_secs(self.video_attempt_delay_seconds)
    }
}

impl VideoConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_seconds.map(Duration::from_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_yaml_ng::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            log::warn!("{} not found, using defaults", path.display());
            Config::default()
        };

        if config.generation.api_key.is_empty() {
            if let Ok(key) = std::env::var("GEMINI_API_KEY") {
                config.generation.api_key = key;
            }
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.storage_folder)?;
        fs::create_dir_all(&self.projects_folder)?;
        fs::create_dir_all(&self.temp_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
generation:
  api_key: "abc"
workers:
  video: 2
video:
  poll_timeout_seconds: 600
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.generation.api_key, "abc");
        assert_eq!(config.generation.voice_name, "Algieba");
        assert_eq!(config.workers.video, 2);
        assert_eq!(config.workers.assets, 8);
        assert_eq!(config.workers.speech, 16);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.video.poll_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.media.frame_rate, 24);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.yml")).unwrap();
        assert_eq!(config.storage_folder, "output/storage");
        assert!(config.video.poll_timeout().is_none());
    }

    #[test]
    fn test_save_and_reload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        let mut config = Config::default();
        config.workers.assets = 3;
        config.generation.api_key = "k".to_string();
        config.save(&path)?;

        let loaded = Config::load_from(&path)?;
        assert_eq!(loaded.workers.assets, 3);
        assert_eq!(loaded.generation.api_key, "k");
        Ok(())
    }
}
