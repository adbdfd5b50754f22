pub mod anchors;
pub mod assembly;
pub mod assets;
pub mod critique;
pub mod editing;
pub mod imagen;
pub mod llm;
pub mod planning;
pub mod production;
pub mod prompts;
pub mod tts;
pub mod video;
pub mod workflow;

use crate::core::config::Config;
use crate::core::io::{NativeStorage, Storage};
use crate::core::models::short_id;
use crate::core::store::{log_project, JsonProjectStore, ProjectStore};
use crate::services::imagen::{GeminiImageClient, ImageClient};
use crate::services::llm::{GeminiClient, Generator, LlmClient};
use crate::services::tts::{GoogleTtsClient, SpeechClient};
use crate::services::video::{VeoClient, VideoClient};
use crate::utils::media::{Ffmpeg, MediaTool};
use crate::utils::pool::BoundedPool;
use crate::utils::retry::{Attempts, RetryPolicy};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// External collaborators the pipeline talks to.
pub struct Clients {
    pub llm: Arc<dyn LlmClient>,
    pub images: Arc<dyn ImageClient>,
    pub video: Arc<dyn VideoClient>,
    pub speech: Arc<dyn SpeechClient>,
    pub media: Arc<dyn MediaTool>,
}

/// One worker pool per resource class.
pub struct Pools {
    pub assets: BoundedPool,
    pub video: BoundedPool,
    pub speech: BoundedPool,
}

/// Everything a step or task needs, built once at start-up and shared by
/// `Arc` with every spawned task.
pub struct Services {
    pub config: Config,
    pub store: Arc<dyn ProjectStore>,
    pub storage: Arc<dyn Storage>,
    pub generator: Generator,
    pub images: Arc<dyn ImageClient>,
    pub video: Arc<dyn VideoClient>,
    pub speech: Arc<dyn SpeechClient>,
    pub media: Arc<dyn MediaTool>,
    pub pools: Pools,
}

impl Services {
    pub fn new(
        config: Config,
        store: Arc<dyn ProjectStore>,
        storage: Arc<dyn Storage>,
        clients: Clients,
    ) -> Arc<Self> {
        let generator = Generator::new(
            clients.llm,
            store.clone(),
            Duration::from_millis(config.thought_interval_ms),
        );
        let pools = Pools {
            assets: BoundedPool::new("assets", config.workers.assets),
            video: BoundedPool::new("video", config.workers.video),
            speech: BoundedPool::new("speech", config.workers.speech),
        };
        Arc::new(Self {
            config,
            store,
            storage,
            generator,
            images: clients.images,
            video: clients.video,
            speech: clients.speech,
            media: clients.media,
            pools,
        })
    }

    /// Production wiring: local blob and document stores, Gemini-family
    /// clients, ffmpeg.
    pub fn from_config(config: Config) -> Result<Arc<Self>> {
        config.ensure_directories()?;
        let g = &config.generation;
        if g.api_key.is_empty() {
            log::warn!("No API key configured; generation calls will fail");
        }
        let clients = Clients {
            llm: Arc::new(GeminiClient::new(&g.api_key, &g.base_url, &g.thinking_model)),
            images: Arc::new(GeminiImageClient::new(&g.api_key, &g.base_url, &g.image_model)),
            video: Arc::new(VeoClient::new(&g.api_key, &g.base_url, &g.video_model)),
            speech: Arc::new(GoogleTtsClient::new(&g.api_key, &g.tts_base_url, &g.tts_model)),
            media: Arc::new(Ffmpeg::new(&config.media)),
        };
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new(&config.storage_folder));
        let store: Arc<dyn ProjectStore> = Arc::new(JsonProjectStore::new(Arc::new(
            NativeStorage::new(&config.projects_folder),
        )));
        Ok(Self::new(config, store, storage, clients))
    }

    /// Backoff policy wrapped around every network-calling task.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.retry)
    }

    /// Inline attempts around one image generation call.
    pub fn image_attempts(&self) -> Attempts {
        Attempts::new(self.config.retry.attempts, self.config.retry.attempt_delay())
    }

    pub fn video_attempts(&self) -> Attempts {
        Attempts::new(self.config.retry.attempts, self.config.retry.video_attempt_delay())
    }

    pub async fn log(&self, pid: &str, message: &str) {
        log_project(self.store.as_ref(), pid, message).await;
    }

    /// Blob bytes, retried with jittered backoff like any other download.
    pub async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let retries = self.config.retry.download_attempts.saturating_sub(1);
        RetryPolicy::new(retries, Duration::from_secs(1))
            .with_jitter()
            .run(&format!("fetch {}", path), || self.storage.read(path))
            .await
    }

    /// Scratch directory under the configured temp folder, removed on drop.
    pub fn scratch(&self, label: &str) -> Result<TempDir> {
        std::fs::create_dir_all(&self.config.temp_folder)?;
        tempfile::Builder::new()
            .prefix(&format!("{}_{}_", label, short_id()))
            .tempdir_in(&self.config.temp_folder)
            .with_context(|| format!("Failed to create scratch dir in {}", self.config.temp_folder))
    }
}
