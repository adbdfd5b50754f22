use crate::core::io::Storage;
use crate::core::models::{
    AssetDef, Manifest, PotentialAsset, Project, ProjectStatus, RenderResult, Report, Step,
    UploadedFile,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A field-scoped partial update. Only fields that are set are written;
/// map fields are merged entry by entry.
#[derive(Debug, Default, Clone)]
pub struct ProjectUpdate {
    pub status: Option<ProjectStatus>,
    pub current_step: Option<Step>,
    pub progress: Option<u8>,
    /// `Some(None)` clears the field.
    pub current_thought: Option<Option<String>>,
    /// `Some(None)` clears the field.
    pub error: Option<Option<String>>,
    pub result: Option<RenderResult>,
    pub file_paths: Option<Vec<UploadedFile>>,
    pub potential_assets: Option<Vec<PotentialAsset>>,
    pub report: Option<Report>,
    pub manifest: Option<Manifest>,
    pub asset_map: HashMap<String, AssetDef>,
    pub anchor_map: HashMap<String, String>,
    pub video_map: HashMap<String, String>,
    pub audio_map: HashMap<String, String>,
}

impl ProjectUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ProjectStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_step(mut self, step: Step) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn thought(mut self, thought: Option<String>) -> Self {
        self.current_thought = Some(thought);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn result(mut self, url: impl Into<String>) -> Self {
        self.result = Some(RenderResult { url: url.into() });
        self
    }

    pub fn file_paths(mut self, files: Vec<UploadedFile>) -> Self {
        self.file_paths = Some(files);
        self
    }

    pub fn potential_assets(mut self, assets: Vec<PotentialAsset>) -> Self {
        self.potential_assets = Some(assets);
        self
    }

    pub fn report(mut self, report: Report) -> Self {
        self.report = Some(report);
        self
    }

    pub fn manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn asset(mut self, id: impl Into<String>, asset: AssetDef) -> Self {
        self.asset_map.insert(id.into(), asset);
        self
    }

    pub fn anchor(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.anchor_map.insert(key.into(), path.into());
        self
    }

    pub fn video(mut self, segment_id: impl Into<String>, path: impl Into<String>) -> Self {
        self.video_map.insert(segment_id.into(), path.into());
        self
    }

    pub fn audio(mut self, segment_id: impl Into<String>, path: impl Into<String>) -> Self {
        self.audio_map.insert(segment_id.into(), path.into());
        self
    }

    /// Folds `other` into `self`; fields set in `other` win.
    pub fn merge(mut self, other: ProjectUpdate) -> Self {
        self.status = other.status.or(self.status);
        self.current_step = other.current_step.or(self.current_step);
        self.progress = other.progress.or(self.progress);
        self.current_thought = other.current_thought.or(self.current_thought);
        self.error = other.error.or(self.error);
        self.result = other.result.or(self.result);
        self.file_paths = other.file_paths.or(self.file_paths);
        self.potential_assets = other.potential_assets.or(self.potential_assets);
        self.report = other.report.or(self.report);
        self.manifest = other.manifest.or(self.manifest);
        self.asset_map.extend(other.asset_map);
        self.anchor_map.extend(other.anchor_map);
        self.video_map.extend(other.video_map);
        self.audio_map.extend(other.audio_map);
        self
    }

    pub fn apply_to(self, project: &mut Project) {
        if let Some(status) = self.status {
            project.status = status;
        }
        if let Some(step) = self.current_step {
            project.current_step = Some(step);
        }
        if let Some(progress) = self.progress {
            project.progress = progress;
        }
        if let Some(thought) = self.current_thought {
            project.current_thought = thought;
        }
        if let Some(error) = self.error {
            project.error = error;
        }
        if let Some(result) = self.result {
            project.result = Some(result);
        }
        if let Some(files) = self.file_paths {
            project.file_paths = files;
        }
        if let Some(assets) = self.potential_assets {
            project.potential_assets = assets;
        }
        if let Some(report) = self.report {
            project.report = Some(report);
        }
        if let Some(manifest) = self.manifest {
            project.manifest = Some(manifest);
        }
        project.asset_map.extend(self.asset_map);
        project.anchor_map.extend(self.anchor_map);
        project.video_map.extend(self.video_map);
        project.audio_map.extend(self.audio_map);
    }
}

/// Document store holding project records.
///
/// `update` and `append_log` must be atomic per project and must succeed
/// silently when the project was deleted in the meantime.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create(&self, project: &Project) -> Result<()>;
    async fn get(&self, pid: &str) -> Result<Option<Project>>;
    async fn list(&self, owner_id: &str) -> Result<Vec<Project>>;
    async fn update(&self, pid: &str, update: ProjectUpdate) -> Result<()>;
    async fn append_log(&self, pid: &str, message: &str) -> Result<()>;
    async fn delete(&self, pid: &str) -> Result<()>;
}

/// Logs `message` locally and appends it, timestamped, to the project log.
/// Store failures are only logged.
pub async fn log_project(store: &dyn ProjectStore, pid: &str, message: &str) {
    log::info!("[{}] {}", pid, message);
    if let Err(e) = store.append_log(pid, message).await {
        log::warn!("[{}] Failed to persist log line: {}", pid, e);
    }
}

/// One JSON document per project on top of a [`Storage`] backend. A single
/// lock serializes read-modify-write cycles so disjoint field updates
/// never clobber each other.
pub struct JsonProjectStore {
    storage: Arc<dyn Storage>,
    lock: Mutex<()>,
}

impl JsonProjectStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    fn doc_path(pid: &str) -> String {
        format!("{}.json", pid)
    }

    async fn load(&self, pid: &str) -> Result<Option<Project>> {
        let path = Self::doc_path(pid);
        if !self.storage.exists(&path).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(&path).await?;
        let project = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse project document {}", pid))?;
        Ok(Some(project))
    }

    async fn save(&self, project: &Project) -> Result<()> {
        let content = serde_json::to_string_pretty(project)?;
        self.storage
            .write(&Self::doc_path(&project.id), content.as_bytes())
            .await
    }
}

#[async_trait]
impl ProjectStore for JsonProjectStore {
    async fn create(&self, project: &Project) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.save(project).await
    }

    async fn get(&self, pid: &str) -> Result<Option<Project>> {
        let _guard = self.lock.lock().await;
        self.load(pid).await
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<Project>> {
        let _guard = self.lock.lock().await;
        let mut projects = Vec::new();
        for key in self.storage.list("").await? {
            if let Some(pid) = key.strip_suffix(".json") {
                if let Some(project) = self.load(pid).await? {
                    if project.owner_id == owner_id {
                        projects.push(project);
                    }
                }
            }
        }
        projects.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(projects)
    }

    async fn update(&self, pid: &str, update: ProjectUpdate) -> Result<()> {
        let _guard = self.lock.lock().await;
        match self.load(pid).await? {
            Some(mut project) => {
                update.apply_to(&mut project);
                self.save(&project).await
            }
            None => {
                log::warn!("Tried to update deleted project {}", pid);
                Ok(())
            }
        }
    }

    async fn append_log(&self, pid: &str, message: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(mut project) = self.load(pid).await? {
            let stamp = chrono::Local::now().format("%H:%M:%S");
            project.logs.push(format!("[{}] {}", stamp, message));
            self.save(&project).await?;
        }
        Ok(())
    }

    async fn delete(&self, pid: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.storage.delete(&Self::doc_path(pid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;

    fn store(dir: &std::path::Path) -> Arc<JsonProjectStore> {
        Arc::new(JsonProjectStore::new(Arc::new(NativeStorage::new(dir))))
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_updates_both_survive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        let project = Project::new("u1", "demo", "make a video");
        store.create(&project).await?;

        let mut handles = Vec::new();
        for i in 0..20u8 {
            let store = store.clone();
            let pid = project.id.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store.update(&pid, ProjectUpdate::new().progress(i)).await
                } else {
                    store
                        .update(&pid, ProjectUpdate::new().video(format!("s{}", i), format!("v{}.mp4", i)))
                        .await
                }
            }));
        }
        for h in handles {
            h.await??;
        }

        let saved = store.get(&project.id).await?.unwrap();
        assert_eq!(saved.video_map.len(), 10);
        assert_eq!(saved.video_map.get("s7").map(String::as_str), Some("v7.mp4"));
        assert!(saved.progress % 2 == 0 && saved.progress <= 18);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_on_deleted_project_is_noop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        let project = Project::new("u1", "demo", "prompt");
        store.create(&project).await?;
        store.delete(&project.id).await?;

        store
            .update(&project.id, ProjectUpdate::new().status(ProjectStatus::Running))
            .await?;
        store.append_log(&project.id, "late message").await?;
        assert!(store.get(&project.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_log_and_list_by_owner() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        let a = Project::new("alice", "a", "p");
        let b = Project::new("bob", "b", "p");
        store.create(&a).await?;
        store.create(&b).await?;

        log_project(store.as_ref(), &a.id, "Starting Ingestion...").await;
        let saved = store.get(&a.id).await?.unwrap();
        assert_eq!(saved.logs.len(), 1);
        assert!(saved.logs[0].ends_with("] Starting Ingestion..."));

        let mine = store.list("alice").await?;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, a.id);
        Ok(())
    }

    #[test]
    fn test_merge_prefers_later_and_unions_maps() {
        let first = ProjectUpdate::new().progress(10).anchor("s1_start", "a.png");
        let second = ProjectUpdate::new().progress(20).anchor("s1_end", "b.png");
        let merged = first.merge(second);
        assert_eq!(merged.progress, Some(20));
        assert_eq!(merged.anchor_map.len(), 2);

        let mut project = Project::default();
        project.anchor_map.insert("s0_start".to_string(), "z.png".to_string());
        merged.thought(None).apply_to(&mut project);
        assert_eq!(project.anchor_map.len(), 3);
        assert_eq!(project.progress, 20);
        assert!(project.current_thought.is_none());
    }
}
