//! Out-of-band edits and single-artifact regeneration, gated on ownership.

use crate::core::error::PipelineError;
use crate::core::io::{project_path, project_prefix};
use crate::core::models::{short_id, AnchorSlot, AssetDef, Project, Segment, UploadedFile};
use crate::core::store::ProjectUpdate;
use crate::services::anchors::{generate_anchor, AnchorContext};
use crate::services::assets::{render_asset, AssetSource};
use crate::services::production::{render_audio, render_video};
use crate::services::Services;
use anyhow::{Context, Result};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct ProjectEditor {
    svc: Arc<Services>,
}

impl ProjectEditor {
    pub fn new(svc: Arc<Services>) -> Self {
        Self { svc }
    }

    pub async fn ensure_owner(&self, pid: &str, owner_id: &str) -> Result<Project> {
        let project = self
            .svc
            .store
            .get(pid)
            .await?
            .ok_or_else(|| PipelineError::NotFound(pid.to_string()))?;
        if project.owner_id != owner_id {
            return Err(PipelineError::Forbidden(pid.to_string()).into());
        }
        Ok(project)
    }

    pub async fn create(&self, owner_id: &str, name: &str, prompt: &str) -> Result<Project> {
        let project = Project::new(owner_id, name, prompt);
        self.svc.store.create(&project).await?;
        log::info!("Created project {} for {}", project.id, owner_id);
        Ok(project)
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<Project>> {
        self.svc.store.list(owner_id).await
    }

    /// Removes the record and every blob under the project prefix.
    pub async fn delete(&self, pid: &str, owner_id: &str) -> Result<usize> {
        self.ensure_owner(pid, owner_id).await?;
        self.svc.store.delete(pid).await?;
        let removed = self.svc.storage.delete_prefix(&project_prefix(pid)).await?;
        log::info!("Deleted project {} ({} blobs)", pid, removed);
        Ok(removed)
    }

    pub async fn upload_file(
        &self,
        pid: &str,
        owner_id: &str,
        local: &Path,
        description: &str,
    ) -> Result<UploadedFile> {
        let project = self.ensure_owner(pid, owner_id).await?;
        let filename = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("Not a file: {}", local.display()))?;
        let path = project_path(pid, "uploads", &format!("{}_{}", short_id(), filename));
        self.svc.storage.upload_file(local, &path).await?;

        let uploaded = UploadedFile {
            path,
            description: description.to_string(),
        };
        let mut files = project.file_paths;
        files.push(uploaded.clone());
        self.svc
            .store
            .update(pid, ProjectUpdate::new().file_paths(files))
            .await?;
        Ok(uploaded)
    }

    /// Replaces the report entry with the same id, and the finalized entry
    /// too when there is one. A finalized image is kept unless the new
    /// definition names its own.
    pub async fn update_asset(&self, pid: &str, owner_id: &str, asset: AssetDef) -> Result<()> {
        let project = self.ensure_owner(pid, owner_id).await?;
        let mut report = project
            .report
            .ok_or_else(|| PipelineError::MissingDependency("project has no report".into()))?;
        let slot = report
            .assets
            .iter_mut()
            .find(|a| a.id == asset.id)
            .ok_or_else(|| PipelineError::NotFound(format!("asset {}", asset.id)))?;
        *slot = asset.clone();

        let mut update = ProjectUpdate::new().report(report);
        if let Some(existing) = project.asset_map.get(&asset.id) {
            let mut finalized = asset.clone();
            if finalized.generated.is_none() {
                finalized.generated = existing.generated.clone();
            }
            update = update.asset(asset.id.clone(), finalized);
        }
        self.svc.store.update(pid, update).await
    }

    /// Merges `patch` into the segment, re-checks it and recomputes the
    /// manifest duration. The segment id cannot be changed.
    pub async fn update_segment(&self, pid: &str, owner_id: &str, segment_id: &str, patch: Value) -> Result<Segment> {
        let project = self.ensure_owner(pid, owner_id).await?;
        let mut manifest = project
            .manifest
            .ok_or_else(|| PipelineError::MissingDependency("project has no manifest".into()))?;
        let idx = manifest
            .timeline
            .iter()
            .position(|s| s.id() == segment_id)
            .ok_or_else(|| PipelineError::NotFound(format!("segment {}", segment_id)))?;

        let Value::Object(fields) = patch else {
            return Err(PipelineError::Validation("segment patch must be a JSON object".into()).into());
        };
        let mut merged = serde_json::to_value(&manifest.timeline[idx])?;
        if let Value::Object(current) = &mut merged {
            for (key, value) in fields {
                if key != "id" {
                    current.insert(key, value);
                }
            }
        }
        let segment: Segment = serde_json::from_value(merged)
            .map_err(|e| PipelineError::Validation(format!("segment {}: {}", segment_id, e)))?;
        segment.validate()?;

        manifest.timeline[idx] = segment.clone();
        manifest.recompute_duration();
        self.svc
            .store
            .update(pid, ProjectUpdate::new().manifest(manifest))
            .await?;
        Ok(segment)
    }

    fn segment(project: &Project, segment_id: &str) -> Result<Segment> {
        project
            .manifest
            .as_ref()
            .and_then(|m| m.segment(segment_id))
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("segment {}", segment_id)).into())
    }

    /// Runs `task` in the background. Its success message or failure is
    /// appended to the project log.
    fn spawn_logged<F>(&self, pid: &str, label: &'static str, task: F) -> JoinHandle<Result<()>>
    where
        F: Future<Output = Result<String>> + Send + 'static,
    {
        let svc = self.svc.clone();
        let pid = pid.to_string();
        tokio::spawn(async move {
            match task.await {
                Ok(message) => {
                    svc.log(&pid, &message).await;
                    Ok(())
                }
                Err(e) => {
                    svc.log(&pid, &format!("{} regen failed: {}", label, e)).await;
                    Err(e)
                }
            }
        })
    }

    /// Redraws one asset from its prompt, even if it was supplied.
    pub async fn regenerate_asset(&self, pid: &str, owner_id: &str, asset_id: &str) -> Result<JoinHandle<Result<()>>> {
        let project = self.ensure_owner(pid, owner_id).await?;
        let report = project
            .report
            .ok_or_else(|| PipelineError::MissingDependency("project has no report".into()))?;
        let asset = report
            .asset(asset_id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("asset {}", asset_id)))?;

        let svc = self.svc.clone();
        let pid_owned = pid.to_string();
        Ok(self.spawn_logged(pid, "Asset", async move {
            let finished = svc
                .retry_policy()
                .run(&format!("regenerate asset {}", asset.id), || {
                    render_asset(&svc, &pid_owned, &report, &asset, AssetSource::Generate)
                })
                .await?;
            svc.store
                .update(&pid_owned, ProjectUpdate::new().asset(asset.id.clone(), finished))
                .await?;
            Ok(format!("Asset regenerated: {}", asset.id))
        }))
    }

    /// Redraws one anchor. An end anchor continues from the current start
    /// anchor, which must exist.
    pub async fn regenerate_anchor(
        &self,
        pid: &str,
        owner_id: &str,
        segment_id: &str,
        slot: AnchorSlot,
    ) -> Result<JoinHandle<Result<()>>> {
        let project = self.ensure_owner(pid, owner_id).await?;
        let segment = Self::segment(&project, segment_id)?;
        let ctx = AnchorContext::from_project(&project)?;
        let start_path = match slot {
            AnchorSlot::Start => None,
            AnchorSlot::End => Some(
                project
                    .anchor_map
                    .get(&AnchorSlot::Start.key(segment_id))
                    .cloned()
                    .ok_or_else(|| {
                        PipelineError::MissingDependency(format!("segment {} has no start anchor", segment_id))
                    })?,
            ),
        };

        let svc = self.svc.clone();
        let pid_owned = pid.to_string();
        Ok(self.spawn_logged(pid, "Anchor", async move {
            let path = svc
                .retry_policy()
                .run(&format!("anchor {} {}", segment.id(), slot.as_str()), || {
                    generate_anchor(&svc, &pid_owned, &segment, slot, &ctx, start_path.as_deref())
                })
                .await?;
            let key = slot.key(segment.id());
            svc.store
                .update(&pid_owned, ProjectUpdate::new().anchor(key.clone(), path))
                .await?;
            Ok(format!("Anchor regenerated: {}", key))
        }))
    }

    pub async fn regenerate_video(&self, pid: &str, owner_id: &str, segment_id: &str) -> Result<JoinHandle<Result<()>>> {
        let project = self.ensure_owner(pid, owner_id).await?;
        let segment = Self::segment(&project, segment_id)?;
        if !project.anchor_map.contains_key(&AnchorSlot::Start.key(segment_id)) {
            return Err(
                PipelineError::MissingDependency(format!("segment {} has no start anchor", segment_id)).into(),
            );
        }
        let style = project
            .report
            .as_ref()
            .map(|r| r.visual_style.clone())
            .unwrap_or_default();
        let anchors = project.anchor_map;

        let svc = self.svc.clone();
        let pid_owned = pid.to_string();
        Ok(self.spawn_logged(pid, "Video", async move {
            let path = svc
                .retry_policy()
                .run(&format!("regenerate video {}", segment.id()), || {
                    render_video(&svc, &pid_owned, &segment, &anchors, &style)
                })
                .await?;
            svc.store
                .update(&pid_owned, ProjectUpdate::new().video(segment.id(), path))
                .await?;
            Ok(format!("Video regenerated: {}", segment.id()))
        }))
    }

    pub async fn regenerate_tts(&self, pid: &str, owner_id: &str, segment_id: &str) -> Result<JoinHandle<Result<()>>> {
        let project = self.ensure_owner(pid, owner_id).await?;
        let segment = Self::segment(&project, segment_id)?;
        let manifest = project
            .manifest
            .ok_or_else(|| PipelineError::MissingDependency("project has no manifest".into()))?;

        let svc = self.svc.clone();
        let pid_owned = pid.to_string();
        Ok(self.spawn_logged(pid, "TTS", async move {
            let rendered = svc
                .retry_policy()
                .run(&format!("regenerate tts {}", segment.id()), || {
                    render_audio(&svc, &pid_owned, &segment, &manifest)
                })
                .await?;
            match rendered {
                Some(path) => {
                    svc.store
                        .update(&pid_owned, ProjectUpdate::new().audio(segment.id(), path))
                        .await?;
                    Ok(format!("Narration regenerated: {}", segment.id()))
                }
                None => Ok(format!("Segment {} has no narration", segment.id())),
            }
        }))
    }
}
