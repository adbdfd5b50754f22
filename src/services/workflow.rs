use crate::core::error::PipelineError;
use crate::core::models::{Manifest, Project, ProjectStatus, Step};
use crate::core::store::ProjectUpdate;
use crate::services::anchors::{AnchorContext, AnchorScheduler};
use crate::services::assembly::MediaAssembler;
use crate::services::{assets, planning, production, Services};
use anyhow::Result;
use log::error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long the signed URL of a finished video stays valid.
const RESULT_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn activity(step: Step) -> &'static str {
    match step {
        Step::Ingest => "Ingestion",
        Step::Detective => "Detective analysis",
        Step::Planning => "Planning",
        Step::Assets => "Asset finalization",
        Step::Anchors => "Anchor generation",
        Step::Production => "Production",
        Step::Assembly => "Assembly",
    }
}

fn title(step: Step) -> String {
    let name = step.as_str();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn require_manifest(project: &Project) -> Result<&Manifest> {
    project
        .manifest
        .as_ref()
        .ok_or_else(|| PipelineError::MissingDependency("no manifest; run the planning step first".into()).into())
}

/// Runs pipeline steps against persisted projects. Every step reads the
/// latest snapshot, does its work, and leaves the project either waiting
/// for the next step or failed; errors never escape as panics or `Err`
/// once the project exists.
#[derive(Clone)]
pub struct WorkflowManager {
    svc: Arc<Services>,
}

impl WorkflowManager {
    pub fn new(svc: Arc<Services>) -> Self {
        Self { svc }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.svc
    }

    pub async fn run_step(&self, pid: &str, step: Step) -> Result<ProjectStatus> {
        let store = &self.svc.store;
        let project = store
            .get(pid)
            .await?
            .ok_or_else(|| PipelineError::NotFound(pid.to_string()))?;

        store
            .update(
                pid,
                ProjectUpdate::new()
                    .status(ProjectStatus::Running)
                    .current_step(step)
                    .progress(0)
                    .clear_error(),
            )
            .await?;
        self.svc.log(pid, &format!("Starting {}...", activity(step))).await;

        match self.execute(&project, step).await {
            Ok(update) => {
                let status = step.success_status();
                store.update(pid, update.status(status).progress(100)).await?;
                self.svc.log(pid, &format!("{} complete.", activity(step))).await;
                Ok(status)
            }
            Err(e) => {
                error!("[{}] {} step failed: {:?}", pid, step, e);
                let update = ProjectUpdate::new()
                    .status(ProjectStatus::Failed)
                    .error(e.to_string());
                if let Err(store_err) = store.update(pid, update).await {
                    error!("[{}] Could not record failure: {}", pid, store_err);
                }
                self.svc
                    .log(pid, &format!("ERROR: {} step failed: {}", title(step), e))
                    .await;
                Ok(ProjectStatus::Failed)
            }
        }
    }

    /// Runs the step in the background. The handle resolves to the status
    /// the project was left in.
    pub fn spawn_step(&self, pid: &str, step: Step) -> JoinHandle<Result<ProjectStatus>> {
        let manager = self.clone();
        let pid = pid.to_string();
        tokio::spawn(async move { manager.run_step(&pid, step).await })
    }

    /// All seven steps in order, stopping at the first failure.
    pub async fn run_all(&self, pid: &str) -> Result<ProjectStatus> {
        let mut status = ProjectStatus::Idle;
        for step in Step::ALL {
            status = self.run_step(pid, step).await?;
            if status == ProjectStatus::Failed {
                break;
            }
        }
        Ok(status)
    }

    async fn execute(&self, project: &Project, step: Step) -> Result<ProjectUpdate> {
        let svc = &self.svc;
        let pid = project.id.as_str();
        let update = ProjectUpdate::new();
        match step {
            Step::Ingest => {
                let found = planning::ingest(svc, project).await?;
                Ok(update.potential_assets(found))
            }
            Step::Detective => {
                let report = planning::detect(svc, project).await?;
                Ok(update.report(report))
            }
            Step::Planning => {
                let manifest = planning::plan(svc, project).await?;
                Ok(update.manifest(manifest))
            }
            Step::Assets => {
                assets::finalize_assets(svc, project).await?;
                Ok(update)
            }
            Step::Anchors => {
                let manifest = require_manifest(project)?;
                let ctx = AnchorContext::from_project(project)?;
                AnchorScheduler::new(svc.clone(), pid, ctx)
                    .run(&manifest.timeline)
                    .await?;
                Ok(update)
            }
            Step::Production => {
                production::produce(svc, project).await?;
                Ok(update)
            }
            Step::Assembly => {
                let manifest = require_manifest(project)?;
                let path = MediaAssembler::new(svc)
                    .assemble(pid, manifest, &project.video_map, &project.audio_map)
                    .await?;
                let url = svc.storage.sign(&path, RESULT_URL_TTL).await?;
                Ok(update.result(url))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::UploadedFile;
    use crate::services::llm::tests::MockLlm;
    use crate::services::tests::Harness;

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let h = Harness::with_llm(MockLlm::answers(&[]));
        let manager = WorkflowManager::new(h.services.clone());
        let err = manager.run_step("nope", Step::Ingest).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_successful_step_waits_for_next() -> Result<()> {
        let h = Harness::with_llm(MockLlm::answers(&[r#"{"items": [{"name": "Tower", "type": "location"}]}"#]));
        h.services.storage.write("projects/p/uploads/t.png", b"img").await?;
        let project = h
            .project(|p| {
                p.error = Some("stale".into());
                p.file_paths = vec![UploadedFile {
                    path: "projects/p/uploads/t.png".into(),
                    description: String::new(),
                }];
            })
            .await;

        let manager = WorkflowManager::new(h.services.clone());
        let status = manager.run_step(&project.id, Step::Ingest).await?;
        assert_eq!(status, ProjectStatus::Waiting(Step::Detective));

        let saved = h.reload(&project.id).await;
        assert_eq!(saved.status, ProjectStatus::Waiting(Step::Detective));
        assert_eq!(saved.current_step, Some(Step::Ingest));
        assert_eq!(saved.progress, 100);
        assert_eq!(saved.potential_assets.len(), 1);
        assert!(saved.error.is_none());
        assert!(saved.logs[0].ends_with("Starting Ingestion..."));
        assert!(saved.logs.last().unwrap().ends_with("Ingestion complete."));
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_raised() -> Result<()> {
        let h = Harness::with_llm(MockLlm::answers(&[]));
        let project = h.project(|_| {}).await;
        let manager = WorkflowManager::new(h.services.clone());

        let status = manager.spawn_step(&project.id, Step::Planning).await??;
        assert_eq!(status, ProjectStatus::Failed);

        let saved = h.reload(&project.id).await;
        assert_eq!(saved.status, ProjectStatus::Failed);
        assert!(saved.error.as_deref().unwrap().contains("run the detective step first"));
        assert!(saved
            .logs
            .iter()
            .any(|l| l.contains("ERROR: Planning step failed: missing dependency")));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_all_stops_at_first_failure() -> Result<()> {
        // Ingest has nothing to do; detective gets no answer and fails.
        let h = Harness::with_llm(MockLlm::answers(&[]));
        let project = h.project(|_| {}).await;
        let manager = WorkflowManager::new(h.services.clone());

        let status = manager.run_all(&project.id).await?;
        assert_eq!(status, ProjectStatus::Failed);
        let saved = h.reload(&project.id).await;
        assert_eq!(saved.current_step, Some(Step::Detective));
        assert!(saved.manifest.is_none());
        Ok(())
    }

    #[test]
    fn test_step_titles() {
        assert_eq!(title(Step::Ingest), "Ingest");
        assert_eq!(activity(Step::Ingest), "Ingestion");
    }
}
