use crate::core::error::PipelineError;
use crate::core::io::project_path;
use crate::core::models::{short_id, AnchorCritique, AnchorSlot, AssetDef, AssetType, Project, Segment};
use crate::core::progress::ProgressReporter;
use crate::core::store::ProjectUpdate;
use crate::services::critique::{CritiqueLoop, Critiqued, Verdict};
use crate::services::llm::{GenerateRequest, Part};
use crate::services::prompts;
use crate::services::Services;
use crate::utils::collage::build_collage;
use crate::utils::pool::FanIn;
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;

const ANCHOR_ASPECT: &str = "16:9";

/// Project-wide inputs every anchor request shares.
#[derive(Debug, Clone)]
pub struct AnchorContext {
    pub visual_style: String,
    pub negative_prompt: String,
    pub asset_map: HashMap<String, AssetDef>,
}

impl AnchorContext {
    pub fn from_project(project: &Project) -> Result<Self> {
        let report = project
            .report
            .as_ref()
            .ok_or_else(|| PipelineError::MissingDependency("no report; run the detective step first".into()))?;
        Ok(Self {
            visual_style: report.visual_style.clone(),
            negative_prompt: report.negative_prompt.clone(),
            asset_map: project.asset_map.clone(),
        })
    }

    /// Loads the segment's finalized assets: a collage of its characters and
    /// objects, and the first location as environment plate. Unreadable
    /// images are skipped.
    async fn references(&self, svc: &Services, segment: &Segment) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let mut subjects = Vec::new();
        let mut environment = None;
        for id in &segment.shot().asset_ids {
            let Some(asset) = self.asset_map.get(id) else {
                debug!("Segment {} references unknown asset {}", segment.id(), id);
                continue;
            };
            let Some(path) = asset.generated.as_deref() else {
                continue;
            };
            if asset.kind == AssetType::Location && environment.is_some() {
                continue;
            }
            let bytes = match svc.fetch(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping asset image {} for segment {}: {}", path, segment.id(), e);
                    continue;
                }
            };
            match asset.kind {
                AssetType::Location => environment = Some(bytes),
                AssetType::Character | AssetType::Object => subjects.push(bytes),
            }
        }
        Ok((build_collage(&subjects)?, environment))
    }
}

struct AnchorJob<'a> {
    svc: &'a Services,
    ctx: &'a AnchorContext,
    continuity: Option<Vec<u8>>,
    collage: Option<Vec<u8>>,
    environment: Option<Vec<u8>>,
}

impl AnchorJob<'_> {
    fn parts(&self, prompt: &str) -> Vec<Part> {
        let mut parts = vec![
            Part::text(prompts::anchor_header(&self.ctx.visual_style, &self.ctx.negative_prompt)),
            Part::text(format!("{} {}", prompts::ANCHOR_SCENE, prompt)),
        ];
        let references = [
            (prompts::ANCHOR_CONTINUITY, &self.continuity),
            (prompts::ANCHOR_ASSETS, &self.collage),
            (prompts::ANCHOR_ENVIRONMENT, &self.environment),
        ];
        for (label, image) in references {
            if let Some(image) = image {
                parts.push(Part::text(label));
                parts.push(Part::png(image.clone()));
            }
        }
        parts
    }
}

#[async_trait]
impl<'a> Critiqued for AnchorJob<'a> {
    type Artifact = Vec<u8>;

    async fn generate(&self, prompt: &str, attempt: usize) -> Result<Vec<u8>> {
        let parts = self.parts(prompt);
        self.svc
            .image_attempts()
            .run(&format!("anchor try {}", attempt), |_| {
                self.svc.images.generate(&parts, ANCHOR_ASPECT)
            })
            .await
    }

    async fn evaluate(&self, artifact: &Vec<u8>, prompt: &str) -> Result<Verdict> {
        let request = GenerateRequest::new(0.1)
            .text(prompts::anchor_critic(&self.ctx.visual_style, prompt))
            .image(artifact.clone());
        let critique: AnchorCritique = self.svc.generator.json(None, &request).await?;
        Ok(Verdict {
            approved: critique.approved,
            feedback: critique.feedback,
            revised_prompt: critique.improved_prompt,
        })
    }
}

fn slot_title(slot: AnchorSlot) -> &'static str {
    match slot {
        AnchorSlot::Start => "Start",
        AnchorSlot::End => "End",
    }
}

/// Generates, critiques and stores one anchor image, returning its blob
/// path. End anchors continue from the image at `start_path`.
pub async fn generate_anchor(
    svc: &Services,
    pid: &str,
    segment: &Segment,
    slot: AnchorSlot,
    ctx: &AnchorContext,
    start_path: Option<&str>,
) -> Result<String> {
    let sid = segment.id();
    let continuity = match (slot, start_path) {
        (AnchorSlot::Start, _) => None,
        (AnchorSlot::End, Some(path)) => Some(svc.fetch(path).await?),
        (AnchorSlot::End, None) => {
            return Err(PipelineError::MissingDependency(format!("segment {} has no start anchor", sid)).into())
        }
    };
    svc.log(
        pid,
        &format!("[ANCHOR {}] Generating {}...", sid, slot.as_str().to_uppercase()),
    )
    .await;

    let (collage, environment) = ctx.references(svc, segment).await?;
    let job = AnchorJob {
        svc,
        ctx,
        continuity,
        collage,
        environment,
    };
    let critique = CritiqueLoop::new(svc.config.retry.attempts, svc.config.retry.attempt_delay());
    let accepted = critique
        .run(&format!("anchor {} {}", sid, slot.as_str()), &job, segment.anchor_prompt(slot))
        .await?;
    if accepted.forced {
        svc.log(
            pid,
            &format!(
                "WARNING: Anchor {} {} forced acceptance after {} failed critiques.",
                sid,
                slot.as_str(),
                accepted.rejections
            ),
        )
        .await;
    }

    let filename = format!("{}_{}_{}.png", sid, slot.as_str(), &short_id()[..6]);
    let path = project_path(pid, "anchors", &filename);
    svc.storage.write(&path, &accepted.artifact).await?;
    Ok(path)
}

/// Start anchors for every segment at once; an end anchor is queued for an
/// interpolated segment as soon as its start anchor lands.
pub struct AnchorScheduler {
    svc: Arc<Services>,
    pid: String,
    ctx: Arc<AnchorContext>,
}

type AnchorKey = (usize, AnchorSlot);

impl AnchorScheduler {
    pub fn new(svc: Arc<Services>, pid: &str, ctx: AnchorContext) -> Self {
        Self {
            svc,
            pid: pid.to_string(),
            ctx: Arc::new(ctx),
        }
    }

    fn submit(
        &self,
        fan_in: &mut FanIn<AnchorKey, String>,
        idx: usize,
        segment: &Segment,
        slot: AnchorSlot,
        start_path: Option<String>,
    ) {
        let svc = self.svc.clone();
        let pid = self.pid.clone();
        let ctx = self.ctx.clone();
        let segment = segment.clone();
        fan_in.submit(&self.svc.pools.assets, (idx, slot), async move {
            svc.retry_policy()
                .run(&format!("anchor {} {}", segment.id(), slot.as_str()), || {
                    generate_anchor(&svc, &pid, &segment, slot, &ctx, start_path.as_deref())
                })
                .await
        });
    }

    /// Runs until no task is left in flight. Returns the anchors produced,
    /// keyed `<segment>_<slot>`; each one is persisted as it lands.
    pub async fn run(&self, timeline: &[Segment]) -> Result<HashMap<String, String>> {
        // End-task count is unknown up front, so progress is measured
        // against starts * 1.5 and held below 100 until the step finishes.
        let estimate = timeline.len() as f64 * 1.5;
        let mut progress = ProgressReporter::estimated(self.svc.store.as_ref(), &self.pid, estimate, 99);
        let mut fan_in = FanIn::new();
        for (idx, segment) in timeline.iter().enumerate() {
            self.submit(&mut fan_in, idx, segment, AnchorSlot::Start, None);
        }

        let mut anchors = HashMap::new();
        while let Some(settled) = fan_in.next().await {
            let (idx, slot) = settled.key;
            let segment = &timeline[idx];
            let mut update = ProjectUpdate::new();
            match settled.result {
                Ok(path) => {
                    let key = slot.key(segment.id());
                    update = update.anchor(key.clone(), path.clone());
                    if slot == AnchorSlot::Start && segment.is_interpolated() {
                        self.submit(&mut fan_in, idx, segment, AnchorSlot::End, Some(path.clone()));
                    }
                    anchors.insert(key, path);
                }
                Err(e) => {
                    self.svc
                        .log(
                            &self.pid,
                            &format!("{} anchor failed for {}: {}", slot_title(slot), segment.id(), e),
                        )
                        .await
                }
            }
            progress.advance(update).await?;
        }
        Ok(anchors)
    }
}
