//! Ingest, detect and plan: everything that runs before pixels are made.

use crate::core::error::PipelineError;
use crate::core::models::{
    AssetAnalysis, AssetType, Manifest, PotentialAsset, Project, Report, UploadedFile, short_id,
};
use crate::core::progress::ProgressReporter;
use crate::core::store::ProjectUpdate;
use crate::services::critique::review_manifest;
use crate::services::llm::GenerateRequest;
use crate::services::prompts;
use crate::services::Services;
use crate::utils::pool::FanIn;
use anyhow::Result;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;

const DEFAULT_VOICE_STYLE: &str = "Neutral, clear, standard voice";
const DEFAULT_ANCHOR_PROMPT: &str = "Cinematic shot";

/// Asks the generator which reusable assets one uploaded image contains.
pub async fn analyze_upload(
    svc: &Services,
    pid: &str,
    user_prompt: &str,
    file: &UploadedFile,
) -> Result<Vec<PotentialAsset>> {
    let image = svc.fetch(&file.path).await?;
    let request = GenerateRequest::new(0.1)
        .text(prompts::analyzer(user_prompt, &file.path))
        .text(prompts::analyzer_context(user_prompt, Some(file.description.as_str())))
        .image(image);

    let analysis: AssetAnalysis = svc
        .retry_policy()
        .run(&format!("analyze {}", file.path), || {
            svc.generator.json(Some(pid), &request)
        })
        .await?;

    Ok(analysis
        .items
        .into_iter()
        .map(|mut item| {
            item.source_file = file.path.clone();
            item
        })
        .collect())
}

/// Analyzes every upload in the asset pool. Files that fail are logged and
/// contribute nothing; the rest keep upload order.
pub async fn ingest(svc: &Arc<Services>, project: &Project) -> Result<Vec<PotentialAsset>> {
    let mut progress = ProgressReporter::new(svc.store.as_ref(), &project.id, project.file_paths.len());
    let mut fan_in = FanIn::new();

    for (idx, file) in project.file_paths.iter().enumerate() {
        let task_svc = svc.clone();
        let pid = project.id.clone();
        let prompt = project.prompt.clone();
        let file = file.clone();
        fan_in.submit(&svc.pools.assets, idx, async move {
            analyze_upload(&task_svc, &pid, &prompt, &file).await
        });
    }

    let mut found: Vec<(usize, Vec<PotentialAsset>)> = Vec::new();
    while let Some(settled) = fan_in.next().await {
        match settled.result {
            Ok(items) => found.push((settled.key, items)),
            Err(e) => svc.log(&project.id, &format!("Analysis warning: {}", e)).await,
        }
        progress.advance(ProjectUpdate::new()).await?;
    }

    found.sort_by_key(|(idx, _)| *idx);
    Ok(found.into_iter().flat_map(|(_, items)| items).collect())
}

/// Settles the asset roster and the global look from the ingest output.
pub async fn detect(svc: &Services, project: &Project) -> Result<Report> {
    let potential = serde_json::to_string_pretty(&project.potential_assets)?;
    let mut request = GenerateRequest::new(0.2).text(prompts::detective(&potential, &project.prompt));

    let mut seen = HashSet::new();
    for asset in &project.potential_assets {
        let src = asset.source_file.as_str();
        if src.is_empty() || !seen.insert(src) {
            continue;
        }
        match svc.fetch(src).await {
            Ok(bytes) => request = request.text(format!("SOURCE FILE: {}", src)).image(bytes),
            Err(e) => {
                svc.log(
                    &project.id,
                    &format!("Warning: Failed to load potential asset {}: {}", src, e),
                )
                .await
            }
        }
    }

    let mut report: Report = svc
        .retry_policy()
        .run("detective", || svc.generator.json(Some(&project.id), &request))
        .await?;
    complete_report(&mut report);
    Ok(report)
}

/// Fills the fields the detective tends to leave blank.
pub fn complete_report(report: &mut Report) {
    let style = report.visual_style.clone();
    for asset in &mut report.assets {
        if asset.id.trim().is_empty() {
            asset.id = short_id();
        }
        if asset.name.trim().is_empty() {
            asset.name = format!("Asset {}", asset.id);
        }
        if asset.visual_prompt.as_deref().map_or(true, |p| p.trim().is_empty()) {
            asset.visual_prompt = Some(format!("{}, {}", asset.description, style));
        }
        if asset.kind == AssetType::Character && asset.voice_style.as_deref().map_or(true, str::is_empty) {
            asset.voice_style = Some(DEFAULT_VOICE_STYLE.to_string());
        }
        if asset.is_supplied && asset.source_file.as_deref().map_or(true, str::is_empty) {
            warn!("Asset {} claims to be supplied without a source file; generating it instead", asset.id);
            asset.is_supplied = false;
        }
    }
}

/// First-draft manifest from the report, with empty prompts backfilled.
pub async fn architect(svc: &Services, pid: &str, report: &Report) -> Result<Manifest> {
    let request = GenerateRequest::new(0.7)
        .text(prompts::ARCHITECT)
        .text(format!("REPORT: {}", serde_json::to_string(report)?));

    let mut manifest: Manifest = svc
        .retry_policy()
        .run("architect", || svc.generator.json(Some(pid), &request))
        .await?;

    for seg in &mut manifest.timeline {
        let shot = seg.shot_mut();
        if shot.anchor_prompt.trim().is_empty() {
            let action = shot.scene_details.main_action.trim();
            shot.anchor_prompt = if action.is_empty() {
                DEFAULT_ANCHOR_PROMPT.to_string()
            } else {
                action.to_string()
            };
        }
        if shot.veo_prompt.trim().is_empty() {
            shot.veo_prompt = shot.anchor_prompt.clone();
        }
    }
    Ok(manifest)
}

/// Architect, then one critique pass, then the segment invariants.
pub async fn plan(svc: &Services, project: &Project) -> Result<Manifest> {
    let report = project
        .report
        .as_ref()
        .ok_or_else(|| PipelineError::MissingDependency("no report; run the detective step first".into()))?;

    let draft = architect(svc, &project.id, report).await?;
    let mut manifest = review_manifest(&svc.generator, svc.store.as_ref(), &project.id, report, draft).await?;
    manifest.ensure_ids();
    manifest.validate()?;
    manifest.recompute_duration();
    info!(
        "[{}] Planned {} segments, {}s total",
        project.id,
        manifest.timeline.len(),
        manifest.estimated_total_duration
    );
    Ok(manifest)
}
