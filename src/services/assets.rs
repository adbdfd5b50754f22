use crate::core::error::PipelineError;
use crate::core::io::project_path;
use crate::core::models::{short_id, AssetDef, Project, Report};
use crate::core::progress::ProgressReporter;
use crate::core::store::ProjectUpdate;
use crate::services::llm::Part;
use crate::services::prompts;
use crate::services::Services;
use crate::utils::pool::FanIn;
use anyhow::{anyhow, Result};
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

/// Where an asset's reference image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSource {
    /// Cut out of the file the user uploaded.
    Extract,
    /// Drawn from the visual prompt alone.
    Generate,
}

impl AssetSource {
    pub fn for_asset(asset: &AssetDef) -> Self {
        if asset.is_supplied && asset.source_file.as_deref().is_some_and(|s| !s.is_empty()) {
            AssetSource::Extract
        } else {
            AssetSource::Generate
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            AssetSource::Extract => "SUPPLIED",
            AssetSource::Generate => "GEN",
        }
    }
}

pub fn asset_blob_path(pid: &str, asset: &AssetDef, source: AssetSource) -> String {
    let filename = format!(
        "{}_{}_{}_{}.png",
        source.tag(),
        asset.kind.as_str(),
        asset.id,
        &short_id()[..6]
    );
    project_path(pid, "assets", &filename)
}

fn request_parts(report: &Report, asset: &AssetDef, source: AssetSource, source_image: Option<Vec<u8>>) -> Vec<Part> {
    let fallback = || {
        asset
            .visual_prompt
            .clone()
            .unwrap_or_else(|| format!("{}, {}", asset.description, report.visual_style))
    };
    match source {
        AssetSource::Extract => {
            let instruction = asset
                .extraction_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(fallback);
            let mut parts = vec![Part::text(prompts::asset_extraction(asset.kind, &instruction))];
            parts.extend(source_image.map(Part::png));
            parts
        }
        AssetSource::Generate => vec![Part::text(prompts::asset_generation(
            asset.kind,
            &report.visual_style,
            &report.negative_prompt,
            &fallback(),
        ))],
    }
}

/// Produces and stores one reference image, returning the asset with its
/// `generated` path set.
pub async fn render_asset(
    svc: &Services,
    pid: &str,
    report: &Report,
    asset: &AssetDef,
    source: AssetSource,
) -> Result<AssetDef> {
    let source_image = match source {
        AssetSource::Extract => {
            let src = asset
                .source_file
                .as_deref()
                .ok_or_else(|| anyhow!("asset {} has no source file", asset.id))?;
            Some(svc.fetch(src).await?)
        }
        AssetSource::Generate => None,
    };
    let parts = request_parts(report, asset, source, source_image);
    let aspect = asset.kind.aspect_ratio();

    let label = format!("asset {}", asset.id);
    let bytes = svc
        .image_attempts()
        .run(&label, |_| svc.images.generate(&parts, aspect))
        .await?;

    let path = asset_blob_path(pid, asset, source);
    svc.storage.write(&path, &bytes).await?;
    info!("[{}] Asset {} stored at {}", pid, asset.id, path);

    let mut finished = asset.clone();
    finished.generated = Some(path);
    Ok(finished)
}

/// [`render_asset`] under the task-level backoff, choosing extraction or
/// generation from the asset itself.
pub async fn finalize_asset(svc: &Services, pid: &str, report: &Report, asset: &AssetDef) -> Result<AssetDef> {
    let source = AssetSource::for_asset(asset);
    svc.retry_policy()
        .run(&format!("finalize asset {}", asset.id), || {
            render_asset(svc, pid, report, asset, source)
        })
        .await
}

/// Finalizes every asset of the report in the asset pool. Each success is
/// persisted into `asset_map` together with the new progress; failures are
/// logged and left out.
pub async fn finalize_assets(svc: &Arc<Services>, project: &Project) -> Result<HashMap<String, AssetDef>> {
    let report = project
        .report
        .clone()
        .ok_or_else(|| PipelineError::MissingDependency("no report to finalize".into()))?;
    let report = Arc::new(report);

    let mut progress = ProgressReporter::new(svc.store.as_ref(), &project.id, report.assets.len());
    let mut fan_in = FanIn::new();
    for asset in &report.assets {
        let task_svc = svc.clone();
        let pid = project.id.clone();
        let report = report.clone();
        let asset = asset.clone();
        fan_in.submit(&svc.pools.assets, asset.id.clone(), async move {
            finalize_asset(&task_svc, &pid, &report, &asset).await
        });
    }

    let mut finished = HashMap::new();
    while let Some(settled) = fan_in.next().await {
        let mut update = ProjectUpdate::new();
        match settled.result {
            Ok(asset) => {
                update = update.asset(settled.key.clone(), asset.clone());
                finished.insert(settled.key, asset);
            }
            Err(e) => {
                svc.log(&project.id, &format!("Asset {} failed: {}", settled.key, e))
                    .await
            }
        }
        progress.advance(update).await?;
    }
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::AssetType;
    use crate::services::imagen::tests::MockImages;
    use crate::services::llm::tests::MockLlm;
    use crate::services::tests::Harness;
    use crate::services::video::tests::MockVideo;

    fn report() -> Report {
        serde_json::from_str(
            r#"{"visual_style": "moody noir", "negative_prompt": "cartoon", "assets": [
                {"id": "lh", "name": "Lighthouse", "type": "location", "is_supplied": true,
                 "source_file": "projects/p/uploads/lh.png", "extraction_prompt": "the tower"},
                {"id": "kp", "name": "Keeper", "type": "character", "visual_prompt": "old keeper"},
                {"id": "lp", "name": "Lamp", "type": "object", "visual_prompt": "brass lamp"}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_source_selection_and_path() {
        let report = report();
        assert_eq!(AssetSource::for_asset(&report.assets[0]), AssetSource::Extract);
        assert_eq!(AssetSource::for_asset(&report.assets[1]), AssetSource::Generate);

        let path = asset_blob_path("p1", &report.assets[1], AssetSource::Generate);
        assert!(path.starts_with("projects/p1/assets/GEN_character_kp_"));
        assert!(path.ends_with(".png"));
        let path = asset_blob_path("p1", &report.assets[0], AssetSource::Extract);
        assert!(path.starts_with("projects/p1/assets/SUPPLIED_location_lh_"));
    }

    #[tokio::test]
    async fn test_finalize_assets_partial_success() -> Result<()> {
        let h = Harness::build(MockLlm::answers(&[]), MockImages::failing_on("brass lamp"), MockVideo::new(0));
        h.services.storage.write("projects/p/uploads/lh.png", b"upload").await?;
        let project = h.project(|p| p.report = Some(report())).await;

        let finished = finalize_assets(&h.services, &project).await?;
        assert_eq!(finished.len(), 2);
        assert!(!finished.contains_key("lp"));

        let saved = h.reload(&project.id).await;
        assert_eq!(saved.progress, 100);
        assert_eq!(saved.asset_map.len(), 2);
        let location = &saved.asset_map["lh"];
        let stored = location.generated.as_deref().unwrap();
        assert!(h.services.storage.exists(stored).await?);
        assert!(saved.logs.iter().any(|l| l.contains("Asset lp failed")));

        let calls = h.images.calls.lock().unwrap();
        let extraction = calls.iter().find(|(text, _, _)| text.contains("the tower")).unwrap();
        assert_eq!(extraction.1, 1);
        assert_eq!(extraction.2, "16:9");
        let keeper = calls.iter().find(|(text, _, _)| text.contains("old keeper")).unwrap();
        assert_eq!(keeper.1, 0);
        assert_eq!(keeper.2, "1:1");
        assert!(keeper.0.contains("WHITE BACKGROUND"));
        Ok(())
    }

    #[tokio::test]
    async fn test_regeneration_ignores_upload() -> Result<()> {
        let h = Harness::with_llm(MockLlm::answers(&[]));
        let report = report();
        let asset = render_asset(&h.services, "p", &report, &report.assets[0], AssetSource::Generate).await?;
        assert_eq!(asset.kind, AssetType::Location);
        assert!(asset.generated.unwrap().contains("/GEN_location_lh_"));
        let calls = h.images.calls.lock().unwrap();
        assert_eq!(calls[0].1, 0);
        assert!(calls[0].0.contains("EMPTY SCENE"));
        Ok(())
    }
}
