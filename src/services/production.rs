use crate::core::error::PipelineError;
use crate::core::io::project_path;
use crate::core::models::{short_id, AnchorSlot, Manifest, Project, Segment};
use crate::core::progress::ProgressReporter;
use crate::core::store::ProjectUpdate;
use crate::services::llm::GenerateRequest;
use crate::services::prompts;
use crate::services::tts::normalize_language;
use crate::services::video::{PollStatus, VideoClient, VideoHandle, VideoRequest};
use crate::services::Services;
use crate::utils::pool::FanIn;
use anyhow::Result;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const VIDEO_ASPECT: &str = "16:9";

/// Polls `handle` every `interval` until the operation finishes. Without a
/// timeout this waits as long as the service takes.
pub async fn await_video(
    video: &dyn VideoClient,
    handle: &VideoHandle,
    interval: Duration,
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let wait = async {
        loop {
            match video.poll(handle).await? {
                PollStatus::Done(bytes) => return Ok::<_, anyhow::Error>(bytes),
                PollStatus::Pending => tokio::time::sleep(interval).await,
            }
        }
    };
    match timeout {
        None => wait.await,
        Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
            PipelineError::external("veo", format!("{} still running after {:?}", handle.0, limit))
        })?,
    }
}

async fn optimize_prompt(svc: &Services, segment: &Segment, visual_style: &str) -> String {
    let shot = segment.shot();
    let request = GenerateRequest::new(0.4).text(prompts::veo_optimizer(shot, visual_style));
    match svc.generator.text(None, &request).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => shot.veo_prompt.clone(),
        Err(e) => {
            warn!("Prompt optimization failed for {}, using the planned prompt: {}", segment.id(), e);
            shot.veo_prompt.clone()
        }
    }
}

/// Looped still of the start anchor standing in for a clip the video
/// service never delivered.
async fn still_fallback(svc: &Services, segment: &Segment, start_image: &[u8]) -> Result<Vec<u8>> {
    let scratch = svc.scratch("fallback")?;
    let image = scratch.path().join("anchor.png");
    let output = scratch.path().join("fallback.mp4");
    tokio::fs::write(&image, start_image).await?;
    svc.media
        .loop_still(&image, segment.duration_seconds(), &output)
        .await?;
    Ok(tokio::fs::read(&output).await?)
}

/// Renders one segment clip from its anchors and stores it, returning the
/// blob path. Fails without calling any service when an anchor the mode
/// needs is missing.
pub async fn render_video(
    svc: &Services,
    pid: &str,
    segment: &Segment,
    anchors: &HashMap<String, String>,
    visual_style: &str,
) -> Result<String> {
    let sid = segment.id();
    let start_key = AnchorSlot::Start.key(sid);
    let start_path = anchors
        .get(&start_key)
        .ok_or_else(|| PipelineError::MissingDependency(format!("no start anchor for segment {}", sid)))?;
    let end_path = if segment.is_interpolated() {
        let end_key = AnchorSlot::End.key(sid);
        Some(
            anchors
                .get(&end_key)
                .ok_or_else(|| PipelineError::MissingDependency(format!("no end anchor for segment {}", sid)))?,
        )
    } else {
        None
    };

    let start_image = svc.fetch(start_path).await?;
    let end_image = match end_path {
        Some(path) => Some(svc.fetch(path).await?),
        None => None,
    };

    let prompt = optimize_prompt(svc, segment, visual_style).await;
    svc.log(
        pid,
        &format!(
            "[VEO {}] {} {}s...",
            sid,
            segment.mode_name().to_uppercase(),
            segment.duration_seconds()
        ),
    )
    .await;

    let request = VideoRequest {
        prompt,
        start_image: start_image.clone(),
        end_image,
        duration_seconds: segment.duration_seconds(),
        aspect_ratio: VIDEO_ASPECT.to_string(),
    };
    let interval = svc.config.video.poll_interval();
    let timeout = svc.config.video.poll_timeout();
    let video = svc.video.as_ref();
    let request = &request;
    let generated = svc
        .video_attempts()
        .run(&format!("video {}", sid), move |_| async move {
            let handle = video.submit(request).await?;
            info!("[{}] Segment {} submitted as {}", pid, sid, handle.0);
            await_video(video, &handle, interval, timeout).await
        })
        .await;

    let bytes = match generated {
        Ok(bytes) => bytes,
        Err(e) => {
            svc.log(
                pid,
                &format!("[VEO {}] Generation failed, falling back to a still clip: {}", sid, e),
            )
            .await;
            still_fallback(svc, segment, &start_image).await?
        }
    };

    let path = project_path(pid, "output", &format!("{}_raw_{}.mp4", sid, &short_id()[..6]));
    svc.storage.write(&path, &bytes).await?;
    Ok(path)
}

/// Synthesizes the segment narration. Segments without narration yield
/// `None`.
pub async fn render_audio(svc: &Services, pid: &str, segment: &Segment, manifest: &Manifest) -> Result<Option<String>> {
    let Some(text) = segment.shot().narration_text() else {
        return Ok(None);
    };
    let language = normalize_language(&manifest.language);
    let voice = &svc.config.generation.voice_name;
    let bytes = svc
        .speech
        .synthesize(text, &manifest.narrator_voice_style, &language, voice)
        .await?;

    let path = project_path(pid, "audio", &format!("tts_{}_{}.mp3", segment.id(), &short_id()[..6]));
    svc.storage.write(&path, &bytes).await?;
    Ok(Some(path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Track {
    Video,
    Audio,
}

#[derive(Debug, Default)]
pub struct Production {
    pub videos: HashMap<String, String>,
    pub audio: HashMap<String, String>,
}

/// Renders every clip in the video pool and every narration in the speech
/// pool at the same time, persisting each artifact as it lands.
pub async fn produce(svc: &Arc<Services>, project: &Project) -> Result<Production> {
    let manifest = project
        .manifest
        .clone()
        .ok_or_else(|| PipelineError::MissingDependency("no manifest; run the planning step first".into()))?;
    let visual_style = project
        .report
        .as_ref()
        .map(|r| r.visual_style.clone())
        .unwrap_or_default();
    let manifest = Arc::new(manifest);
    let anchors = Arc::new(project.anchor_map.clone());
    let visual_style = Arc::new(visual_style);

    let total = manifest.timeline.len() * 2;
    let mut progress = ProgressReporter::new(svc.store.as_ref(), &project.id, total);
    let mut fan_in: FanIn<(Track, String), Option<String>> = FanIn::new();

    for segment in &manifest.timeline {
        let sid = segment.id().to_string();

        let task_svc = svc.clone();
        let pid = project.id.clone();
        let seg = segment.clone();
        let anchors = anchors.clone();
        let style = visual_style.clone();
        fan_in.submit(&svc.pools.video, (Track::Video, sid.clone()), async move {
            let path = task_svc
                .retry_policy()
                .run(&format!("video {}", seg.id()), || {
                    render_video(&task_svc, &pid, &seg, &anchors, &style)
                })
                .await?;
            Ok(Some(path))
        });

        let task_svc = svc.clone();
        let pid = project.id.clone();
        let seg = segment.clone();
        let manifest = manifest.clone();
        fan_in.submit(&svc.pools.speech, (Track::Audio, sid), async move {
            task_svc
                .retry_policy()
                .run(&format!("tts {}", seg.id()), || render_audio(&task_svc, &pid, &seg, &manifest))
                .await
        });
    }

    let mut produced = Production::default();
    while let Some(settled) = fan_in.next().await {
        let (track, sid) = settled.key;
        let mut update = ProjectUpdate::new();
        match (track, settled.result) {
            (Track::Video, Ok(Some(path))) => {
                update = update.video(sid.clone(), path.clone());
                produced.videos.insert(sid, path);
            }
            (Track::Audio, Ok(Some(path))) => {
                update = update.audio(sid.clone(), path.clone());
                produced.audio.insert(sid, path);
            }
            (_, Ok(None)) => {}
            (Track::Video, Err(e)) => svc.log(&project.id, &format!("Video failed for {}: {}", sid, e)).await,
            (Track::Audio, Err(e)) => svc.log(&project.id, &format!("TTS failed for {}: {}", sid, e)).await,
        }
        progress.advance(update).await?;
    }
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::imagen::tests::{tiny_png, MockImages};
    use crate::services::llm::tests::MockLlm;
    use crate::services::tests::Harness;
    use crate::services::video::tests::MockVideo;

    fn manifest() -> Manifest {
        serde_json::from_str(
            r#"{"timeline": [
                {"id": "s1", "mode": "direct", "duration": 4, "veo_prompt": "waves", "narration": "The sea was calm."},
                {"id": "s2", "mode": "interpolated", "duration": 8, "veo_prompt": "storm", "end_anchor_prompt": "night"}
            ], "narrator_voice_style": "warm", "language": "English"}"#,
        )
        .unwrap()
    }

    async fn seed_anchors(h: &Harness, pid: &str, keys: &[&str]) -> HashMap<String, String> {
        let mut anchors = HashMap::new();
        for key in keys {
            let path = format!("projects/{}/anchors/{}.png", pid, key);
            h.services.storage.write(&path, &tiny_png()).await.unwrap();
            anchors.insert(key.to_string(), path);
        }
        anchors
    }

    #[tokio::test]
    async fn test_produce_fills_both_maps() -> Result<()> {
        let h = Harness::with_llm(MockLlm::answers(&["optimized prompt", "optimized prompt"]));
        let project = h.project(|p| p.manifest = Some(manifest())).await;
        let anchor_map = seed_anchors(&h, &project.id, &["s1_start", "s2_start", "s2_end"]).await;
        let project = Project { anchor_map, ..project };

        let produced = produce(&h.services, &project).await?;
        assert_eq!(produced.videos.len(), 2);
        assert_eq!(produced.audio.len(), 1);
        assert!(produced.audio["s1"].starts_with(&format!("projects/{}/audio/tts_s1_", project.id)));
        assert!(produced.videos["s2"].starts_with(&format!("projects/{}/output/s2_raw_", project.id)));

        let saved = h.reload(&project.id).await;
        assert_eq!(saved.progress, 100);
        assert_eq!(saved.video_map.len(), 2);
        assert_eq!(saved.audio_map.len(), 1);

        let submitted = h.video.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 2);
        let transition = submitted.iter().find(|r| r.duration_seconds == 8).unwrap();
        assert!(transition.end_image.is_some());
        assert_eq!(transition.prompt, "optimized prompt");

        let speech = h.speech.calls.lock().unwrap();
        assert_eq!(speech.len(), 1);
        assert_eq!(speech[0].0, "The sea was calm.");
        assert_eq!(speech[0].1, "warm");
        assert_eq!(speech[0].2, "en-US");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_anchor_fails_without_submitting() -> Result<()> {
        let h = Harness::with_llm(MockLlm::answers(&[]));
        let project = h.project(|p| p.manifest = Some(manifest())).await;
        let anchors = seed_anchors(&h, &project.id, &["s2_start"]).await;
        let timeline = &manifest().timeline;

        let err = render_video(&h.services, &project.id, &timeline[0], &anchors, "noir")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingDependency(_))
        ));
        let err = render_video(&h.services, &project.id, &timeline[1], &anchors, "noir")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no end anchor for segment s2"));
        assert!(h.video.submitted.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_video_service_falls_back_to_still() -> Result<()> {
        let h = Harness::build(
            MockLlm::answers(&["optimized"]),
            MockImages::new(),
            MockVideo::always_failing(),
        );
        let project = h.project(|_| {}).await;
        let anchors = seed_anchors(&h, &project.id, &["s1_start"]).await;

        let path = render_video(&h.services, &project.id, &manifest().timeline[0], &anchors, "noir").await?;
        let stored = String::from_utf8(h.services.storage.read(&path).await?)?;
        assert!(stored.starts_with("still:4s:"));

        let logs = h.reload(&project.id).await.logs;
        assert!(logs.iter().any(|l| l.contains("[VEO s1] DIRECT 4s...")));
        assert!(logs.iter().any(|l| l.contains("falling back to a still clip")));
        Ok(())
    }

    #[tokio::test]
    async fn test_silent_segment_has_no_audio() -> Result<()> {
        let h = Harness::with_llm(MockLlm::answers(&[]));
        let manifest = manifest();
        assert!(render_audio(&h.services, "p", &manifest.timeline[1], &manifest).await?.is_none());
        assert!(h.speech.calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_waits_for_completion_and_honours_timeout() {
        let video = MockVideo::new(3);
        let handle = VideoHandle("operations/1".into());
        let started = tokio::time::Instant::now();
        let bytes = await_video(&video, &handle, Duration::from_secs(10), None).await.unwrap();
        assert_eq!(bytes, b"video:operations/1");
        assert!(started.elapsed() >= Duration::from_secs(30));

        let stuck = MockVideo::new(usize::MAX);
        let err = await_video(&stuck, &handle, Duration::from_secs(10), Some(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("still running"));
    }
}
