use crate::core::config::MediaConfig;
use crate::core::error::PipelineError;
use crate::core::io::project_path;
use crate::core::models::{Manifest, Segment};
use crate::core::progress::ProgressReporter;
use crate::core::store::ProjectUpdate;
use crate::services::Services;
use crate::utils::media::{FilterJob, MediaInput};
use anyhow::Result;
use log::{debug, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const BACKGROUND_GAIN: f64 = 0.3;
const NARRATION_GAIN: f64 = 1.5;
const MAX_TEMPO: f64 = 2.0;

/// How much the narration is sped up to fit the clip: `audio / video`
/// clamped to `[1, 2]`. Never slows narration down.
pub fn tempo_factor(video_secs: f64, audio_secs: f64) -> f64 {
    if video_secs <= 0.0 {
        return 1.0;
    }
    (audio_secs / video_secs).clamp(1.0, MAX_TEMPO)
}

fn format_factor(value: f64) -> String {
    format!("{}", (value * 1000.0).round() / 1000.0)
}

/// Filter graph that normalizes one clip and mixes its narration.
///
/// The clip's own track (or generated silence when it has none) becomes
/// the background; a narration track is stretched by `tempo`, padded, and
/// mixed over it with the mix lasting as long as the background.
pub fn normalize_job(
    media: &MediaConfig,
    video: &Path,
    video_has_audio: bool,
    narration: Option<(&Path, f64)>,
    output: &Path,
) -> FilterJob {
    let mut inputs = vec![MediaInput::File(video.to_path_buf())];
    if let Some((path, _)) = narration {
        inputs.push(MediaInput::File(path.to_path_buf()));
    }
    let background = if video_has_audio {
        "0:a".to_string()
    } else {
        inputs.push(MediaInput::Silence);
        format!("{}:a", inputs.len() - 1)
    };

    let video_chain = format!("[0:v]fps={},format={}[v]", media.frame_rate, media.pixel_format);
    let audio_chain = match narration {
        Some((_, tempo)) => format!(
            "[{}]volume={}[bg];[1:a]atempo={},apad,volume={}[fg];[bg][fg]amix=inputs=2:duration=first[a]",
            background,
            format_factor(BACKGROUND_GAIN),
            format_factor(tempo),
            format_factor(NARRATION_GAIN)
        ),
        None => format!("[{}]aformat=channel_layouts=stereo[a]", background),
    };

    FilterJob {
        inputs,
        filter_graph: format!("{};{}", video_chain, audio_chain),
        maps: vec!["[v]".to_string(), "[a]".to_string()],
        output_args: ["-shortest", "-c:v", "libx264", "-preset", "ultrafast", "-c:a", "aac"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        output: output.to_path_buf(),
    }
}

/// Turns the per-segment clips and narrations into one final video.
pub struct MediaAssembler<'a> {
    svc: &'a Services,
}

impl<'a> MediaAssembler<'a> {
    pub fn new(svc: &'a Services) -> Self {
        Self { svc }
    }

    async fn normalize_segment(
        &self,
        workdir: &Path,
        idx: usize,
        segment: &Segment,
        video_blob: &str,
        audio_blob: Option<&str>,
    ) -> Result<PathBuf> {
        let svc = self.svc;
        let attempts = svc.config.retry.download_attempts;
        let stem = format!("{:03}_{}", idx, segment.id());

        let video = workdir.join(format!("{}_video.mp4", stem));
        svc.storage.download(video_blob, &video, attempts).await?;
        let narration = match audio_blob {
            Some(blob) => {
                let local = workdir.join(format!("{}_narration.mp3", stem));
                svc.storage.download(blob, &local, attempts).await?;
                Some(local)
            }
            None => None,
        };

        let has_audio = svc.media.has_audio(&video).await?;
        let narration = match &narration {
            Some(path) => {
                let video_secs = svc.media.probe_duration(&video).await?;
                let audio_secs = svc.media.probe_duration(path).await?;
                let tempo = tempo_factor(video_secs, audio_secs);
                debug!(
                    "Segment {}: video {:.2}s, narration {:.2}s, tempo {}",
                    segment.id(),
                    video_secs,
                    audio_secs,
                    format_factor(tempo)
                );
                Some((path.as_path(), tempo))
            }
            None => None,
        };

        let output = workdir.join(format!("{}_norm.mp4", stem));
        let job = normalize_job(&svc.config.media, &video, has_audio, narration, &output);
        svc.media.run_filter_graph(&job).await?;
        Ok(output)
    }

    /// Normalizes every segment that has a clip, concatenates them in
    /// timeline order and uploads the result, returning its blob path.
    /// A segment that fails to normalize is logged and left out. The
    /// scratch directory is removed whether or not this succeeds.
    pub async fn assemble(
        &self,
        pid: &str,
        manifest: &Manifest,
        video_map: &HashMap<String, String>,
        audio_map: &HashMap<String, String>,
    ) -> Result<String> {
        let svc = self.svc;
        let scratch = svc.scratch("assembly")?;
        let workdir = scratch.path();

        let mut progress = ProgressReporter::new(svc.store.as_ref(), pid, manifest.timeline.len());
        let mut clips = Vec::new();
        for (idx, segment) in manifest.timeline.iter().enumerate() {
            let sid = segment.id();
            match video_map.get(sid) {
                None => info!("[{}] No clip for segment {}, skipping", pid, sid),
                Some(video_blob) => {
                    let audio_blob = audio_map.get(sid).map(String::as_str);
                    match self
                        .normalize_segment(workdir, idx, segment, video_blob, audio_blob)
                        .await
                    {
                        Ok(clip) => clips.push(clip),
                        Err(e) => {
                            svc.log(pid, &format!("FFmpeg normalization failed for {}: {}", sid, e))
                                .await
                        }
                    }
                }
            }
            progress.advance(ProjectUpdate::new()).await?;
        }

        if clips.is_empty() {
            return Err(PipelineError::Media {
                tool: "ffmpeg".to_string(),
                message: "no segment could be normalized".to_string(),
            }
            .into());
        }

        let joined = workdir.join("final.mp4");
        svc.media.concatenate(&clips, &joined).await?;
        let path = project_path(pid, "output", &format!("FINAL_{}.mp4", pid));
        svc.storage.upload_file(&joined, &path).await?;
        info!("[{}] Assembled {} of {} segments", pid, clips.len(), manifest.timeline.len());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::tests::MockLlm;
    use crate::services::tests::Harness;

    #[test]
    fn test_tempo_factor_bounds() {
        assert_eq!(tempo_factor(5.0, 8.0), 1.6);
        assert_eq!(tempo_factor(8.0, 4.0), 1.0);
        assert_eq!(tempo_factor(4.0, 20.0), 2.0);
        assert_eq!(tempo_factor(0.0, 3.0), 1.0);
    }

    #[test]
    fn test_narrated_graph_gains() {
        let media = MediaConfig::default();
        let job = normalize_job(
            &media,
            Path::new("/w/v.mp4"),
            true,
            Some((Path::new("/w/n.mp3"), tempo_factor(5.0, 8.0))),
            Path::new("/w/out.mp4"),
        );
        assert_eq!(
            job.filter_graph,
            "[0:v]fps=24,format=yuv420p[v];[0:a]volume=0.3[bg];[1:a]atempo=1.6,apad,volume=1.5[fg];\
             [bg][fg]amix=inputs=2:duration=first[a]"
        );
        assert_eq!(job.inputs.len(), 2);
        assert_eq!(job.maps, vec!["[v]", "[a]"]);
        assert!(job.output_args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn test_silent_clip_gets_generated_background() {
        let media = MediaConfig::default();
        let job = normalize_job(&media, Path::new("/w/v.mp4"), false, None, Path::new("/w/out.mp4"));
        assert_eq!(job.inputs[1], MediaInput::Silence);
        assert!(job.filter_graph.ends_with("[1:a]aformat=channel_layouts=stereo[a]"));

        let job = normalize_job(
            &media,
            Path::new("/w/v.mp4"),
            false,
            Some((Path::new("/w/n.mp3"), 1.0)),
            Path::new("/w/out.mp4"),
        );
        assert_eq!(job.inputs[2], MediaInput::Silence);
        assert!(job.filter_graph.contains("[2:a]volume=0.3[bg]"));
    }

    fn manifest() -> Manifest {
        serde_json::from_str(
            r#"{"timeline": [
                {"id": "s1", "mode": "direct", "duration": 4, "narration": "Hello"},
                {"id": "s2", "mode": "direct", "duration": 4},
                {"id": "s3", "mode": "direct", "duration": 4},
                {"id": "s4", "mode": "direct", "duration": 4}
            ]}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_assemble_keeps_order_and_skips_failures() -> Result<()> {
        let h = Harness::with_llm(MockLlm::answers(&[]));
        let project = h.project(|_| {}).await;
        let storage = &h.services.storage;
        let mut videos = HashMap::new();
        let mut audio = HashMap::new();
        for sid in ["s1", "s2", "s4"] {
            let path = format!("projects/{}/output/{}_raw.mp4", project.id, sid);
            storage.write(&path, format!("clip-{}", sid).as_bytes()).await?;
            videos.insert(sid.to_string(), path);
        }
        let narration = format!("projects/{}/audio/tts_s1.mp3", project.id);
        storage.write(&narration, b"voice-s1").await?;
        audio.insert("s1".to_string(), narration);

        {
            let mut durations = h.media.durations.lock().unwrap();
            durations.insert("000_s1_video".to_string(), 5.0);
            durations.insert("000_s1_narration".to_string(), 8.0);
        }
        h.media.silent.lock().unwrap().push("001_s2".to_string());
        h.media.fail_inputs.lock().unwrap().push("003_s4".to_string());

        let path = MediaAssembler::new(&h.services)
            .assemble(&project.id, &manifest(), &videos, &audio)
            .await?;
        assert_eq!(path, format!("projects/{}/output/FINAL_{}.mp4", project.id, project.id));
        let joined = String::from_utf8(storage.read(&path).await?)?;
        assert_eq!(joined, "clip-s1|voice-s1|\nclip-s2|\n");

        let jobs = h.media.jobs.lock().unwrap();
        assert!(jobs[0].filter_graph.contains("atempo=1.6"));
        assert_eq!(jobs[1].inputs[1], MediaInput::Silence);

        let logs = h.reload(&project.id).await.logs;
        assert!(logs.iter().any(|l| l.contains("FFmpeg normalization failed for s4")));
        // Skipped s3 and failed s4 still count as settled.
        assert_eq!(*h.store.progress.lock().unwrap(), vec![25, 50, 75, 100]);
        let leftovers = std::fs::read_dir(h.dir.path().join("temp"))?.count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_to_assemble_fails_and_cleans_up() -> Result<()> {
        let h = Harness::with_llm(MockLlm::answers(&[]));
        let err = MediaAssembler::new(&h.services)
            .assemble("p", &manifest(), &HashMap::new(), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Media { .. })
        ));
        assert_eq!(std::fs::read_dir(h.dir.path().join("temp"))?.count(), 0);
        Ok(())
    }
}
