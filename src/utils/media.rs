use crate::core::config::MediaConfig;
use crate::core::error::PipelineError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// One input of a filter-graph invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaInput {
    File(PathBuf),
    /// Generated stereo silence, for clips without an audio stream.
    Silence,
}

/// A single ffmpeg filter-graph run producing one output file.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterJob {
    pub inputs: Vec<MediaInput>,
    pub filter_graph: String,
    pub maps: Vec<String>,
    pub output_args: Vec<String>,
    pub output: PathBuf,
}

impl FilterJob {
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into(), "-v".into(), "error".into()];
        for input in &self.inputs {
            match input {
                MediaInput::File(path) => {
                    args.push("-i".into());
                    args.push(path.to_string_lossy().to_string());
                }
                MediaInput::Silence => {
                    args.extend([
                        "-f".to_string(),
                        "lavfi".to_string(),
                        "-i".to_string(),
                        "anullsrc=channel_layout=stereo:sample_rate=48000".to_string(),
                    ]);
                }
            }
        }
        args.push("-filter_complex".into());
        args.push(self.filter_graph.clone());
        for map in &self.maps {
            args.push("-map".into());
            args.push(map.clone());
        }
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Local media tooling the assembler and the video fallback depend on.
#[async_trait]
pub trait MediaTool: Send + Sync {
    async fn probe_duration(&self, path: &Path) -> Result<f64>;
    async fn has_audio(&self, path: &Path) -> Result<bool>;
    async fn run_filter_graph(&self, job: &FilterJob) -> Result<()>;
    /// Stream-copies `inputs` back to back into `output`.
    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
    /// Encodes `image` as a still clip lasting `seconds`.
    async fn loop_still(&self, image: &Path, seconds: u32, output: &Path) -> Result<()>;
}

/// Body of an ffmpeg concat-demuxer list file.
pub fn concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|p| {
            let absolute = std::path::absolute(p).unwrap_or_else(|_| p.clone());
            format!("file '{}'\n", absolute.to_string_lossy().replace('\'', "'\\''"))
        })
        .collect()
}

pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Ffmpeg {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ffmpeg: PathBuf::from(&config.ffmpeg_path),
            ffprobe: PathBuf::from(&config.ffprobe_path),
        }
    }

    async fn exec(program: &Path, args: &[String]) -> Result<String> {
        let tool = program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| program.to_string_lossy().to_string());
        log::debug!("{} {:?}", tool, args);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PipelineError::Media {
                tool: tool.clone(),
                message: format!("failed to spawn: {}", e),
            })?;

        if !output.status.success() {
            return Err(PipelineError::Media {
                tool,
                message: format!(
                    "exited with status {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl MediaTool for Ffmpeg {
    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            path.to_string_lossy().to_string(),
        ];
        let out = Self::exec(&self.ffprobe, &args).await?;
        out.trim()
            .parse::<f64>()
            .with_context(|| format!("Unparseable duration for {}: {:?}", path.display(), out))
    }

    async fn has_audio(&self, path: &Path) -> Result<bool> {
        let args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-select_streams".into(),
            "a".into(),
            "-show_entries".into(),
            "stream=index".into(),
            "-of".into(),
            "csv=p=0".into(),
            path.to_string_lossy().to_string(),
        ];
        let out = Self::exec(&self.ffprobe, &args).await?;
        Ok(!out.trim().is_empty())
    }

    async fn run_filter_graph(&self, job: &FilterJob) -> Result<()> {
        Self::exec(&self.ffmpeg, &job.to_args()).await?;
        Ok(())
    }

    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let list_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let list_path = list_dir.join(format!("concat_{}.txt", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&list_path, concat_list(inputs)).await?;

        let args: Vec<String> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.to_string_lossy().to_string(),
            "-c".into(),
            "copy".into(),
            output.to_string_lossy().to_string(),
        ];
        let result = Self::exec(&self.ffmpeg, &args).await;
        let _ = tokio::fs::remove_file(&list_path).await;
        result.map(|_| ())
    }

    async fn loop_still(&self, image: &Path, seconds: u32, output: &Path) -> Result<()> {
        let args: Vec<String> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-loop".into(),
            "1".into(),
            "-i".into(),
            image.to_string_lossy().to_string(),
            "-t".into(),
            seconds.to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            output.to_string_lossy().to_string(),
        ];
        Self::exec(&self.ffmpeg, &args).await?;
        Ok(())
    }
}
