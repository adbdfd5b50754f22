use crate::core::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// --- Assets ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Character,
    #[default]
    Object,
    Location,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Character => "character",
            AssetType::Object => "object",
            AssetType::Location => "location",
        }
    }

    /// Locations are framed as wide plates, everything else as square sheets.
    pub fn aspect_ratio(&self) -> &'static str {
        match self {
            AssetType::Location => "16:9",
            _ => "1:1",
        }
    }
}

/// Raw candidate found by the ingest analysis of one uploaded file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PotentialAsset {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: AssetType,
    #[serde(default)]
    pub source_file: String,
    #[serde(default)]
    pub extraction_prompt: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AssetAnalysis {
    #[serde(default)]
    pub items: Vec<PotentialAsset>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct AssetDef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: AssetType,
    #[serde(default)]
    pub is_supplied: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_prompt: Option<String>,
    /// Blob path of the finalized reference image.
    #[serde(default, alias = "local_path", skip_serializing_if = "Option::is_none")]
    pub generated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_prompt: Option<String>,
}

impl AssetDef {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.is_supplied && self.source_file.as_deref().map_or(true, str::is_empty) {
            return Err(PipelineError::Validation(format!(
                "asset {} is marked supplied but has no source file",
                self.id
            )));
        }
        Ok(())
    }
}

// --- Report ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCategory {
    AdSpot,
    Explainer,
    #[serde(rename = "narrative_film")]
    Narrative,
    #[serde(rename = "social_media_short")]
    SocialShort,
    ProductShowcase,
    #[serde(rename = "educational_tutorial")]
    Educational,
    #[serde(rename = "corporate_comms")]
    Corporate,
    #[serde(rename = "music_video_visualizer")]
    MusicVisualizer,
    #[serde(rename = "documentary_segment")]
    Documentary,
    #[serde(rename = "movie_trailer")]
    Trailer,
    #[serde(rename = "news_broadcast_segment")]
    News,
    #[serde(rename = "event_recap_sizzle")]
    EventRecap,
    #[serde(rename = "real_estate_tour")]
    RealEstate,
    #[serde(rename = "comedy_skit")]
    Comedy,
    #[serde(rename = "lifestyle_vlog")]
    Lifestyle,
    #[default]
    #[serde(rename = "experimental_art")]
    Experimental,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Report {
    #[serde(default)]
    pub category: VideoCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_duration_seconds: Option<u32>,
    pub visual_style: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub assets: Vec<AssetDef>,
    #[serde(default)]
    pub creative_brief: String,
}

impl Report {
    pub fn asset(&self, id: &str) -> Option<&AssetDef> {
        self.assets.iter().find(|a| a.id == id)
    }
}

// --- Manifest ---

/// Allowed shot lengths. Accepts `4` or `"4"` on input.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "RawDuration", into = "u32")]
pub enum ShotDuration {
    Four,
    Six,
    Eight,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Number(u64),
    Text(String),
}

impl TryFrom<RawDuration> for ShotDuration {
    type Error = String;

    fn try_from(raw: RawDuration) -> Result<Self, Self::Error> {
        let secs = match raw {
            RawDuration::Number(n) => n,
            RawDuration::Text(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid duration {:?}", s))?,
        };
        match secs {
            4 => Ok(ShotDuration::Four),
            6 => Ok(ShotDuration::Six),
            8 => Ok(ShotDuration::Eight),
            other => Err(format!("duration must be 4, 6 or 8 seconds, got {}", other)),
        }
    }
}

impl From<ShotDuration> for u32 {
    fn from(d: ShotDuration) -> u32 {
        d.seconds()
    }
}

impl ShotDuration {
    pub fn seconds(&self) -> u32 {
        match self {
            ShotDuration::Four => 4,
            ShotDuration::Six => 6,
            ShotDuration::Eight => 8,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Cinematography {
    #[serde(default)]
    pub shot_type: String,
    #[serde(default)]
    pub movement: String,
    #[serde(default)]
    pub lighting: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SceneDetails {
    #[serde(default)]
    pub subject_focus: String,
    #[serde(default)]
    pub pre_action_state: String,
    #[serde(default)]
    pub main_action: String,
    #[serde(default)]
    pub environment_context: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DialogueLine {
    pub speaker_id: String,
    pub text: String,
}

/// Fields shared by every shot regardless of mode.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Shot {
    #[serde(default)]
    pub id: String,
    pub duration: ShotDuration,
    #[serde(default)]
    pub cinematography: Cinematography,
    #[serde(default)]
    pub scene_details: SceneDetails,
    #[serde(default)]
    pub anchor_prompt: String,
    #[serde(default)]
    pub veo_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    #[serde(default)]
    pub dialogue: Vec<DialogueLine>,
    #[serde(default)]
    pub asset_ids: Vec<String>,
}

impl Shot {
    pub fn narration_text(&self) -> Option<&str> {
        self.narration
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransitionShot {
    #[serde(flatten)]
    pub shot: Shot,
    pub end_anchor_prompt: String,
}

/// One timed shot. A transition carries the prompt for its closing frame.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "mode")]
pub enum Segment {
    #[serde(rename = "direct", alias = "i2v")]
    Direct(Shot),
    #[serde(rename = "interpolated", alias = "fi")]
    Interpolated(TransitionShot),
}

impl Segment {
    pub fn shot(&self) -> &Shot {
        match self {
            Segment::Direct(shot) => shot,
            Segment::Interpolated(t) => &t.shot,
        }
    }

    pub fn shot_mut(&mut self) -> &mut Shot {
        match self {
            Segment::Direct(shot) => shot,
            Segment::Interpolated(t) => &mut t.shot,
        }
    }

    pub fn id(&self) -> &str {
        &self.shot().id
    }

    pub fn is_interpolated(&self) -> bool {
        matches!(self, Segment::Interpolated(_))
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Segment::Direct(_) => "direct",
            Segment::Interpolated(_) => "interpolated",
        }
    }

    pub fn duration_seconds(&self) -> u32 {
        self.shot().duration.seconds()
    }

    /// Prompt for the requested anchor slot; the end slot falls back to the
    /// start prompt when no dedicated one was written.
    pub fn anchor_prompt(&self, slot: AnchorSlot) -> &str {
        match (self, slot) {
            (Segment::Interpolated(t), AnchorSlot::End) if !t.end_anchor_prompt.is_empty() => {
                &t.end_anchor_prompt
            }
            _ => &self.shot().anchor_prompt,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let shot = self.shot();
        if self.is_interpolated() && shot.duration != ShotDuration::Eight {
            return Err(PipelineError::Validation(format!(
                "segment {}: interpolated shots must last 8 seconds, got {}",
                shot.id,
                shot.duration.seconds()
            )));
        }
        if shot.narration_text().is_some() && !shot.dialogue.is_empty() {
            return Err(PipelineError::Validation(format!(
                "segment {}: narration and dialogue are mutually exclusive",
                shot.id
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Manifest {
    pub timeline: Vec<Segment>,
    #[serde(default)]
    pub narrator_voice_style: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub estimated_total_duration: u32,
}

fn default_language() -> String {
    "en-US".to_string()
}

impl Manifest {
    pub fn recompute_duration(&mut self) {
        self.estimated_total_duration = self.timeline.iter().map(Segment::duration_seconds).sum();
    }

    pub fn segment(&self, id: &str) -> Option<&Segment> {
        self.timeline.iter().find(|s| s.id() == id)
    }

    /// Assigns short ids to segments the planner left unnamed.
    pub fn ensure_ids(&mut self) -> bool {
        let mut changed = false;
        for seg in &mut self.timeline {
            if seg.id().is_empty() {
                seg.shot_mut().id = short_id();
                changed = true;
            }
        }
        changed
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        for seg in &self.timeline {
            seg.validate()?;
        }
        Ok(())
    }
}

// --- Critiques ---

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CritiqueResult {
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub improved_manifest: Option<Manifest>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AnchorCritique {
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub improved_prompt: Option<String>,
}

// --- Project ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Ingest,
    Detective,
    Planning,
    Assets,
    Anchors,
    Production,
    Assembly,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::Ingest,
        Step::Detective,
        Step::Planning,
        Step::Assets,
        Step::Anchors,
        Step::Production,
        Step::Assembly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Ingest => "ingest",
            Step::Detective => "detective",
            Step::Planning => "planning",
            Step::Assets => "assets",
            Step::Anchors => "anchors",
            Step::Production => "production",
            Step::Assembly => "assembly",
        }
    }

    pub fn next(&self) -> Option<Step> {
        let idx = Step::ALL.iter().position(|s| s == self)?;
        Step::ALL.get(idx + 1).copied()
    }

    /// Status a project lands in once this step succeeds.
    pub fn success_status(&self) -> ProjectStatus {
        match self.next() {
            Some(next) => ProjectStatus::Waiting(next),
            None => ProjectStatus::Completed,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingest" => Ok(Step::Ingest),
            "detective" | "detect" => Ok(Step::Detective),
            "planning" | "plan" => Ok(Step::Planning),
            "assets" | "finalize-assets" => Ok(Step::Assets),
            "anchors" => Ok(Step::Anchors),
            "production" => Ok(Step::Production),
            "assembly" => Ok(Step::Assembly),
            other => Err(PipelineError::Validation(format!("invalid step: {}", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProjectStatus {
    #[default]
    Idle,
    Running,
    Waiting(Step),
    Completed,
    Failed,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectStatus::Idle => f.write_str("idle"),
            ProjectStatus::Running => f.write_str("running"),
            ProjectStatus::Waiting(step) => write!(f, "waiting_{}", step),
            ProjectStatus::Completed => f.write_str("completed"),
            ProjectStatus::Failed => f.write_str("failed"),
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(ProjectStatus::Idle),
            "running" => Ok(ProjectStatus::Running),
            "completed" => Ok(ProjectStatus::Completed),
            "failed" => Ok(ProjectStatus::Failed),
            other => match other.strip_prefix("waiting_") {
                Some(step) => Ok(ProjectStatus::Waiting(step.parse()?)),
                None => Err(PipelineError::Validation(format!("invalid status: {}", other))),
            },
        }
    }
}

impl Serialize for ProjectStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProjectStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AnchorSlot {
    Start,
    End,
}

impl AnchorSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorSlot::Start => "start",
            AnchorSlot::End => "end",
        }
    }

    /// Key under which the anchor is recorded in `anchor_map`.
    pub fn key(&self, segment_id: &str) -> String {
        format!("{}_{}", segment_id, self.as_str())
    }
}

impl FromStr for AnchorSlot {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(AnchorSlot::Start),
            "end" => Ok(AnchorSlot::End),
            other => Err(PipelineError::Validation(format!("invalid anchor slot: {}", other))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadedFile {
    pub path: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RenderResult {
    pub url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub file_paths: Vec<UploadedFile>,
    #[serde(default)]
    pub potential_assets: Vec<PotentialAsset>,
    #[serde(default)]
    pub report: Option<Report>,
    #[serde(default)]
    pub manifest: Option<Manifest>,
    #[serde(default)]
    pub asset_map: HashMap<String, AssetDef>,
    #[serde(default)]
    pub anchor_map: HashMap<String, String>,
    #[serde(default)]
    pub video_map: HashMap<String, String>,
    #[serde(default)]
    pub audio_map: HashMap<String, String>,
    #[serde(default)]
    pub current_step: Option<Step>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub current_thought: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<RenderResult>,
}

impl Project {
    pub fn new(owner_id: &str, name: &str, prompt: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            prompt: prompt.to_string(),
            created_at: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            ..Default::default()
        }
    }
}

/// Eight hex characters, used for segment and asset ids.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
