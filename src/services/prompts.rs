//! Instruction templates for the generative models. Their wording is not a
//! contract; only the JSON shapes they ask for are.

use crate::core::models::{AssetType, Shot};

pub fn analyzer(user_prompt: &str, source_file: &str) -> String {
    format!(
        "ROLE: Context-aware visual analyst.\n\
         TASK: List the reusable assets visible in the attached image for a video about: \"{user_prompt}\".\n\
         SOURCE FILE: {source_file}\n\n\
         RULES:\n\
         1. Name every distinct character, object or location relevant to the request.\n\
         2. Always include the main subject, even when it is simple.\n\
         3. `type` must be exactly `character`, `object` or `location`.\n\
         4. `extraction_prompt` must recreate the asset in isolation (white background for \
         characters and objects, clean plate for locations).\n\
         OUTPUT: JSON object {{\"items\": [{{\"name\", \"type\", \"extraction_prompt\"}}]}}"
    )
}

pub fn analyzer_context(user_prompt: &str, description: Option<&str>) -> String {
    match description.map(str::trim).filter(|d| !d.is_empty()) {
        Some(desc) => format!(
            "{user_prompt}\n\nCONTEXT: The user supplied this image with the description '{desc}'. \
             Use it to identify the subject."
        ),
        None => user_prompt.to_string(),
    }
}

pub fn detective(potential_assets_json: &str, user_prompt: &str) -> String {
    format!(
        "ROLE: Visual forensic analyst and art director.\n\
         TASK: Settle the final asset list and one visual style for the whole video.\n\n\
         POTENTIAL ASSETS:\n{potential_assets_json}\n\n\
         USER REQUEST: {user_prompt}\n\n\
         RULES:\n\
         1. `visual_style`: one cohesive, high-quality look for every shot.\n\
         2. `negative_prompt`: what to avoid to keep that look.\n\
         3. `assets`: reuse the potential assets where they fit (keep their source_file and set \
         is_supplied), add generated ones where the request needs them.\n\
         4. `creative_brief`: mood, pacing and aesthetic in a few sentences.\n\
         OUTPUT: JSON report with category, target_duration_seconds, visual_style, negative_prompt, \
         assets, creative_brief."
    )
}

pub const ARCHITECT: &str = "ROLE: Film director and cinematographer.\n\
TASK: Turn the attached report into a shot-by-shot video manifest.\n\
CONSTRAINTS: Use only the listed assets and the global visual style.\n\n\
SHOT RULES:\n\
1. `direct` shots last 4, 6 or 8 seconds.\n\
2. `interpolated` shots last exactly 8 seconds and carry an `end_anchor_prompt` describing the closing frame.\n\
3. Aim for 30 to 60 seconds in total unless the report says otherwise.\n\n\
AUDIO RULES:\n\
- A shot has `narration` or `dialogue`, never both.\n\
- Use dialogue only for on-screen characters who speak.\n\n\
For every shot fill cinematography, scene_details, anchor_prompt, veo_prompt and asset_ids, and name every \
referenced asset inside anchor_prompt.\n\
OUTPUT: JSON manifest {timeline, narrator_voice_style, language, estimated_total_duration}.";

pub const CRITIC: &str = "ROLE: Post-production supervisor.\n\
TASK: Audit the director's manifest. You may delete weak shots and rewrite prompts.\n\n\
FAIL THE MANIFEST IF:\n\
1. The total duration is far from the target.\n\
2. An anchor prompt contradicts the requested motion.\n\
3. A shot lists asset_ids that its anchor_prompt never mentions.\n\
4. A veo_prompt describes no motion.\n\
5. A shot has both narration and dialogue.\n\
OUTPUT: JSON {approved, feedback, improved_manifest}. Supply improved_manifest only when not approved.";

pub fn asset_generation(kind: AssetType, visual_style: &str, negative_prompt: &str, visual_prompt: &str) -> String {
    let framing = match kind {
        AssetType::Location => "EMPTY SCENE. NO PEOPLE. Full environment, wide shot, clean plate.",
        _ => "ISOLATED on a PURE #FFFFFF WHITE BACKGROUND. NO SHADOWS. NO GROUNDPLANE.",
    };
    format!(
        "ROLE: Product photographer and CGI artist.\n\
         TASK: A pristine reference image for a video asset.\n\
         TYPE: {}\n\
         VISUAL STYLE: {visual_style}\n\
         REQUIREMENTS: Match the visual style exactly. {framing}\n\
         NEGATIVE PROMPT: {negative_prompt}\n\
         PROMPT: {visual_prompt}",
        kind.as_str().to_uppercase()
    )
}

pub fn asset_extraction(kind: AssetType, extraction_prompt: &str) -> String {
    match kind {
        AssetType::Character | AssetType::Object => format!(
            "ISOLATED on a PURE, BLANK #FFFFFF WHITE BACKGROUND. NO SHADOWS. NO GROUNDPLANE. {extraction_prompt}. \
             Create a precise reference shot based exactly on the provided image. Keep every original \
             color, texture and detail. Whole subject visible, no cropping."
        ),
        AssetType::Location => format!(
            "EMPTY SCENE. NO PEOPLE. {extraction_prompt}. Create a clean plate version based exactly on the \
             provided image. Keep the architecture and lighting. Remove every moving object."
        ),
    }
}

pub fn anchor_header(visual_style: &str, negative_prompt: &str) -> String {
    format!(
        "ROLE: Cinematic concept artist. TASK: Create a photorealistic film still. \
         STYLE: {visual_style}. NEGATIVE PROMPT: {negative_prompt}"
    )
}

pub const ANCHOR_SCENE: &str = "SCENE DESCRIPTION:";
pub const ANCHOR_CONTINUITY: &str = "STARTING FRAME REFERENCE (the new frame must continue it logically):";
pub const ANCHOR_ASSETS: &str = "MANDATORY ASSETS (include these exactly as shown):";
pub const ANCHOR_ENVIRONMENT: &str =
    "ENVIRONMENT REFERENCE (adapt the perspective to the scene but keep these landmarks):";

pub fn anchor_critic(visual_style: &str, prompt: &str) -> String {
    format!(
        "ROLE: VFX compositor and art director.\n\
         TASK: Judge the attached frame against its prompt and the global style.\n\n\
         GLOBAL STYLE: {visual_style}\n\
         ORIGINAL PROMPT: {prompt}\n\n\
         REJECT IF:\n\
         1. It does not match the global style.\n\
         2. Inserted assets look pasted on or lit differently.\n\
         3. Characters are out of scale with the environment.\n\
         4. There are generation artifacts such as warped faces, extra limbs or garbled text.\n\
         On rejection explain why in `feedback` and write a detailed replacement prompt in `improved_prompt`.\n\
         OUTPUT: JSON {{approved, feedback, improved_prompt}}"
    )
}

pub fn veo_optimizer(shot: &Shot, visual_style: &str) -> String {
    let (audio_context, dialogue_lines) = if shot.dialogue.is_empty() {
        ("SILENT", "None".to_string())
    } else {
        (
            "DIALOGUE PRESENT",
            shot.dialogue
                .iter()
                .map(|l| format!("- {}: {}", l.speaker_id, l.text))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    };
    format!(
        "ROLE: Prompt engineer for an image-to-video model.\n\
         TASK: Rewrite the shot details below into one optimized video prompt.\n\n\
         - Original concept: \"{}\"\n\
         - Shot type: {}\n\
         - Camera movement: {}\n\
         - Lighting: {}\n\
         - Subject focus: {}\n\
         - Main action: {}\n\
         - Global style: {visual_style}\n\
         - Audio context: {audio_context}\n\
         - Dialogue lines: {dialogue_lines}\n\n\
         RULES:\n\
         1. One fluid, descriptive paragraph using standard camera and lighting terms.\n\
         2. Describe the action with dynamic verbs.\n\
         3. Quote dialogue lines verbatim (Character says exactly: \"...\"). Without dialogue, state that \
         nobody speaks.\n\
         4. Output only the rewritten prompt.",
        shot.veo_prompt,
        shot.cinematography.shot_type,
        shot.cinematography.movement,
        shot.cinematography.lighting,
        shot.scene_details.subject_focus,
        shot.scene_details.main_action,
    )
}
