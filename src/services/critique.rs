use crate::core::models::{CritiqueResult, Manifest, Report};
use crate::core::store::{log_project, ProjectStore};
use crate::services::llm::{GenerateRequest, Generator};
use crate::services::prompts;
use crate::utils::text::truncate;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::warn;
use std::time::Duration;

/// What an evaluator says about one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub approved: bool,
    pub feedback: String,
    pub revised_prompt: Option<String>,
}

/// Artifact producer and judge driven by [`CritiqueLoop`].
#[async_trait]
pub trait Critiqued: Send + Sync {
    type Artifact: Send;

    async fn generate(&self, prompt: &str, attempt: usize) -> Result<Self::Artifact>;
    async fn evaluate(&self, artifact: &Self::Artifact, prompt: &str) -> Result<Verdict>;
}

#[derive(Debug)]
pub struct Accepted<A> {
    pub artifact: A,
    /// 1-based number of generations it took.
    pub attempts: usize,
    /// Candidates the evaluator turned down, the accepted one included
    /// when forced. Attempts lost to errors are not counted.
    pub rejections: usize,
    /// True when the final candidate was taken despite a rejection.
    pub forced: bool,
    pub prompt: String,
}

/// Generate, evaluate, revise. Runs at most `attempts` generations; the
/// last candidate is accepted even when rejected so the loop always ends
/// with an artifact. A generation or evaluation error uses up the attempt.
#[derive(Debug, Clone, Copy)]
pub struct CritiqueLoop {
    pub attempts: usize,
    pub error_delay: Duration,
}

impl Default for CritiqueLoop {
    fn default() -> Self {
        Self {
            attempts: 3,
            error_delay: Duration::from_secs(2),
        }
    }
}

impl CritiqueLoop {
    pub fn new(attempts: usize, error_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            error_delay,
        }
    }

    pub async fn run<C: Critiqued + ?Sized>(
        &self,
        label: &str,
        subject: &C,
        initial_prompt: &str,
    ) -> Result<Accepted<C::Artifact>> {
        let mut prompt = initial_prompt.to_string();
        let mut last_error = None;
        let mut rejections = 0;

        for attempt in 0..self.attempts {
            let is_last = attempt + 1 == self.attempts;
            let outcome = async {
                let artifact = subject.generate(&prompt, attempt).await?;
                let verdict = subject.evaluate(&artifact, &prompt).await?;
                Ok::<_, anyhow::Error>((artifact, verdict))
            }
            .await;

            match outcome {
                Ok((artifact, verdict)) if verdict.approved || is_last => {
                    if !verdict.approved {
                        rejections += 1;
                        warn!(
                            "{}: forced acceptance after {} rejections in {} attempts ({})",
                            label,
                            rejections,
                            attempt + 1,
                            truncate(&verdict.feedback, 120)
                        );
                    }
                    return Ok(Accepted {
                        artifact,
                        attempts: attempt + 1,
                        rejections,
                        forced: !verdict.approved,
                        prompt,
                    });
                }
                Ok((_, verdict)) => {
                    rejections += 1;
                    log::info!(
                        "{}: attempt {} rejected: {}",
                        label,
                        attempt,
                        truncate(&verdict.feedback, 120)
                    );
                    if let Some(revised) = verdict.revised_prompt.filter(|p| !p.trim().is_empty()) {
                        prompt = revised;
                    }
                }
                Err(e) => {
                    warn!("{}: attempt {} failed: {}", label, attempt, e);
                    last_error = Some(e);
                    if !is_last {
                        tokio::time::sleep(self.error_delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("{}: no attempts made", label)))
    }
}

/// One-shot manifest audit. A rejected manifest is replaced by the
/// critic's version when one is supplied, with its duration recomputed.
pub async fn review_manifest(
    generator: &Generator,
    store: &dyn ProjectStore,
    pid: &str,
    report: &Report,
    manifest: Manifest,
) -> Result<Manifest> {
    let request = GenerateRequest::new(0.1).text(prompts::CRITIC).text(format!(
        "DETECTIVE REPORT: {}\nDIRECTOR MANIFEST: {}",
        serde_json::to_string(report)?,
        serde_json::to_string(&manifest)?
    ));
    let critique: CritiqueResult = generator.json(Some(pid), &request).await?;
    Ok(apply_critique(store, pid, critique, manifest).await)
}

async fn apply_critique(store: &dyn ProjectStore, pid: &str, critique: CritiqueResult, manifest: Manifest) -> Manifest {
    match critique.improved_manifest {
        Some(mut improved) if !critique.approved => {
            log_project(
                store,
                pid,
                &format!("CRITIQUE APPLIED: {}", truncate(&critique.feedback, 100)),
            )
            .await;
            improved.recompute_duration();
            improved
        }
        _ => {
            log_project(store, pid, "CRITIQUE PASSED.").await;
            manifest
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::models::Project;
    use crate::core::store::JsonProjectStore;
    use crate::services::llm::tests::MockLlm;
    use std::sync::{Arc, Mutex};

    struct Scripted {
        approvals: Vec<bool>,
        fail_generation: Vec<usize>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(approvals: Vec<bool>) -> Self {
            Self {
                approvals,
                fail_generation: Vec::new(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Critiqued for Scripted {
        type Artifact = usize;

        async fn generate(&self, prompt: &str, attempt: usize) -> Result<usize> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail_generation.contains(&attempt) {
                return Err(anyhow!("no image data on try {}", attempt));
            }
            Ok(attempt)
        }

        async fn evaluate(&self, artifact: &usize, _prompt: &str) -> Result<Verdict> {
            let approved = self.approvals.get(*artifact).copied().unwrap_or(false);
            Ok(Verdict {
                approved,
                feedback: "sticker-like compositing".to_string(),
                revised_prompt: Some(format!("revision {}", artifact + 1)),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_rejected_forces_third_artifact() {
        let subject = Scripted::new(vec![false, false, false]);
        let accepted = CritiqueLoop::default().run("anchor s1 start", &subject, "original").await.unwrap();
        assert_eq!(accepted.artifact, 2);
        assert_eq!(accepted.attempts, 3);
        assert_eq!(accepted.rejections, 3);
        assert!(accepted.forced);
        assert_eq!(
            subject.prompts.lock().unwrap().as_slice(),
            &["original", "revision 1", "revision 2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_stops_early() {
        let subject = Scripted::new(vec![false, true]);
        let accepted = CritiqueLoop::default().run("x", &subject, "p").await.unwrap();
        assert_eq!(accepted.artifact, 1);
        assert!(!accepted.forced);
        assert_eq!(accepted.prompt, "revision 1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_consume_attempts() {
        let mut subject = Scripted::new(vec![true, true, true]);
        subject.fail_generation = vec![0, 1];
        let accepted = CritiqueLoop::default().run("x", &subject, "p").await.unwrap();
        assert_eq!(accepted.artifact, 2);
        assert_eq!(accepted.attempts, 3);

        let mut subject = Scripted::new(vec![true, true, true]);
        subject.fail_generation = vec![0, 1, 2];
        let err = CritiqueLoop::default().run("x", &subject, "p").await.unwrap_err();
        assert_eq!(err.to_string(), "no image data on try 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_exclude_errored_attempts() {
        let mut subject = Scripted::new(vec![false, false, false]);
        subject.fail_generation = vec![0, 1];
        let accepted = CritiqueLoop::default().run("x", &subject, "p").await.unwrap();
        assert!(accepted.forced);
        assert_eq!(accepted.attempts, 3);
        assert_eq!(accepted.rejections, 1);
    }

    fn manifest_json(durations: &[u32]) -> String {
        let segs: Vec<String> = durations
            .iter()
            .enumerate()
            .map(|(i, d)| format!(r#"{{"id": "s{}", "mode": "direct", "duration": {}}}"#, i, d))
            .collect();
        format!(r#"{{"timeline": [{}], "estimated_total_duration": 1}}"#, segs.join(","))
    }

    #[tokio::test]
    async fn test_rejected_manifest_is_replaced_and_recounted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonProjectStore::new(Arc::new(NativeStorage::new(dir.path()))));
        let project = Project::new("u", "n", "p");
        store.create(&project).await?;

        let answer = format!(
            r#"{{"approved": false, "feedback": "too long", "improved_manifest": {}}}"#,
            manifest_json(&[4, 8])
        );
        let generator = Generator::new(
            Arc::new(MockLlm::answers(&[answer.as_str()])),
            store.clone(),
            Duration::from_millis(500),
        );
        let report: Report = serde_json::from_str(r#"{"visual_style": "noir"}"#)?;
        let original: Manifest = serde_json::from_str(&manifest_json(&[6, 6, 6]))?;

        let reviewed = review_manifest(&generator, store.as_ref(), &project.id, &report, original).await?;
        assert_eq!(reviewed.timeline.len(), 2);
        assert_eq!(reviewed.estimated_total_duration, 12);

        let logs = store.get(&project.id).await?.unwrap().logs;
        assert!(logs.iter().any(|l| l.contains("CRITIQUE APPLIED: too long")));
        Ok(())
    }

    #[tokio::test]
    async fn test_approved_manifest_is_kept() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonProjectStore::new(Arc::new(NativeStorage::new(dir.path()))));
        let generator = Generator::new(
            Arc::new(MockLlm::answers(&[r#"{"approved": true, "feedback": ""}"#])),
            store.clone(),
            Duration::from_millis(500),
        );
        let report: Report = serde_json::from_str(r#"{"visual_style": "noir"}"#)?;
        let original: Manifest = serde_json::from_str(&manifest_json(&[6]))?;
        let reviewed = review_manifest(&generator, store.as_ref(), "gone", &report, original.clone()).await?;
        assert_eq!(reviewed, original);
        Ok(())
    }
}
