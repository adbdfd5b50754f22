use crate::core::store::{ProjectStore, ProjectUpdate};
use anyhow::Result;

/// Turns settled-task counts into a persisted, non-decreasing percentage.
///
/// `total` may be an estimate (see [`ProgressReporter::estimated`]); `cap`
/// bounds what is reported before the owning step formally completes.
pub struct ProgressReporter<'a> {
    store: &'a dyn ProjectStore,
    pid: String,
    total: f64,
    cap: u8,
    settled: usize,
    last: u8,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(store: &'a dyn ProjectStore, pid: &str, total: usize) -> Self {
        Self {
            store,
            pid: pid.to_string(),
            total: total as f64,
            cap: 100,
            settled: 0,
            last: 0,
        }
    }

    /// Heuristic variant for task sets whose size is unknown up front. The
    /// anchor step uses `starts * 1.5` and caps at 99 until it finishes.
    pub fn estimated(store: &'a dyn ProjectStore, pid: &str, estimate: f64, cap: u8) -> Self {
        Self {
            store,
            pid: pid.to_string(),
            total: estimate,
            cap: cap.min(100),
            settled: 0,
            last: 0,
        }
    }

    pub fn settled(&self) -> usize {
        self.settled
    }

    pub fn percent(&self) -> u8 {
        self.last
    }

    fn compute(&self) -> u8 {
        if self.total <= 0.0 {
            return self.cap;
        }
        let raw = (self.settled as f64 / self.total * 100.0).floor();
        let pct = raw.clamp(0.0, 100.0) as u8;
        pct.min(self.cap).max(self.last)
    }

    /// Zeroes the persisted progress at the start of a batch.
    pub async fn reset(&mut self) -> Result<()> {
        self.settled = 0;
        self.last = 0;
        self.store
            .update(&self.pid, ProjectUpdate::new().progress(0))
            .await
    }

    /// Records one settled task and persists the new percentage together
    /// with `extra` in a single field-scoped update.
    pub async fn advance(&mut self, extra: ProjectUpdate) -> Result<u8> {
        self.settled += 1;
        self.last = self.compute();
        self.store
            .update(&self.pid, extra.progress(self.last))
            .await?;
        Ok(self.last)
    }
}
