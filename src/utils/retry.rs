use crate::core::config::RetryConfig;
use crate::core::error::PipelineError;
use anyhow::Result;
use log::warn;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff: attempt `i` (0-based) that fails waits
/// `base_delay * 2^i` before the next try. The last error is returned
/// unchanged once `retries` extra attempts are used up. Permanent failures
/// (see [`PipelineError::is_permanent`]) are returned at once.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(retries: usize, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
            jitter: false,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.retries, config.base_delay())
    }

    /// Adds up to one second of random delay per wait, for I/O against
    /// shared backends.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.retries || PipelineError::is_permanent(&e) => return Err(e),
                Err(e) => {
                    let mut wait = self.delay_for(attempt);
                    if self.jitter {
                        wait += Duration::from_secs_f64(rand::random::<f64>());
                    }
                    warn!("Retry {}/{} ({}): {}", attempt, self.retries, label, e);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Fixed-delay attempt loop used around image and video generation, where
/// the original error text must survive for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct Attempts {
    pub count: usize,
    pub delay: Duration,
}

impl Attempts {
    pub fn new(count: usize, delay: Duration) -> Self {
        Self {
            count: count.max(1),
            delay,
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..self.count {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} attempt {} failed: {}", label, attempt, e);
                    last_error = Some(e);
                    if attempt + 1 < self.count {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("{}: no attempts made", label)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_after_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(2, Duration::from_secs(5));
        let started = tokio::time::Instant::now();

        let value = policy
            .run("flaky", || {
                let calls = calls.clone();
                let failures = failures.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        failures.fetch_add(1, Ordering::SeqCst);
                        Err(anyhow::anyhow!("boom {}", n))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(5 + 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_unchanged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let err = policy
            .run("always", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("failure #{}", n))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failure #2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = RetryPolicy::new(2, Duration::from_secs(5))
            .run("architect", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PipelineError::Validation("bad shape".into()).into())
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(PipelineError::is_permanent(&err));
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_attempts_keep_original_error() {
        let attempts = Attempts::new(3, Duration::from_secs(2));
        let mut seen = Vec::new();
        let err = attempts
            .run("image", |i| {
                seen.push(i);
                async move { Err::<(), _>(anyhow::anyhow!("quota exceeded on try {}", i)) }
            })
            .await
            .unwrap_err();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(err.to_string(), "quota exceeded on try 2");
    }
}
