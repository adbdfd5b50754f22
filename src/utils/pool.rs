use anyhow::{anyhow, Result};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Fixed-width worker pool for one resource class. At most `width` tasks
/// submitted through it run at the same time; the rest wait for a permit.
#[derive(Clone)]
pub struct BoundedPool {
    name: String,
    width: usize,
    permits: Arc<Semaphore>,
}

impl BoundedPool {
    pub fn new(name: &str, width: usize) -> Self {
        let width = width.max(1);
        Self {
            name: name.to_string(),
            width,
            permits: Arc::new(Semaphore::new(width)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

/// Outcome of one task, tagged with the key it was submitted under.
pub struct Settled<K, T> {
    pub key: K,
    pub result: Result<T>,
}

/// Single results channel that any number of pools publish into.
///
/// Tasks may be submitted while results are being drained, so the set of
/// in-flight work can grow; [`FanIn::next`] returns `None` once the pending
/// count drops to zero.
pub struct FanIn<K, T> {
    tx: mpsc::UnboundedSender<Settled<K, T>>,
    rx: mpsc::UnboundedReceiver<Settled<K, T>>,
    pending: usize,
}

impl<K, T> Default for FanIn<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> FanIn<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, pending: 0 }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Spawns `task` on the runtime behind a permit from `pool`. Errors and
    /// panics both come back as a failed [`Settled`]; nothing is dropped.
    pub fn submit<F>(&mut self, pool: &BoundedPool, key: K, task: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.pending += 1;
        let tx = self.tx.clone();
        let permits = pool.permits.clone();
        let name = pool.name.clone();
        tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("task panicked in {} pool", name)),
                },
                Err(_) => Err(anyhow!("{} pool is closed", name)),
            };
            let _ = tx.send(Settled { key, result });
        });
    }

    /// Next settled task in completion order.
    pub async fn next(&mut self) -> Option<Settled<K, T>> {
        if self.pending == 0 {
            return None;
        }
        let settled = self.rx.recv().await?;
        self.pending -= 1;
        Some(settled)
    }
}
