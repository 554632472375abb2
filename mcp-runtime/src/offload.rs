use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("blocking operation '{label}' panicked: {message}")]
    Panicked { label: &'static str, message: String },
    #[error("blocking operation '{label}' was cancelled before completing")]
    Cancelled { label: &'static str },
    #[error("blocking pool is closed")]
    PoolClosed,
}

/// Runs blocking operations on tokio's blocking threads so the control loop
/// keeps serving other requests.
///
/// Dropping the future returned by [`run`](Self::run) does not stop an
/// operation that was already handed to a worker; it runs to completion and
/// its result is discarded.
#[derive(Debug, Clone, Default)]
pub struct BlockingPool {
    permits: Option<Arc<Semaphore>>,
    max_workers: Option<usize>,
    stats: Arc<PoolStats>,
}

#[derive(Debug, Default)]
struct PoolStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub max_workers: Option<usize>,
    pub dispatched: u64,
    pub completed: u64,
    pub panicked: u64,
}

impl BlockingPool {
    /// `None` leaves concurrency to tokio's own blocking-thread limit.
    pub fn new(max_workers: Option<usize>) -> Self {
        let max_workers = max_workers.map(|n| n.max(1));
        Self {
            permits: max_workers.map(|n| Arc::new(Semaphore::new(n))),
            max_workers,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn bounded(max_workers: usize) -> Self {
        Self::new(Some(max_workers))
    }

    /// Suspends the caller until `op` has run on a worker thread.
    ///
    /// The operation's own return value comes back untouched (typically a
    /// `Result` of its own); `OffloadError` only covers the worker itself.
    pub async fn run<F, T>(&self, label: &'static str, op: F) -> Result<T, OffloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = match &self.permits {
            Some(permits) => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| OffloadError::PoolClosed)?,
            ),
            None => None,
        };

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let stats = self.stats.clone();
        let handle = tokio::task::spawn_blocking(move || {
            // Held for the whole operation, even if the caller went away.
            let _permit = permit;
            let value = op();
            stats.completed.fetch_add(1, Ordering::Relaxed);
            value
        });

        match handle.await {
            Ok(value) => Ok(value),
            Err(err) if err.is_panic() => {
                self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(err.into_panic());
                tracing::error!(
                    event = "blocking_operation_panicked",
                    label,
                    message = %message,
                    "Blocking operation panicked"
                );
                Err(OffloadError::Panicked { label, message })
            }
            Err(_) => Err(OffloadError::Cancelled { label }),
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.stats.dispatched.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            max_workers: self.max_workers,
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            panicked: self.stats.panicked.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
