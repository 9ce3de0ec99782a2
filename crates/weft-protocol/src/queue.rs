//! Bounded background work with retries.
//!
//! Jobs are queued on a bounded channel (so producers feel back-pressure),
//! run with at most `concurrency` in flight, and retried with exponential
//! backoff while their error is retryable. Outcomes are counted so
//! failures are observable.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::ProtocolError;

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), ProtocolError>> + Send>>;

/// A re-runnable unit of work: each attempt calls it again.
pub type Job = Box<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub concurrency: usize,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            concurrency: 16,
            max_attempts: 4,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

struct Queued {
    name: String,
    job: Job,
}

/// Handle for submitting jobs. Dropping every handle stops the worker once
/// queued jobs have been dispatched.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<Queued>,
    counters: Arc<Counters>,
}

impl WorkQueue {
    /// Spawn the dispatcher task. Must be called inside a Tokio runtime.
    pub fn start(config: QueueConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(dispatch(rx, config, counters.clone()));
        (Self { tx, counters }, worker)
    }

    /// Queue a job, waiting for room if the queue is full.
    pub async fn submit<F, Fut>(&self, name: impl Into<String>, job: F) -> Result<(), ProtocolError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        let queued = Queued {
            name: name.into(),
            job: Box::new(move || Box::pin(job()) as JobFuture),
        };
        self.tx
            .send(queued)
            .await
            .map_err(|_| ProtocolError::Shutdown)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a job without waiting. A full queue is reported, not awaited.
    pub fn try_submit<F, Fut>(&self, name: impl Into<String>, job: F) -> Result<(), ProtocolError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        let queued = Queued {
            name: name.into(),
            job: Box::new(move || Box::pin(job()) as JobFuture),
        };
        self.tx.try_send(queued).map_err(|e| match e {
            mpsc::error::TrySendError::Full(q) => {
                tracing::warn!("queue: full, rejected job {}", q.name);
                ProtocolError::Storage(format!("work queue full, rejected {}", q.name))
            }
            mpsc::error::TrySendError::Closed(_) => ProtocolError::Shutdown,
        })?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Jobs waiting to be dispatched.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
        }
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Queued>, config: QueueConfig, counters: Arc<Counters>) {
    let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
    while let Some(queued) = rx.recv().await {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        let counters = counters.clone();
        let config = config.clone();
        tokio::spawn(async move {
            run_with_retry(&queued, &config, &counters).await;
            drop(permit);
        });
    }
    tracing::debug!("queue: dispatcher stopped");
}

async fn run_with_retry(queued: &Queued, config: &QueueConfig, counters: &Counters) {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match (queued.job)().await {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                tracing::debug!(
                    "queue: {} attempt {attempt} failed, retrying in {delay:?}: {e}",
                    queued.name
                );
                counters.retried.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!("queue: {} failed after {attempt} attempt(s): {e}", queued.name);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    async fn settle(queue: &WorkQueue, done: u64) {
        for _ in 0..1000 {
            let s = queue.stats();
            if s.completed + s.failed >= done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not settle: {:?}", queue.stats());
    }

    #[tokio::test]
    async fn runs_jobs() {
        let (queue, _worker) = WorkQueue::start(QueueConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let hits = hits.clone();
            queue
                .submit("count", move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }
        settle(&queue, 10).await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(queue.stats().completed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_succeeds() {
        let config = QueueConfig {
            retry_backoff: Duration::from_millis(100),
            ..Default::default()
        };
        let (queue, _worker) = WorkQueue::start(config);
        let attempts = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();
        {
            let attempts = attempts.clone();
            queue
                .submit("flaky", move || {
                    let attempts = attempts.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(ProtocolError::NotFound("not yet".into()))
                        } else {
                            Ok(())
                        }
                    }
                })
                .await
                .unwrap();
        }
        settle(&queue, 1).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let stats = queue.stats();
        assert_eq!((stats.completed, stats.retried, stats.failed), (1, 2, 0));
        // 100ms + 200ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let config = QueueConfig {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        let (queue, _worker) = WorkQueue::start(config);
        let attempts = Arc::new(AtomicU32::new(0));
        {
            let attempts = attempts.clone();
            queue
                .submit("doomed", move || {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(ProtocolError::Storage("disk gone".into()))
                    }
                })
                .await
                .unwrap();
        }
        settle(&queue, 1).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let (queue, _worker) = WorkQueue::start(QueueConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        {
            let attempts = attempts.clone();
            queue
                .submit("bad", move || {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(ProtocolError::Security("bad signature".into()))
                    }
                })
                .await
                .unwrap();
        }
        settle(&queue, 1).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().retried, 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let config = QueueConfig {
            concurrency: 2,
            ..Default::default()
        };
        let (queue, _worker) = WorkQueue::start(config);
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            queue
                .submit("slow", move || {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }
        settle(&queue, 8).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn try_submit_reports_full_queue() {
        let config = QueueConfig {
            capacity: 1,
            concurrency: 1,
            ..Default::default()
        };
        let (queue, worker) = WorkQueue::start(config);
        worker.abort();
        let _ = worker.await;
        queue.try_submit("one", || async { Ok(()) }).ok();
        let second = queue.try_submit("two", || async { Ok(()) });
        assert!(second.is_err());
    }
}
