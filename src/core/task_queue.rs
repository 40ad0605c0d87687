//! Bounded queue for background work.
//!
//! Usage counters, outcome counters and request logs are pushed here instead
//! of being awaited on the request path. A single consumer task runs the jobs
//! in order. When the queue is full the job is dropped, counted and logged.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::core::error::Result;
use crate::core::metrics::get_metrics;

struct Job {
    name: &'static str,
    fut: BoxFuture<'static, Result<()>>,
}

pub struct BackgroundQueue {
    // Mutex<Option<…>> allows shutdown to take (drop) the sender, letting the worker drain
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
    dropped: AtomicU64,
}

impl BackgroundQueue {
    /// Create the queue and spawn its worker. Must be called inside a tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(Self::worker(rx, done_tx));
        Self {
            tx: Mutex::new(Some(tx)),
            done_rx: Mutex::new(Some(done_rx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a job without waiting. Returns false if it was dropped.
    pub fn submit<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let job = Job {
            name,
            fut: Box::pin(fut),
        };

        let sent = {
            let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(tx) => tx.try_send(job).map_err(|e| e.to_string()),
                None => Err("queue is shut down".to_string()),
            }
        };

        match sent {
            Ok(()) => true,
            Err(reason) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                get_metrics().background_dropped_total.inc();
                tracing::warn!(job = name, "Background queue rejected job: {}", reason);
                false
            }
        }
    }

    /// Number of jobs dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn worker(mut rx: mpsc::Receiver<Job>, done_tx: oneshot::Sender<()>) {
        while let Some(job) = rx.recv().await {
            if let Err(e) = job.fut.await {
                tracing::warn!(job = job.name, "Background job failed: {}", e);
            }
        }
        tracing::info!("Background queue worker stopped");
        let _ = done_tx.send(());
    }

    /// Stop accepting jobs and wait up to 5 seconds for queued ones to finish.
    pub async fn shutdown(&self) {
        let (taken, done_rx) = {
            let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            let mut done = self.done_rx.lock().unwrap_or_else(|e| e.into_inner());
            (tx.take(), done.take())
        };
        if taken.is_some() {
            drop(taken);
            if let Some(rx) = done_rx {
                let _ = tokio::time::timeout(Duration::from_secs(5), rx).await;
            }
            tracing::info!("Background queue shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::AppError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_run_and_drain_on_shutdown() {
        let queue = BackgroundQueue::new(16);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            assert!(queue.submit("count", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        queue.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let queue = BackgroundQueue::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Occupy the worker so the channel fills up.
        queue.submit("block", async move {
            let _ = release_rx.await;
            Ok(())
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut accepted = 0;
        for _ in 0..5 {
            if queue.submit("extra", async { Ok(()) }) {
                accepted += 1;
            }
        }

        assert!(accepted <= 1);
        assert_eq!(queue.dropped(), 5 - accepted);

        let _ = release_tx.send(());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_job_does_not_stop_worker() {
        let queue = BackgroundQueue::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        queue.submit("fail", async { Err(AppError::Storage("down".into())) });
        let c = counter.clone();
        queue.submit("ok", async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        queue.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let queue = BackgroundQueue::new(4);
        queue.shutdown().await;
        assert!(!queue.submit("late", async { Ok(()) }));
        assert_eq!(queue.dropped(), 1);
    }
}
