//! Bounded worker pool for service registration.
//!
//! A fixed set of workers drains a bounded queue. When the queue is full the
//! submitting task runs the job itself, which slows down whoever is
//! registering faster than the backend can absorb.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct RegistrationPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl RegistrationPool {
    pub fn new(workers: usize, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    debug!(worker, "registration worker stopped");
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Queues `job`, or runs it on the calling task when the queue is full.
    pub async fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.tx.try_send(Box::pin(job)) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                debug!("registration queue full, running on caller");
                job.await;
            }
            Err(TrySendError::Closed(job)) => job.await,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for RegistrationPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_jobs_run_on_workers() {
        let pool = RegistrationPool::new(5, 100);
        assert_eq!(pool.worker_count(), 5);

        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.submit(async move {
                let _ = tx.send(i);
            })
            .await;
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(i) = rx.recv().await {
            seen.push(i);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_full_queue_runs_on_caller() {
        let pool = RegistrationPool::new(1, 1);

        // Park the only worker
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        })
        .await;
        started_rx.await.unwrap();

        // Fills the single queue slot
        pool.submit(async {}).await;

        // No room left: runs before submit returns
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.submit(async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;
        assert!(ran.load(Ordering::SeqCst));

        let _ = release_tx.send(());
    }
}
