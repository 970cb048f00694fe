//! 👷 workers.rs: a fixed crew of tokio tasks, hired once, fed forever.
//!
//! 🎬 *[a channel fills with jobs. eight workers wait.]*
//! *[nobody spawns a new thread pool per call anymore. those days are over.]*
//!
//! The pool is built once per process and handed to whoever needs it. Jobs go into a
//! bounded `async_channel`, workers drain it, results come back on a oneshot per job.
//! A job that panics takes down its own oneshot, not the worker. 🦆

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// A background worker, that does work. duh.
pub trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}

/// 🧑‍🏭 One member of the crew. Drains the queue until the queue closes.
struct PoolWorker {
    id: usize,
    rx: Receiver<Job>,
}

impl Worker for PoolWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 Worker {} started draining the job queue...", self.id);
            loop {
                match self.rx.recv().await {
                    Ok(job) => {
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!("💥 Worker {} caught a panicking job. Shrugged. Moved on.", self.id);
                        }
                    }
                    Err(_) => {
                        // Channel is empty and closed
                        debug!("🏁 Worker {}: queue closed. Clocking out.", self.id);
                        return Ok(());
                    }
                }
            }
        })
    }
}

/// 👷 The crew. Construct once, share by `Arc`, shut down at the end of the process.
pub struct WorkerPool {
    tx: Sender<Job>,
    size: usize,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl WorkerPool {
    /// 🏗️ Spawn `size` workers (at least one). Must be called inside a tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = async_channel::bounded::<Job>(size * 2);
        let handles = (0..size)
            .map(|id| PoolWorker { id, rx: rx.clone() }.start())
            .collect();
        debug!("👷 Worker pool up with {} workers", size);
        Self { tx, size, handles }
    }

    /// 📨 Queue a task; await the returned receiver for its output.
    ///
    /// Waits for queue space when every worker is busy and the queue is full.
    /// A receiver that errors means the task panicked.
    pub async fn submit<F, T>(&self, task: F) -> Result<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // -- 🤷 nobody listening anymore (timed out upstream). the work still counts.
            let _ = done_tx.send(task.await);
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("💀 The worker pool is closed. Nobody is taking jobs."))?;
        Ok(done_rx)
    }

    /// 🗑️ Close the queue and wait for every worker to finish what's already queued.
    pub async fn shutdown(self) -> Result<()> {
        self.tx.close();
        for handle in self.handles {
            handle
                .await
                .context("💀 A worker task did not come home")??;
        }
        Ok(())
    }

    /// 💣 Close the queue and pull the plug on every worker. Queued jobs never run; running
    /// jobs are dropped at their next `.await`, and their receivers error out.
    pub fn abort(self) {
        self.tx.close();
        for handle in &self.handles {
            handle.abort();
        }
        debug!("💣 Worker pool aborted with {} job(s) still queued", self.tx.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn the_one_where_every_job_gets_done_and_answers_back() {
        let the_pool = WorkerPool::new(3);
        let mut receivers = Vec::new();
        for n in 0..10u64 {
            receivers.push(the_pool.submit(async move { n * 2 }).await.expect("💀 submit"));
        }
        let mut answers = Vec::new();
        for rx in receivers {
            answers.push(rx.await.expect("💀 job should answer"));
        }
        assert_eq!(answers, (0..10u64).map(|n| n * 2).collect::<Vec<_>>());
        the_pool.shutdown().await.expect("💀 clean shutdown");
    }

    #[tokio::test]
    async fn the_one_where_concurrency_never_exceeds_the_crew_size() {
        let the_pool = WorkerPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));
        let mut receivers = Vec::new();
        for _ in 0..8 {
            let in_flight = in_flight.clone();
            let high_water = high_water.clone();
            receivers.push(
                the_pool
                    .submit(async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        high_water.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .expect("💀 submit"),
            );
        }
        for rx in receivers {
            rx.await.expect("💀 job should finish");
        }
        assert!(high_water.load(Ordering::SeqCst) <= 2);
        the_pool.shutdown().await.expect("💀 clean shutdown");
    }

    #[tokio::test]
    async fn the_one_where_a_panicking_job_does_not_take_the_worker_with_it() {
        let the_pool = WorkerPool::new(1);
        let doomed = the_pool
            .submit::<_, ()>(async {
                panic!("🧪 intentional test panic");
            })
            .await
            .expect("💀 submit");
        assert!(doomed.await.is_err());

        let survivor = the_pool.submit(async { 42 }).await.expect("💀 submit");
        assert_eq!(survivor.await.expect("💀 worker should still be alive"), 42);
        the_pool.shutdown().await.expect("💀 clean shutdown");
    }

    #[tokio::test]
    async fn the_one_where_abort_does_not_wait_for_the_slowpokes() {
        let the_pool = WorkerPool::new(1);
        let sleeper = the_pool
            .submit(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "☕ finally"
            })
            .await
            .expect("💀 submit");
        let never_started = the_pool.submit(async { 7 }).await.expect("💀 submit");

        the_pool.abort();

        let (sleeper, never_started) = tokio::time::timeout(Duration::from_secs(1), async {
            (sleeper.await, never_started.await)
        })
        .await
        .expect("💀 abort should hang up on every receiver, promptly");
        assert!(sleeper.is_err());
        assert!(never_started.is_err());
    }
}
