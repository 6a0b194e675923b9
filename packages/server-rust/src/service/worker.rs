//! Background worker for periodic and on-demand tasks.
//!
//! Directory refresh, service announcement and exclusive jobs all run as a
//! [`BackgroundRunnable`] driven by a [`BackgroundWorker`]: the runnable gets
//! `on_tick` at a fixed interval and `run` for each task submitted through
//! the handle.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Capacity of the task channel.
const TASK_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Process a single submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

/// A runnable's only task: do the periodic work now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunNow;

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned worker loop.
///
/// Dropping the handle closes the task channel, which also ends the loop;
/// [`BackgroundWorker::stop`] additionally waits for `shutdown` to finish.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop. The first tick fires one `interval` after
    /// start.
    pub fn start(mut runnable: R, interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let name = runnable.name();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            debug!(worker = name, interval_ms = interval.as_millis() as u64, "worker started");

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticker.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
            debug!(worker = name, "worker stopped");
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submits a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker and waits for its `shutdown` hook to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct Counting(Counters);

    #[async_trait]
    impl BackgroundRunnable for Counting {
        type Task = RunNow;

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&mut self, _task: RunNow) {
            self.0.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn submitted_tasks_run_and_stop_calls_shutdown() {
        let counters = Counters::default();
        let mut worker =
            BackgroundWorker::start(Counting(counters.clone()), Duration::from_secs(60));

        worker.submit(RunNow).await.unwrap();
        worker.submit(RunNow).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 2);

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tick_fires_periodically() {
        let counters = Counters::default();
        let mut worker =
            BackgroundWorker::start(Counting(counters.clone()), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(110)).await;
        worker.stop().await;
        assert!(counters.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let mut worker =
            BackgroundWorker::start(Counting(Counters::default()), Duration::from_secs(60));
        worker.stop().await;
        assert!(worker.submit(RunNow).await.is_err());
    }
}
