//! Background worker for periodic and on-demand tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc channel
//! via a `BackgroundRunnable` implementation, with optional periodic tick callbacks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::pipeline::TaskTable;
use crate::quota::MemoryQuotaStore;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on each
/// periodic tick, and how to clean up on shutdown.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

/// On-demand requests for the sweeper.
#[derive(Debug)]
pub enum SweepTask {
    /// Sweep immediately instead of waiting for the next tick.
    RunNow,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub usage_records: usize,
    pub tasks: usize,
}

/// Purges idle usage records from the in-memory quota store and finished
/// entries from the task table.
///
/// Redis-backed records expire through key TTLs and need no sweeping.
/// Cache entries expire lazily on read and are bounded by capacity.
pub struct Sweeper {
    quota: Option<Arc<MemoryQuotaStore>>,
    tasks: Option<TaskTable>,
    task_retention: Duration,
}

impl Sweeper {
    #[must_use]
    pub fn new(task_retention: Duration) -> Self {
        Self {
            quota: None,
            tasks: None,
            task_retention,
        }
    }

    #[must_use]
    pub fn with_quota_store(mut self, store: Arc<MemoryQuotaStore>) -> Self {
        self.quota = Some(store);
        self
    }

    #[must_use]
    pub fn with_task_table(mut self, tasks: TaskTable) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Runs one sweep.
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            usage_records: self.quota.as_ref().map_or(0, |q| q.purge_expired()),
            tasks: self
                .tasks
                .as_ref()
                .map_or(0, |t| t.purge_finished(self.task_retention)),
        };
        if report != SweepReport::default() {
            debug!(
                usage_records = report.usage_records,
                tasks = report.tasks,
                "sweep complete"
            );
        }
        report
    }
}

#[async_trait]
impl BackgroundRunnable for Sweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::RunNow => {
                self.sweep();
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Listens for tasks on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Periodically calls `BackgroundRunnable::on_tick()` at the configured interval
/// 4. Calls `BackgroundRunnable::shutdown()` when stopped
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker with the given runnable and tick interval.
    ///
    /// The channel capacity is fixed at 256.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tick_interval);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            ticks.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = ticks.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or the channel is closed.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stop the worker gracefully, waiting for the worker task to complete.
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

    use colander_core::{ManualClock, QuotaStore};

    use super::*;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    impl CountingRunnable {
        fn new() -> Self {
            Self {
                run_count: Arc::new(AtomicU32::new(0)),
                tick_count: Arc::new(AtomicU32::new(0)),
                shutdown_called: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = String;

        async fn run(&mut self, _task: String) {
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn start_submit_and_stop() {
        let runnable = CountingRunnable::new();
        let run_count = runnable.run_count.clone();
        let shutdown_called = runnable.shutdown_called.clone();

        let mut worker = BackgroundWorker::start(runnable, Duration::from_secs(60));

        worker.submit("task-1".to_string()).await.unwrap();
        worker.submit("task-2".to_string()).await.unwrap();
        worker.submit("task-3".to_string()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(run_count.load(Ordering::SeqCst), 3);

        worker.stop().await;
        assert_eq!(shutdown_called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_periodically() {
        let runnable = CountingRunnable::new();
        let tick_count = runnable.tick_count.clone();

        let mut worker = BackgroundWorker::start(runnable, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;

        assert!(tick_count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_returns_error() {
        let mut worker = BackgroundWorker::start(CountingRunnable::new(), Duration::from_secs(60));
        worker.stop().await;

        let result = worker.submit("late-task".to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sweeper_purges_idle_usage_records() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryQuotaStore::new(
            clock.clone(),
            Duration::from_secs(200),
        ));
        store.reserve("ItemLookup", 1.0).await.unwrap();
        store.release("ItemLookup", 1.0, true).await.unwrap();
        store.reserve("GetReport", 1.0).await.unwrap();
        store.release("GetReport", 1.0, true).await.unwrap();

        let sweeper = Sweeper::new(Duration::from_secs(60)).with_quota_store(store.clone());
        assert_eq!(sweeper.sweep(), SweepReport::default());

        clock.advance(Duration::from_secs(201));
        let report = sweeper.sweep();
        assert_eq!(report.usage_records, 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn sweeper_runs_on_demand() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryQuotaStore::new(
            clock.clone(),
            Duration::from_secs(200),
        ));
        store.reserve("ItemLookup", 1.0).await.unwrap();
        clock.advance(Duration::from_secs(500));

        let sweeper = Sweeper::new(Duration::from_secs(60)).with_quota_store(store.clone());
        let mut worker = BackgroundWorker::start(sweeper, Duration::from_secs(3600));
        worker.submit(SweepTask::RunNow).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        assert!(store.is_empty());
    }
}
