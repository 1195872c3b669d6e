//! Media worker pool.
//!
//! A fixed set of media workers started once at boot. Rooms are assigned to
//! workers round-robin. Workers are never respawned: when one dies, every
//! room routed through it is unrecoverable, so the pool cancels the
//! service-wide token after a short grace delay and the process exits.

use crate::config::Config;
use crate::errors::SfuError;
use crate::media::{MediaEngine, MediaWorker};
use crate::observability;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Timing knobs for the pool's background tasks.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolSettings {
    /// Delay between a worker dying and the root token being cancelled.
    pub death_grace: Duration,
    /// Period of the resource usage log.
    pub usage_log_interval: Duration,
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            death_grace: Duration::from_secs(2),
            usage_log_interval: Duration::from_secs(120),
        }
    }
}

impl From<&Config> for WorkerPoolSettings {
    fn from(config: &Config) -> Self {
        Self {
            death_grace: Duration::from_secs(config.worker_death_grace_seconds),
            usage_log_interval: Duration::from_secs(config.worker_usage_log_interval_seconds),
        }
    }
}

/// Fixed-size pool of media workers.
pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    cursor: AtomicUsize,
    worker_died: Arc<AtomicBool>,
    /// Parent of the per-worker monitor and usage tasks.
    tasks_token: CancellationToken,
}

impl WorkerPool {
    /// Start `count` workers sequentially.
    ///
    /// Any worker failing to start aborts initialization with
    /// [`SfuError::WorkerFatal`]. `root_token` is cancelled if a worker later
    /// dies.
    pub async fn initialize(
        engine: Arc<dyn MediaEngine>,
        count: usize,
        settings: WorkerPoolSettings,
        root_token: CancellationToken,
    ) -> Result<Arc<Self>, SfuError> {
        let tasks_token = root_token.child_token();
        let worker_died = Arc::new(AtomicBool::new(false));
        let mut workers: Vec<Arc<dyn MediaWorker>> = Vec::with_capacity(count);

        for index in 0..count {
            let worker = match engine.create_worker(index).await {
                Ok(worker) => worker,
                Err(e) => {
                    error!(
                        target: "sfu.pool",
                        engine = engine.name(),
                        worker_index = index,
                        error = %e,
                        "Media worker failed to start"
                    );
                    tasks_token.cancel();
                    return Err(SfuError::WorkerFatal(format!(
                        "worker {index} failed to start: {e}"
                    )));
                }
            };

            info!(
                target: "sfu.pool",
                engine = engine.name(),
                worker_index = index,
                worker_id = %worker.id(),
                "Media worker started"
            );

            spawn_liveness_monitor(
                index,
                Arc::clone(&worker),
                settings.death_grace,
                root_token.clone(),
                tasks_token.clone(),
                Arc::clone(&worker_died),
            );
            spawn_usage_logger(
                index,
                Arc::clone(&worker),
                settings.usage_log_interval,
                tasks_token.clone(),
            );

            workers.push(worker);
        }

        info!(
            target: "sfu.pool",
            engine = engine.name(),
            workers = workers.len(),
            "Worker pool initialized"
        );

        Ok(Arc::new(Self {
            workers,
            cursor: AtomicUsize::new(0),
            worker_died,
            tasks_token,
        }))
    }

    /// Next worker in round-robin order, skipping dead workers.
    ///
    /// Returns the worker's pool index along with the worker.
    pub fn acquire_worker(&self) -> Result<(usize, Arc<dyn MediaWorker>), SfuError> {
        let len = self.workers.len();
        if len == 0 {
            return Err(SfuError::WorkerPoolEmpty);
        }

        for _ in 0..len {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            if let Some(worker) = self.workers.get(index) {
                if worker.is_alive() {
                    return Ok((index, Arc::clone(worker)));
                }
            }
        }

        Err(SfuError::WorkerFatal("no live media workers".to_string()))
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn live_worker_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    /// Whether any worker has died since startup.
    #[must_use]
    pub fn worker_died(&self) -> bool {
        self.worker_died.load(Ordering::SeqCst)
    }

    /// Stop the monitor and usage tasks.
    pub fn shutdown(&self) {
        self.tasks_token.cancel();
    }
}

fn spawn_liveness_monitor(
    index: usize,
    worker: Arc<dyn MediaWorker>,
    grace: Duration,
    root_token: CancellationToken,
    tasks_token: CancellationToken,
    worker_died: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = tasks_token.cancelled() => return,
            () = wait_for_death(worker.liveness()) => {}
        }

        error!(
            target: "sfu.pool",
            worker_index = index,
            worker_id = %worker.id(),
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Media worker died, shutting down service"
        );
        observability::record_worker_death();
        worker_died.store(true, Ordering::SeqCst);

        tokio::select! {
            () = root_token.cancelled() => {}
            () = tokio::time::sleep(grace) => root_token.cancel(),
        }
    });
}

async fn wait_for_death(mut liveness: watch::Receiver<bool>) {
    // A dropped sender means the worker is gone as well.
    let _ = liveness.wait_for(|alive| !*alive).await;
}

fn spawn_usage_logger(
    index: usize,
    worker: Arc<dyn MediaWorker>,
    interval: Duration,
    tasks_token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = tasks_token.cancelled() => break,
                _ = ticker.tick() => {
                    if !worker.is_alive() {
                        break;
                    }
                    match worker.resource_usage().await {
                        Ok(usage) => info!(
                            target: "sfu.pool",
                            worker_index = index,
                            worker_id = %worker.id(),
                            user_cpu_ms = usage.user_cpu_ms,
                            system_cpu_ms = usage.system_cpu_ms,
                            max_rss_kb = usage.max_rss_kb,
                            "Worker resource usage"
                        ),
                        Err(e) => warn!(
                            target: "sfu.pool",
                            worker_index = index,
                            error = %e,
                            "Failed to read worker resource usage"
                        ),
                    }
                }
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::local::LocalEngine;

    async fn pool_with(
        engine: Arc<LocalEngine>,
        count: usize,
        root: &CancellationToken,
    ) -> Arc<WorkerPool> {
        WorkerPool::initialize(engine, count, WorkerPoolSettings::default(), root.clone())
            .await
            .expect("pool should initialize")
    }

    #[tokio::test]
    async fn test_round_robin_is_cyclic() {
        let root = CancellationToken::new();
        let pool = pool_with(Arc::new(LocalEngine::new()), 3, &root).await;

        let order: Vec<usize> = (0..7)
            .map(|_| pool.acquire_worker().unwrap().0)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);

        root.cancel();
    }

    #[tokio::test]
    async fn test_round_robin_distributes_evenly() {
        let root = CancellationToken::new();
        let pool = pool_with(Arc::new(LocalEngine::new()), 4, &root).await;

        let mut counts = [0usize; 4];
        for _ in 0..400 {
            let (index, _) = pool.acquire_worker().unwrap();
            *counts.get_mut(index).unwrap() += 1;
        }
        assert_eq!(counts, [100, 100, 100, 100]);

        root.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_distributes_evenly() {
        let root = CancellationToken::new();
        let pool = pool_with(Arc::new(LocalEngine::new()), 4, &root).await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let mut indexes = Vec::with_capacity(50);
                    for _ in 0..50 {
                        indexes.push(pool.acquire_worker().unwrap().0);
                        tokio::task::yield_now().await;
                    }
                    indexes
                })
            })
            .collect();

        let mut counts = [0usize; 4];
        for task in tasks {
            for index in task.await.unwrap() {
                *counts.get_mut(index).unwrap() += 1;
            }
        }
        assert_eq!(counts, [100, 100, 100, 100]);

        root.cancel();
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let root = CancellationToken::new();
        let pool = pool_with(Arc::new(LocalEngine::new()), 0, &root).await;

        assert_eq!(pool.worker_count(), 0);
        assert!(matches!(
            pool.acquire_worker(),
            Err(SfuError::WorkerPoolEmpty)
        ));
    }

    #[tokio::test]
    async fn test_worker_start_failure_is_fatal() {
        let root = CancellationToken::new();
        let engine = Arc::new(LocalEngine::new().with_failing_worker(1));

        let result =
            WorkerPool::initialize(engine, 3, WorkerPoolSettings::default(), root.clone()).await;

        assert!(matches!(result, Err(SfuError::WorkerFatal(_))));
        // Startup failure is reported to the caller, not through the root token.
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_dead_workers_are_skipped() {
        let root = CancellationToken::new();
        let engine = Arc::new(LocalEngine::new());
        let pool = pool_with(Arc::clone(&engine), 3, &root).await;

        assert!(engine.kill_worker(1));
        assert_eq!(pool.live_worker_count(), 2);

        let order: Vec<usize> = (0..4)
            .map(|_| pool.acquire_worker().unwrap().0)
            .collect();
        assert_eq!(order, vec![0, 2, 0, 2]);

        root.cancel();
    }

    #[tokio::test]
    async fn test_all_workers_dead() {
        let root = CancellationToken::new();
        let engine = Arc::new(LocalEngine::new());
        let pool = pool_with(Arc::clone(&engine), 2, &root).await;

        engine.kill_worker(0);
        engine.kill_worker(1);

        assert!(matches!(
            pool.acquire_worker(),
            Err(SfuError::WorkerFatal(_))
        ));

        root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_death_cancels_root_after_grace() {
        let root = CancellationToken::new();
        let engine = Arc::new(LocalEngine::new());
        let settings = WorkerPoolSettings {
            death_grace: Duration::from_secs(2),
            usage_log_interval: Duration::from_secs(120),
        };
        let pool = WorkerPool::initialize(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            2,
            settings,
            root.clone(),
        )
        .await
        .unwrap();

        let start = tokio::time::Instant::now();
        engine.kill_worker(0);

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert!(pool.worker_died());
        assert!(!root.is_cancelled(), "root must survive the grace delay");

        tokio::time::timeout(Duration::from_secs(5), root.cancelled())
            .await
            .expect("root token should be cancelled after the grace delay");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_monitors() {
        let root = CancellationToken::new();
        let engine = Arc::new(LocalEngine::new());
        let pool = pool_with(Arc::clone(&engine), 1, &root).await;

        pool.shutdown();
        tokio::task::yield_now().await;

        engine.kill_worker(0);
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert!(!pool.worker_died());
        assert!(!root.is_cancelled());
    }
}
