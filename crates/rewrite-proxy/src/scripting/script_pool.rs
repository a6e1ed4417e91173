use crate::config::ScriptPoolConfigFile;
use crate::metrics;
use crate::pipeline::TransactionSnapshot;
use crate::scripting::{ExecutorConfig, PipelineRun, ScriptExecutor, ScriptRegistry};
use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Why the pipeline could not run for a transaction.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("script pool queue full")]
    QueueFull,
    #[error("script pool shut down")]
    ShutDown,
    #[error("script pipeline timed out after {0:?}")]
    TimedOut(Duration),
    #[error("script pipeline cancelled")]
    Cancelled,
}

impl PoolError {
    /// Label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            PoolError::QueueFull => "queue_full",
            PoolError::ShutDown => "shut_down",
            PoolError::TimedOut(_) => "timed_out",
            PoolError::Cancelled => "cancelled",
        }
    }
}

/// Configuration for the script thread pool
#[derive(Clone, Debug)]
pub struct ScriptPoolConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Maximum queue size for pending transactions
    pub queue_size: usize,
    /// Ceiling in milliseconds for running the whole registry on one transaction
    pub timeout_ms: u64,
}

impl Default for ScriptPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: 1000,
            timeout_ms: 5000,
        }
    }
}

impl From<&ScriptPoolConfigFile> for ScriptPoolConfig {
    fn from(file: &ScriptPoolConfigFile) -> Self {
        Self {
            workers: if file.workers == 0 {
                default_workers()
            } else {
                file.workers
            },
            queue_size: file.queue_size,
            timeout_ms: file.timeout_ms,
        }
    }
}

fn default_workers() -> usize {
    (num_cpus::get() / 2).clamp(2, 16) // Min 2, max 16
}

/// Headroom on top of the summed per-script budgets for snapshot handoff and
/// proposal decoding.
const CEILING_GRACE: Duration = Duration::from_millis(250);

/// Transaction ceiling actually enforced by the pool.
///
/// Never shorter than every script hitting its own budget back to back, so
/// scripts that time out cannot cost later scripts their results.
fn pipeline_ceiling(configured_ms: u64, script_timeout: Duration, scripts: usize) -> Duration {
    let configured = Duration::from_millis(configured_ms);
    let budget = u32::try_from(scripts)
        .ok()
        .and_then(|n| script_timeout.checked_mul(n))
        .and_then(|total| total.checked_add(CEILING_GRACE))
        .unwrap_or(Duration::MAX);
    configured.max(budget)
}

/// A transaction submitted to the pool
struct ScriptTask {
    snapshot: TransactionSnapshot,
    result_tx: oneshot::Sender<PipelineRun>,
}

/// Script worker thread
struct ScriptWorker {
    worker_id: usize,
    thread_handle: Option<JoinHandle<()>>,
}

impl ScriptWorker {
    fn spawn(
        worker_id: usize,
        registry: Arc<ScriptRegistry>,
        executor_config: ExecutorConfig,
        work_rx: Receiver<ScriptTask>,
        shutdown_rx: Receiver<()>,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("script-worker-{worker_id}"))
            .spawn(move || {
                debug!("Script worker {} started", worker_id);

                // One sandboxed engine per worker, reused across transactions
                let executor = ScriptExecutor::new(&executor_config);

                loop {
                    // Check for shutdown signal (non-blocking)
                    if shutdown_rx.try_recv().is_ok() {
                        debug!("Script worker {} received shutdown signal", worker_id);
                        break;
                    }

                    // Wait for work with timeout to allow shutdown checks
                    match work_rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(task) => {
                            if task.result_tx.is_closed() {
                                debug!("Script worker {} dropping abandoned task", worker_id);
                                continue;
                            }

                            let start = Instant::now();
                            let run = executor.run(&registry, &task.snapshot);
                            debug!(
                                "Pipeline of {} scripts completed in {:?} on worker {}",
                                run.invocations.len(),
                                start.elapsed(),
                                worker_id
                            );

                            // Send result back (ignore if receiver dropped)
                            let _ = task.result_tx.send(run);
                        }
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                            debug!("Script worker {} channel disconnected", worker_id);
                            break;
                        }
                    }
                }

                debug!("Script worker {} shutting down", worker_id);
            })
            .with_context(|| format!("Failed to spawn script worker thread {worker_id}"))?;

        Ok(Self {
            worker_id,
            thread_handle: Some(handle),
        })
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            debug!("Waiting for script worker {} to finish", self.worker_id);
            let _ = handle.join();
        }
    }
}

/// Thread pool that runs the script pipeline off the async runtime.
///
/// Each worker owns its own `ScriptExecutor`; only the immutable registry is
/// shared between threads.
pub struct ScriptPool {
    workers: Vec<ScriptWorker>,
    work_tx: Sender<ScriptTask>,
    shutdown_tx: Sender<()>,
    config: ScriptPoolConfig,
    ceiling: Duration,
    registry: Arc<ScriptRegistry>,
    in_flight: Arc<AtomicUsize>,
}

impl ScriptPool {
    /// Create a new script pool running `registry`
    pub fn new(
        config: ScriptPoolConfig,
        registry: Arc<ScriptRegistry>,
        executor_config: ExecutorConfig,
    ) -> Result<Self> {
        info!(
            "Creating script pool with {} workers, queue size {}, {} scripts",
            config.workers,
            config.queue_size,
            registry.len()
        );

        let ceiling = pipeline_ceiling(
            config.timeout_ms,
            executor_config.script_timeout,
            registry.len(),
        );
        if ceiling > Duration::from_millis(config.timeout_ms) {
            warn!(
                "Raising pipeline ceiling from {}ms to {:?} to cover {} scripts at {:?} each",
                config.timeout_ms,
                ceiling,
                registry.len(),
                executor_config.script_timeout
            );
        }

        let (work_tx, work_rx) = bounded(config.queue_size);
        let (shutdown_tx, shutdown_rx) = bounded(config.workers);

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let worker = ScriptWorker::spawn(
                worker_id,
                Arc::clone(&registry),
                executor_config.clone(),
                work_rx.clone(),
                shutdown_rx.clone(),
            )?;
            workers.push(worker);
        }

        Ok(Self {
            workers,
            work_tx,
            shutdown_tx,
            config,
            ceiling,
            registry,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run every script against `snapshot`.
    ///
    /// Errors mean the pipeline could not run (queue full, pool shut down,
    /// ceiling exceeded); callers pass the response through unchanged.
    pub async fn execute(
        &self,
        snapshot: TransactionSnapshot,
    ) -> std::result::Result<PipelineRun, PoolError> {
        let (result_tx, result_rx) = oneshot::channel();
        let timeout = self.ceiling;

        self.work_tx
            .try_send(ScriptTask {
                snapshot,
                result_tx,
            })
            .map_err(|e| match e {
                crossbeam::channel::TrySendError::Full(_) => {
                    warn!("Script pool queue is full");
                    PoolError::QueueFull
                }
                crossbeam::channel::TrySendError::Disconnected(_) => {
                    error!("Script pool is shut down");
                    PoolError::ShutDown
                }
            })?;

        let depth = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_pipeline_in_flight(depth);

        let outcome = tokio::time::timeout(timeout, result_rx).await;

        let depth = self.in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::set_pipeline_in_flight(depth);

        outcome
            .map_err(|_| PoolError::TimedOut(timeout))?
            .map_err(|_| PoolError::Cancelled)
    }

    pub fn has_scripts(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    /// Transactions submitted and not yet answered
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    /// Ceiling applied to each transaction
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Gracefully shutdown the pool
    pub fn shutdown(&mut self) {
        if self.workers.iter().all(|w| w.thread_handle.is_none()) {
            return;
        }
        info!(
            "Shutting down script pool with {} workers",
            self.workers.len()
        );

        // Send shutdown signal to all workers
        for _ in 0..self.config.workers {
            let _ = self.shutdown_tx.try_send(());
        }

        // Wait for all workers to finish
        for worker in &mut self.workers {
            worker.shutdown();
        }

        info!("Script pool shutdown complete");
    }
}

impl Drop for ScriptPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FieldMap;
    use crate::scripting::RhaiValidator;

    fn config(workers: usize, queue_size: usize, timeout_ms: u64) -> ScriptPoolConfig {
        ScriptPoolConfig {
            workers,
            queue_size,
            timeout_ms,
        }
    }

    fn registry(sources: &[(&str, &str)]) -> Arc<ScriptRegistry> {
        Arc::new(ScriptRegistry::from_sources(
            sources.iter().copied(),
            &RhaiValidator::default(),
        ))
    }

    fn snapshot(body: &str) -> TransactionSnapshot {
        let mut response = FieldMap::new();
        response.insert("Body".to_string(), body.to_string());
        TransactionSnapshot::from_maps(FieldMap::new(), response)
    }

    #[test]
    fn test_pool_creation() {
        let pool = ScriptPool::new(config(2, 10, 5000), registry(&[]), ExecutorConfig::default())
            .unwrap();
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.in_flight(), 0);
        assert!(!pool.has_scripts());
    }

    #[test]
    fn test_default_config() {
        let config = ScriptPoolConfig::default();

        // Should be at least 2, at most 16
        assert!(config.workers >= 2);
        assert!(config.workers <= 16);
        assert_eq!(config.queue_size, 1000);
        assert_eq!(config.timeout_ms, 5000);
    }

    #[test]
    fn test_config_from_file_auto_workers() {
        let file = ScriptPoolConfigFile {
            workers: 0,
            queue_size: 7,
            timeout_ms: 123,
        };
        let config = ScriptPoolConfig::from(&file);
        assert!((2..=16).contains(&config.workers));
        assert_eq!(config.queue_size, 7);
        assert_eq!(config.timeout_ms, 123);

        let file = ScriptPoolConfigFile {
            workers: 3,
            ..file
        };
        assert_eq!(ScriptPoolConfig::from(&file).workers, 3);
    }

    #[test]
    fn test_pool_double_shutdown() {
        let mut pool =
            ScriptPool::new(config(2, 10, 5000), registry(&[]), ExecutorConfig::default())
                .unwrap();
        pool.shutdown();
        // Second shutdown should be safe (no-op)
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_pool_executes_pipeline() {
        let pool = ScriptPool::new(
            config(2, 10, 5000),
            registry(&[(
                "upper.rhai",
                r#"fn modify(request, response) { #{ body: response["Body"].to_upper() } }"#,
            )]),
            ExecutorConfig::default(),
        )
        .unwrap();

        let run = pool.execute(snapshot("hello")).await.unwrap();
        assert_eq!(run.result.body.as_deref(), Some("HELLO"));
        assert_eq!(run.invocations.len(), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pool_concurrent_transactions_stay_separate() {
        let pool = Arc::new(
            ScriptPool::new(
                config(4, 100, 5000),
                registry(&[(
                    "echo.rhai",
                    r#"fn modify(request, response) { #{ body: "seen:" + response["Body"] } }"#,
                )]),
                ExecutorConfig::default(),
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..32 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let run = pool.execute(snapshot(&format!("tx-{i}"))).await.unwrap();
                (i, run.result.body)
            }));
        }

        for handle in handles {
            let (i, body) = handle.await.unwrap();
            assert_eq!(body, Some(format!("seen:tx-{i}")));
        }
    }

    #[test]
    fn test_pipeline_ceiling_covers_script_budgets() {
        let script = Duration::from_millis(1000);
        assert_eq!(pipeline_ceiling(5000, script, 0), Duration::from_millis(5000));
        assert_eq!(pipeline_ceiling(5000, script, 4), Duration::from_millis(5000));
        assert_eq!(
            pipeline_ceiling(5000, script, 6),
            Duration::from_millis(6000) + CEILING_GRACE
        );
        assert_eq!(pipeline_ceiling(10, script, usize::MAX), Duration::MAX);
    }

    #[test]
    fn test_pool_raises_short_ceiling() {
        let pool = ScriptPool::new(
            config(1, 10, 50),
            registry(&[
                ("1.rhai", "fn modify(request, response) { () }"),
                ("2.rhai", "fn modify(request, response) { () }"),
            ]),
            ExecutorConfig {
                script_timeout: Duration::from_millis(200),
                ..ExecutorConfig::default()
            },
        )
        .unwrap();
        assert_eq!(pool.ceiling(), Duration::from_millis(400) + CEILING_GRACE);
    }

    #[tokio::test]
    async fn test_pool_timed_out_scripts_keep_later_results() {
        let looping = r#"fn modify(request, response) { let x = 0; loop { x += 1; } }"#;
        let pool = ScriptPool::new(
            // Configured ceiling shorter than one looping script
            config(1, 10, 20),
            registry(&[
                ("10-loop.rhai", looping),
                ("20-loop.rhai", looping),
                ("30-loop.rhai", looping),
                (
                    "60-tag.rhai",
                    r#"fn modify(request, response) { #{ headers: #{ "x-tagged": "yes" } } }"#,
                ),
            ]),
            ExecutorConfig {
                script_timeout: Duration::from_millis(50),
                ..ExecutorConfig::default()
            },
        )
        .unwrap();

        let run = pool.execute(snapshot("x")).await.unwrap();
        assert_eq!(run.result.headers["x-tagged"], "yes");
        let outcomes: Vec<_> = run.invocations.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec!["timed_out", "timed_out", "timed_out", "proposal"]);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_pool_error_reasons() {
        assert_eq!(PoolError::QueueFull.reason(), "queue_full");
        assert_eq!(PoolError::ShutDown.reason(), "shut_down");
        assert_eq!(PoolError::TimedOut(Duration::from_millis(1)).reason(), "timed_out");
        assert_eq!(PoolError::Cancelled.reason(), "cancelled");
    }

    #[tokio::test]
    async fn test_pool_after_shutdown_is_error() {
        let mut pool =
            ScriptPool::new(config(1, 1, 1000), registry(&[]), ExecutorConfig::default())
                .unwrap();
        pool.shutdown();

        // Workers are gone, so the queue is disconnected
        let err = pool.execute(snapshot("x")).await.unwrap_err();
        assert!(matches!(err, PoolError::ShutDown | PoolError::Cancelled));
    }
}
