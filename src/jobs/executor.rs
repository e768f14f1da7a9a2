//! Execution framework: per-queue worker pools with retry and shutdown

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use super::types::Job;
use super::worker::{WorkContext, WorkError, WorkerRegistry};
use crate::config::ExecutorConfig;

/// Dispatches leased jobs to their workers, one polling pool per queue
///
/// Queues are fully independent: a stalled queue never blocks another,
/// and each has its own concurrency limit. Mutual exclusion across engine
/// instances is delegated entirely to the store's dedup keys and leases.
#[derive(Clone)]
pub struct ExecutionFramework {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    config: ExecutorConfig,
}

impl ExecutionFramework {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<WorkerRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Run the framework until the token is cancelled, then wait a bounded
    /// grace period for in-flight jobs before returning
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        let queues = self.registry.queues();
        info!(
            "Starting execution framework for queues: {}",
            queues.join(", ")
        );

        let mut counters = Vec::new();
        let mut handles = Vec::new();

        for queue in queues {
            let limit = self.config.queues.get(queue).copied().unwrap_or(1);
            let running = Arc::new(AtomicUsize::new(0));
            counters.push((queue, running.clone()));

            let framework = self.clone();
            let token = cancellation_token.clone();
            handles.push(tokio::spawn(async move {
                framework.run_queue(queue, limit, running, token).await;
            }));
        }

        // Lease reaper: returns timed-out running jobs to their queues
        {
            let framework = self.clone();
            let token = cancellation_token.clone();
            handles.push(tokio::spawn(async move {
                framework.run_lease_reaper(token).await;
            }));
        }

        cancellation_token.cancelled().await;
        info!("Execution framework received cancellation signal");

        futures::future::join_all(handles).await;
        self.wait_for_running_jobs(&counters).await;

        info!("Execution framework stopped");
        Ok(())
    }

    async fn run_queue(
        &self,
        queue: &'static str,
        limit: usize,
        running: Arc<AtomicUsize>,
        cancellation_token: CancellationToken,
    ) {
        info!("Starting queue '{}' (max concurrent: {})", queue, limit);
        let mut poll = interval(std::time::Duration::from_millis(
            self.config.poll_interval_ms.max(10),
        ));

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.lease_and_dispatch(queue, limit, &running, &cancellation_token).await {
                        error!("Error processing queue '{}': {}", queue, e);
                    }
                }
                _ = cancellation_token.cancelled() => {
                    debug!("Queue '{}' stopping lease loop", queue);
                    break;
                }
            }
        }
    }

    async fn lease_and_dispatch(
        &self,
        queue: &str,
        limit: usize,
        running: &Arc<AtomicUsize>,
        cancellation_token: &CancellationToken,
    ) -> Result<()> {
        let current = running.load(Ordering::Relaxed);
        if current >= limit {
            debug!("Queue '{}' at concurrency limit ({})", queue, limit);
            return Ok(());
        }

        let now = Utc::now();
        let lease = Duration::seconds(self.config.lease_secs as i64);
        let jobs = self
            .store
            .lease_ready(queue, now, limit - current, lease)
            .await?;

        for job in jobs {
            self.dispatch(job, running.clone(), cancellation_token.child_token());
        }
        Ok(())
    }

    fn dispatch(&self, job: Job, running: Arc<AtomicUsize>, shutdown: CancellationToken) {
        let Some(worker) = self.registry.get(job.kind) else {
            // Closed registry: an unknown kind is a permanent failure
            let store = self.store.clone();
            let kind = job.kind;
            tokio::spawn(async move {
                let message = format!("no worker registered for kind '{}'", kind.as_str());
                error!("Job {} failed permanently: {}", job.id, message);
                if let Err(e) = store.discard(job.id, &message).await {
                    error!("Failed to discard job {}: {}", job.id, e);
                }
            });
            return;
        };

        running.fetch_add(1, Ordering::Relaxed);
        let framework = self.clone();

        tokio::spawn(async move {
            let deadline = Utc::now() + Duration::seconds(framework.config.lease_secs as i64);
            let ctx = WorkContext { deadline, shutdown };
            let start = std::time::Instant::now();

            let result = tokio::time::timeout(
                std::time::Duration::from_secs(framework.config.lease_secs),
                worker.work(&job, &ctx),
            )
            .await;
            let elapsed = start.elapsed();

            match result {
                Ok(Ok(outcome)) => {
                    info!(
                        "Job {} ({}) completed in {:?}{}",
                        job.id,
                        job.kind.as_str(),
                        elapsed,
                        outcome
                            .message
                            .as_deref()
                            .map(|m| format!(": {m}"))
                            .unwrap_or_default()
                    );
                    if let Err(e) = framework.store.complete(job.id).await {
                        error!("Failed to mark job {} completed: {}", job.id, e);
                    }
                }
                Ok(Err(work_error)) => {
                    framework.handle_failure(&job, work_error, elapsed).await;
                }
                Err(_) => {
                    let work_error = WorkError::transient(anyhow::anyhow!(
                        "execution deadline of {}s exceeded",
                        framework.config.lease_secs
                    ));
                    framework.handle_failure(&job, work_error, elapsed).await;
                }
            }

            running.fetch_sub(1, Ordering::Relaxed);
        });
    }

    async fn handle_failure(&self, job: &Job, work_error: WorkError, elapsed: std::time::Duration) {
        let message = format!("{work_error:#}");

        if work_error.is_transient() && job.attempt < job.max_attempts {
            let delay = self.retry_backoff(job.attempt);
            let next_attempt_at = Utc::now() + delay;
            warn!(
                "Job {} ({}) attempt {}/{} failed after {:?}, retrying in {}s: {}",
                job.id,
                job.kind.as_str(),
                job.attempt,
                job.max_attempts,
                elapsed,
                delay.num_seconds(),
                message
            );
            if let Err(e) = self.store.retry(job.id, next_attempt_at, &message).await {
                error!("Failed to mark job {} retryable: {}", job.id, e);
            }
        } else {
            let reason = if work_error.is_transient() {
                "retries exhausted"
            } else {
                "permanent failure"
            };
            error!(
                "Job {} ({}) discarded after attempt {}/{} ({}): {}",
                job.id,
                job.kind.as_str(),
                job.attempt,
                job.max_attempts,
                reason,
                message
            );
            if let Err(e) = self
                .store
                .discard(job.id, &format!("{reason}: {message}"))
                .await
            {
                error!("Failed to discard job {}: {}", job.id, e);
            }
        }
    }

    /// Exponential backoff with jitter, capped at the configured ceiling
    fn retry_backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
        let base = self.config.retry_base_secs;
        let capped = base
            .saturating_mul(1u64 << exponent)
            .min(self.config.retry_max_backoff_secs);
        let jitter = if capped > 0 {
            fastrand::u64(0..=capped / 2)
        } else {
            0
        };
        Duration::seconds((capped + jitter).min(self.config.retry_max_backoff_secs) as i64)
    }

    async fn run_lease_reaper(&self, cancellation_token: CancellationToken) {
        let mut tick = interval(std::time::Duration::from_millis(
            (self.config.poll_interval_ms.max(10)).saturating_mul(5),
        ));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.store.requeue_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(moved) => warn!("Requeued {} jobs with expired leases", moved),
                        Err(e) => error!("Lease reaper failed: {}", e),
                    }
                }
                _ = cancellation_token.cancelled() => break,
            }
        }
    }

    /// Wait for in-flight jobs to finish during shutdown, bounded by the
    /// configured grace period
    async fn wait_for_running_jobs(&self, counters: &[(&'static str, Arc<AtomicUsize>)]) {
        info!("Waiting for running jobs to complete...");
        let start = std::time::Instant::now();
        let grace = std::time::Duration::from_secs(self.config.shutdown_grace_secs);
        let mut check = interval(std::time::Duration::from_millis(250));

        loop {
            let total: usize = counters
                .iter()
                .map(|(_, counter)| counter.load(Ordering::Relaxed))
                .sum();
            if total == 0 {
                info!("All in-flight jobs completed");
                break;
            }
            if start.elapsed() > grace {
                warn!(
                    "Timeout waiting for {} jobs to complete, proceeding with shutdown",
                    total
                );
                break;
            }
            check.tick().await;
        }
    }
}
