//! Durable queue contract and the in-memory implementation
//!
//! The store owns the invariants that make multiple engine instances safe
//! without leader election: at most one non-discarded job per
//! (kind, unique_key), lease-based dequeue, and attempt counting. The
//! SQLite-backed implementation lives in `database::jobs`; the in-memory
//! implementation here backs tests and single-process embeddings.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::types::{Job, JobKind, JobPriority};
use crate::models::JobState;

/// Errors that can occur in the job store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job arguments could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unknown job id
    #[error("Job not found: {id}")]
    NotFound { id: Uuid },

    /// Backend storage failure
    #[error("Database operation failed: {source}")]
    Database {
        #[from]
        source: anyhow::Error,
    },
}

/// A job about to be enqueued
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub args: serde_json::Value,
    pub priority: JobPriority,
    pub max_attempts: i32,
    pub unique_key: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Build a new job for a kind, taking queue, priority and attempt
    /// ceiling from the kind's declaration
    pub fn new<T: serde::Serialize>(kind: JobKind, args: &T) -> Result<Self, StoreError> {
        Ok(Self {
            kind,
            args: serde_json::to_value(args)?,
            priority: kind.default_priority(),
            max_attempts: kind.max_attempts(),
            unique_key: None,
            scheduled_at: None,
        })
    }

    pub fn with_unique_key<S: Into<String>>(mut self, key: S) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}

/// Result of an enqueue attempt
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// The job was inserted
    Enqueued(Job),
    /// A non-discarded job with the same (kind, unique_key) already exists
    Duplicate,
}

impl EnqueueResult {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueResult::Enqueued(_))
    }
}

/// Pending/running job counts for one queue
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub available: usize,
    pub running: usize,
}

/// Contract for the durable queue backing the execution framework
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job; no-ops with `Duplicate` on a dedup-key conflict
    async fn enqueue(&self, new_job: NewJob) -> Result<EnqueueResult, StoreError>;

    /// Claim up to `limit` ready jobs from a queue in priority order,
    /// marking them running under a lease and counting the attempt
    async fn lease_ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Job>, StoreError>;

    /// Record successful completion
    async fn complete(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Return a job to the queue for another attempt at `next_attempt_at`
    async fn retry(
        &self,
        job_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Terminally fail a job, releasing its dedup key
    async fn discard(&self, job_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Return running jobs whose lease expired to the queue (or discard
    /// them when their attempts are exhausted); returns how many moved
    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Delete finished (completed/discarded) jobs older than the cutoff;
    /// retention must outlast the catch-up window or completed
    /// occurrences could re-enqueue
    async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Pending/running counts for one queue
    async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError>;

    /// Fetch a job by id
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;
}

/// Heap entry ordering pending jobs by priority, then schedule time
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    priority: JobPriority,
    scheduled_at: DateTime<Utc>,
    id: Uuid,
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.scheduled_at.cmp(&other.scheduled_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Default)]
struct InMemoryInner {
    jobs: HashMap<Uuid, Job>,
    pending: HashMap<String, BinaryHeap<Reverse<PendingEntry>>>,
    dedup: HashMap<(JobKind, String), Uuid>,
}

/// In-memory job store with deduplication and priority ordering
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<RwLock<InMemoryInner>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<EnqueueResult, StoreError> {
        let mut inner = self.inner.write().await;

        if let Some(key) = &new_job.unique_key {
            let dedup_key = (new_job.kind, key.clone());
            if let Some(existing_id) = inner.dedup.get(&dedup_key) {
                let held = inner
                    .jobs
                    .get(existing_id)
                    .map(|job| job.state != JobState::Discarded)
                    .unwrap_or(false);
                if held {
                    debug!("Skipping duplicate job for key: {}", key);
                    return Ok(EnqueueResult::Duplicate);
                }
            }
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            kind: new_job.kind,
            args: new_job.args,
            queue: new_job.kind.queue().to_string(),
            priority: new_job.priority,
            attempt: 0,
            max_attempts: new_job.max_attempts,
            unique_key: new_job.unique_key,
            scheduled_at: new_job.scheduled_at.unwrap_or(now),
            state: JobState::Available,
            leased_until: None,
            last_error: None,
            created_at: now,
            attempted_at: None,
        };

        if let Some(key) = &job.unique_key {
            inner.dedup.insert((job.kind, key.clone()), job.id);
        }
        inner
            .pending
            .entry(job.queue.clone())
            .or_default()
            .push(Reverse(PendingEntry {
                priority: job.priority,
                scheduled_at: job.scheduled_at,
                id: job.id,
            }));
        inner.jobs.insert(job.id, job.clone());

        Ok(EnqueueResult::Enqueued(job))
    }

    async fn lease_ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut heap = match inner.pending.remove(queue) {
            Some(heap) => heap,
            None => return Ok(Vec::new()),
        };

        let mut leased_ids = Vec::new();
        let mut remaining = BinaryHeap::new();

        while let Some(Reverse(entry)) = heap.pop() {
            if entry.scheduled_at <= now && leased_ids.len() < limit {
                leased_ids.push(entry.id);
            } else {
                remaining.push(Reverse(entry));
            }
        }
        inner.pending.insert(queue.to_string(), remaining);

        let mut leased = Vec::new();
        for id in leased_ids {
            if let Some(job) = inner.jobs.get_mut(&id) {
                // Entries for jobs that were retried or discarded while
                // still referenced by a stale heap entry are skipped.
                if !matches!(job.state, JobState::Available | JobState::Retryable) {
                    continue;
                }
                job.state = JobState::Running;
                job.attempt += 1;
                job.attempted_at = Some(now);
                job.leased_until = Some(now + lease);
                leased.push(job.clone());
            }
        }

        if !leased.is_empty() {
            debug!("Leased {} jobs from queue '{}'", leased.len(), queue);
        }
        Ok(leased)
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound { id: job_id })?;
        job.state = JobState::Completed;
        job.leased_until = None;
        Ok(())
    }

    async fn retry(
        &self,
        job_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound { id: job_id })?;
        job.state = JobState::Retryable;
        job.scheduled_at = next_attempt_at;
        job.leased_until = None;
        job.last_error = Some(error.to_string());

        let entry = PendingEntry {
            priority: job.priority,
            scheduled_at: next_attempt_at,
            id: job_id,
        };
        let queue = job.queue.clone();
        inner.pending.entry(queue).or_default().push(Reverse(entry));
        Ok(())
    }

    async fn discard(&self, job_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound { id: job_id })?;
        job.state = JobState::Discarded;
        job.leased_until = None;
        job.last_error = Some(error.to_string());

        let dedup_key = job.unique_key.clone().map(|key| (job.kind, key));
        if let Some(key) = dedup_key {
            if inner.dedup.get(&key) == Some(&job_id) {
                inner.dedup.remove(&key);
            }
        }
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Running
                    && job.leased_until.map(|until| until < now).unwrap_or(false)
            })
            .map(|job| job.id)
            .collect();

        let mut moved = 0;
        for id in expired {
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            let (exhausted, entry, queue, dedup_key) = {
                let exhausted = job.attempt >= job.max_attempts;
                if exhausted {
                    job.state = JobState::Discarded;
                    job.last_error = Some("lease expired; attempts exhausted".to_string());
                } else {
                    job.state = JobState::Retryable;
                    job.scheduled_at = now;
                    job.last_error = Some("lease expired".to_string());
                }
                job.leased_until = None;
                (
                    exhausted,
                    PendingEntry {
                        priority: job.priority,
                        scheduled_at: now,
                        id,
                    },
                    job.queue.clone(),
                    job.unique_key.clone().map(|key| (job.kind, key)),
                )
            };
            if exhausted {
                if let Some(key) = dedup_key {
                    if inner.dedup.get(&key) == Some(&id) {
                        inner.dedup.remove(&key);
                    }
                }
            } else {
                inner.pending.entry(queue).or_default().push(Reverse(entry));
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let doomed: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| {
                matches!(job.state, JobState::Completed | JobState::Discarded)
                    && job.created_at < cutoff
            })
            .map(|job| job.id)
            .collect();
        for id in &doomed {
            if let Some(job) = inner.jobs.remove(id) {
                if let Some(key) = job.unique_key {
                    let dedup_key = (job.kind, key);
                    if inner.dedup.get(&dedup_key) == Some(id) {
                        inner.dedup.remove(&dedup_key);
                    }
                }
            }
        }
        Ok(doomed.len())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        let inner = self.inner.read().await;
        let mut counts = QueueCounts::default();
        for job in inner.jobs.values() {
            if job.queue != queue {
                continue;
            }
            match job.state {
                JobState::Available | JobState::Retryable => counts.available += 1,
                JobState::Running => counts.running += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(&job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::NotificationArgs;

    fn notification_job() -> NewJob {
        NewJob::new(
            JobKind::NotificationDispatch,
            &NotificationArgs {
                recipient: "ops@example.com".to_string(),
                subject: "test".to_string(),
                body: "body".to_string(),
                channels: vec![],
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_deduplication() {
        let store = InMemoryJobStore::new();

        let first = store
            .enqueue(notification_job().with_unique_key("notify:42"))
            .await
            .unwrap();
        assert!(first.is_enqueued());

        // Same key, higher priority - still deduplicated
        let second = store
            .enqueue(
                notification_job()
                    .with_unique_key("notify:42")
                    .with_priority(JobPriority::High),
            )
            .await
            .unwrap();
        assert!(!second.is_enqueued());

        let counts = store.counts("notifications").await.unwrap();
        assert_eq!(counts.available, 1);
    }

    #[tokio::test]
    async fn test_completed_job_still_holds_dedup_key() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job = match store
            .enqueue(notification_job().with_unique_key("notify:done"))
            .await
            .unwrap()
        {
            EnqueueResult::Enqueued(job) => job,
            EnqueueResult::Duplicate => panic!("expected enqueue"),
        };

        let leased = store
            .lease_ready("notifications", now, 10, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        store.complete(job.id).await.unwrap();

        // The logical occurrence already ran; enqueueing again must no-op
        let again = store
            .enqueue(notification_job().with_unique_key("notify:done"))
            .await
            .unwrap();
        assert!(!again.is_enqueued());
    }

    #[tokio::test]
    async fn test_discard_releases_dedup_key() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job = match store
            .enqueue(notification_job().with_unique_key("notify:drop"))
            .await
            .unwrap()
        {
            EnqueueResult::Enqueued(job) => job,
            EnqueueResult::Duplicate => panic!("expected enqueue"),
        };
        store
            .lease_ready("notifications", now, 1, Duration::minutes(5))
            .await
            .unwrap();
        store.discard(job.id, "permanent failure").await.unwrap();

        let again = store
            .enqueue(notification_job().with_unique_key("notify:drop"))
            .await
            .unwrap();
        assert!(again.is_enqueued());
    }

    #[tokio::test]
    async fn test_lease_priority_ordering() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        store
            .enqueue(notification_job().with_priority(JobPriority::Low))
            .await
            .unwrap();
        store
            .enqueue(notification_job().with_priority(JobPriority::Critical))
            .await
            .unwrap();
        store
            .enqueue(notification_job().with_priority(JobPriority::Normal))
            .await
            .unwrap();

        let leased = store
            .lease_ready("notifications", now, 10, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(leased.len(), 3);
        assert_eq!(leased[0].priority, JobPriority::Critical);
        assert_eq!(leased[1].priority, JobPriority::Normal);
        assert_eq!(leased[2].priority, JobPriority::Low);
    }

    #[tokio::test]
    async fn test_lease_skips_future_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        store
            .enqueue(notification_job().at(now + Duration::minutes(10)))
            .await
            .unwrap();
        store
            .enqueue(notification_job().at(now - Duration::minutes(1)))
            .await
            .unwrap();

        let leased = store
            .lease_ready("notifications", now, 10, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        let counts = store.counts("notifications").await.unwrap();
        assert_eq!(counts.available, 1);
        assert_eq!(counts.running, 1);
    }

    #[tokio::test]
    async fn test_retry_returns_job_to_queue() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job = match store.enqueue(notification_job()).await.unwrap() {
            EnqueueResult::Enqueued(job) => job,
            EnqueueResult::Duplicate => panic!("expected enqueue"),
        };
        let leased = store
            .lease_ready("notifications", now, 1, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(leased[0].attempt, 1);

        store
            .retry(job.id, now + Duration::seconds(30), "smtp timeout")
            .await
            .unwrap();

        // Not ready until the backoff elapses
        let leased = store
            .lease_ready("notifications", now, 1, Duration::minutes(5))
            .await
            .unwrap();
        assert!(leased.is_empty());

        let leased = store
            .lease_ready(
                "notifications",
                now + Duration::minutes(1),
                1,
                Duration::minutes(5),
            )
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_requeue_expired_leases() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        store.enqueue(notification_job()).await.unwrap();
        let leased = store
            .lease_ready("notifications", now, 1, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        // Lease still valid - nothing moves
        let moved = store.requeue_expired(now).await.unwrap();
        assert_eq!(moved, 0);

        let moved = store
            .requeue_expired(now + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(moved, 1);

        let counts = store.counts("notifications").await.unwrap();
        assert_eq!(counts.available, 1);
        assert_eq!(counts.running, 0);
    }
}
