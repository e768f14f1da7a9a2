//! Worker contract, registry, and failure classification

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::types::{Job, JobKind};

/// Successful outcome of one job execution
#[derive(Debug, Clone, Default)]
pub struct WorkOutcome {
    /// Human-readable summary recorded in history and logs
    pub message: Option<String>,
}

impl WorkOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_message<S: Into<String>>(message: S) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

/// Failed outcome of one job execution
///
/// Transient errors return the job to the queue until its attempt ceiling;
/// permanent errors discard it after the current attempt.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("transient: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl WorkError {
    pub fn transient<E: Into<anyhow::Error>>(err: E) -> Self {
        WorkError::Transient(err.into())
    }

    pub fn permanent<E: Into<anyhow::Error>>(err: E) -> Self {
        WorkError::Permanent(err.into())
    }

    /// Classify an arbitrary collaborator error by its message markers
    pub fn classify(err: anyhow::Error) -> Self {
        match classify_failure(&format!("{err:#}")) {
            FailureClass::Transient => WorkError::Transient(err),
            FailureClass::Permanent => WorkError::Permanent(err),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, WorkError::Transient(_))
    }
}

/// Failure class assigned by the canonical classification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection closed",
    "temporarily unavailable",
    "temporary failure",
    "rate limit",
    "too many requests",
    "service unavailable",
    "502",
    "503",
    "504",
];

const PERMANENT_MARKERS: &[&str] = &[
    "invalid",
    "not found",
    "malformed",
    "unauthorized",
    "authentication",
    "forbidden",
    "unsupported",
    "unknown channel",
    "unknown recipient",
];

/// Canonical failure classification, shared by all workers
///
/// Transience markers win over permanence markers, and anything that
/// matches neither is retried: an ambiguous failure must never be
/// silently dropped.
pub fn classify_failure(message: &str) -> FailureClass {
    let lowered = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return FailureClass::Transient;
    }
    if PERMANENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return FailureClass::Permanent;
    }
    FailureClass::Transient
}

/// Per-execution context handed to a worker
#[derive(Debug, Clone)]
pub struct WorkContext {
    /// Instant at which the lease ends and the attempt is abandoned
    pub deadline: DateTime<Utc>,
    /// Cancelled when the engine is shutting down
    pub shutdown: CancellationToken,
}

/// A typed handler for one job kind
#[async_trait]
pub trait Worker: Send + Sync {
    /// The kind this worker handles
    fn kind(&self) -> JobKind;

    /// Execute one job attempt
    async fn work(&self, job: &Job, ctx: &WorkContext) -> Result<WorkOutcome, WorkError>;
}

/// Closed mapping from job kinds to their handlers
///
/// Jobs whose kind has no registered worker fail permanently; they are
/// never silently requeued.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<JobKind, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(worker.kind(), worker);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn Worker>> {
        self.workers.get(&kind).cloned()
    }

    /// Queues that have at least one registered worker
    pub fn queues(&self) -> Vec<&'static str> {
        let mut queues: Vec<&'static str> =
            self.workers.keys().map(|kind| kind.queue()).collect();
        queues.sort_unstable();
        queues.dedup();
        queues
    }
}
