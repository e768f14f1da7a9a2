//! Job processing subsystem for opsqueue
//!
//! This module provides the execution framework that turns queued jobs
//! into completed work:
//! - `types`: the closed job-kind registry and envelope types
//! - `store`: the durable queue contract and the in-memory implementation
//! - `worker`: the Worker contract, registry, and failure classification
//! - `executor`: per-queue worker pools with retry and shutdown handling

pub mod executor;
pub mod store;
pub mod types;
pub mod worker;

pub use executor::ExecutionFramework;
pub use store::{EnqueueResult, InMemoryJobStore, JobStore, NewJob, StoreError};
pub use types::*;
pub use worker::{WorkContext, WorkError, WorkOutcome, Worker, WorkerRegistry};
