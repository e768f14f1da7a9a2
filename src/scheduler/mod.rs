//! Cron scheduling subsystem for opsqueue
//!
//! Turns declarative cron schedules into exactly-once-enqueued execution
//! jobs:
//! - `cron`: expression parsing and timezone-aware evaluation
//! - `service`: the periodic tick loop with bounded catch-up
//! - `tasks`: the closed registry of schedule targets and the worker
//!   executing them

pub mod cron;
pub mod service;
pub mod tasks;

pub use cron::{parse_cron_expression, ScheduleError};
pub use service::SchedulerService;
pub use tasks::{ScheduleExecutionWorker, ScheduleTask, ScheduleTaskRegistry, TaskContext};
