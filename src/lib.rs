//! opsqueue - asynchronous job processing and recurrence scheduling
//!
//! The engine behind a multi-tenant admin platform's background work:
//! cron schedules and recurrence series stored in the database become
//! reliably-executed jobs, exactly once per logical occurrence. Safety
//! against concurrent engine instances comes from storage-enforced dedup
//! keys rather than leader election.

pub mod assets;
pub mod config;
pub mod database;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod recurrence;
pub mod scheduler;
pub mod workers;

pub use config::Config;
pub use database::Database;
pub use errors::{AppError, RepositoryError};
