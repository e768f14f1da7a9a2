//! Recurrence subsystem for opsqueue
//!
//! Expands declarative recurrence rules into concrete occurrences and
//! materializes them as entity records:
//! - `rule`: the recurrence rule grammar and parser
//! - `expand`: local wall-clock occurrence generation
//! - `engine`: the expansion worker (drift gate, idempotent
//!   materialization, watermark tracking)

pub mod engine;
pub mod expand;
pub mod rule;

pub use engine::{ExpansionOutcome, RecurrenceEngine, SeriesExpansionWorker};
pub use expand::occurrences_between;
pub use rule::{Frequency, RecurrenceRule, RuleError};
