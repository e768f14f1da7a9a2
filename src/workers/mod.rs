//! Downstream job workers
//!
//! Each worker implements the execution framework's Worker contract for
//! one job kind. The notification dispatcher is the canonical example of
//! the engine's failure-classification policy; the recurrence and
//! schedule workers live next to their subsystems.

pub mod notification;

pub use notification::{
    LogNotificationTransport, NotificationDispatchWorker, NotificationTransport,
};
