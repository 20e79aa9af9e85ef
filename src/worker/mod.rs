//! Background workers.

pub mod assignment;
pub mod claims;
pub mod uptime;

pub use assignment::{AssignmentWorker, CycleReport, WorkerError, WorkerStatus};
pub use claims::{ClaimSet, ClaimTicket};
pub use uptime::{TickOutcome, UptimeError, UptimeReporter, UptimeRunner};
