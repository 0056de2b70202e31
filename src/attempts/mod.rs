//! Delivery attempts: the ledger and the terminal outcome of each task.

pub mod ledger;
pub mod model;
pub mod outcome;

pub use model::{Attempt, AttemptOutcome, AttemptView, OutcomeRecord};

/// Hard cap on delivery attempts per task.
pub const MAX_ATTEMPTS: u32 = 2;
