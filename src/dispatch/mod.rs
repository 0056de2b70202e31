//! Dispatching tasks to agents and retrying failed attempts.

pub mod engine;
pub mod message;
pub mod retry;

pub use engine::{DispatchReceipt, DispatchSettings, Dispatcher};
pub use retry::{RetryRequest, RetrySender, retry_channel, spawn_retry_worker};
