//! Completion signals from agents and their effect on attempts, health and outcomes.

pub mod handler;
pub mod signal;

pub use handler::{CompletionHandler, CompletionReport};
pub use signal::{CompletionPayload, CompletionSignal, Selector};
