//! Agent Dispatch: task dispatch and retry orchestration for autonomous agents.

pub mod agents;
pub mod api;
pub mod attempts;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ops;
pub mod store;
pub mod tasks;
