//! Agents: identity, health tracking and fitness scoring.

pub mod health;
pub mod model;
pub mod scorer;

pub use model::{Agent, AgentHealth, AgentSession, AgentStatus, SessionStatus};
