//! Tasks: units of work handed to agents.

pub mod model;

pub use model::{Task, TaskPriority, TaskStatus};
