//! Typed events appended to the console's event log.
//!
//! The orchestration core only writes these; dashboards read them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskDispatched,
    TaskAssigned,
    TaskCompleted,
    TaskStatusChanged,
    AgentStatusChanged,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskDispatched => write!(f, "task_dispatched"),
            Self::TaskAssigned => write!(f, "task_assigned"),
            Self::TaskCompleted => write!(f, "task_completed"),
            Self::TaskStatusChanged => write!(f, "task_status_changed"),
            Self::AgentStatusChanged => write!(f, "agent_status_changed"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_dispatched" => Ok(Self::TaskDispatched),
            "task_assigned" => Ok(Self::TaskAssigned),
            "task_completed" => Ok(Self::TaskCompleted),
            "task_status_changed" => Ok(Self::TaskStatusChanged),
            "agent_status_changed" => Ok(Self::AgentStatusChanged),
            _ => Err(format!("Unknown event type: {}", s)),
        }
    }
}

/// One entry of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            agent_id: None,
            task_id: None,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// A completion event joined with agent and task names for display.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEntry {
    #[serde(flatten)]
    pub event: Event,
    pub agent_name: Option<String>,
    pub task_title: Option<String>,
}
