//! Ops reporting types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::attempts::model::AttemptOutcome;

/// Raw aggregates over the outcome table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutcomeSummary {
    pub total_tasks: u64,
    pub total_outcomes: u64,
    pub successes: u64,
    pub retried: u64,
    pub avg_attempts: f64,
    pub degraded_agents: u64,
}

/// An outcome row joined with task title and agent name.
#[derive(Debug, Clone)]
pub struct OutcomeListing {
    pub task_id: Uuid,
    pub task_title: Option<String>,
    pub final_status: AttemptOutcome,
    pub attempts: u32,
    pub last_agent_id: Uuid,
    pub agent_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Console-wide delivery metrics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpsOverview {
    pub total_tasks: u64,
    pub total_outcomes: u64,
    pub success_rate: f64,
    pub avg_attempts_per_task: f64,
    pub retry_rate: f64,
    pub degraded_agents: u64,
}

/// Health of one agent as shown on the ops board.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealthReport {
    pub agent_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub total_success: u64,
    pub total_failure: u64,
    pub total_attempts: u64,
    pub success_rate: f64,
    pub last_20_success_rate: f64,
    pub is_degraded: bool,
}

/// A finished task as shown on the ops board.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcomeReport {
    pub task_id: Uuid,
    pub task_title: Option<String>,
    pub final_status: AttemptOutcome,
    pub attempts: u32,
    pub last_agent_id: Uuid,
    pub agent_name: Option<String>,
    pub retry_used: bool,
    pub completed_at: DateTime<Utc>,
}

impl From<OutcomeListing> for TaskOutcomeReport {
    fn from(row: OutcomeListing) -> Self {
        Self {
            task_id: row.task_id,
            task_title: row.task_title,
            final_status: row.final_status,
            attempts: row.attempts,
            last_agent_id: row.last_agent_id,
            agent_name: row.agent_name,
            retry_used: row.attempts > 1,
            completed_at: row.created_at,
        }
    }
}

/// Finished tasks bucketed by attempts consumed.
pub type RetryDistribution = BTreeMap<String, u64>;
