//! Backend-agnostic persistence traits.
//!
//! `Store` is the set of statements the orchestration core issues. It is
//! implemented both by the backend itself (each statement auto-commits) and
//! by an open transaction, so component code is written once and the caller
//! decides the transactional scope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agents::model::{Agent, AgentHealth, AgentSession, AgentStatus};
use crate::attempts::model::{Attempt, AttemptOutcome, OutcomeRecord};
use crate::error::DatabaseError;
use crate::events::{CompletionEntry, Event, EventType};
use crate::ops::model::{OutcomeListing, OutcomeSummary};
use crate::tasks::model::{Task, TaskStatus};

#[async_trait]
pub trait Store: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Point a task at a different agent.
    async fn assign_task(
        &self,
        id: Uuid,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Most recently updated `assigned`/`in_progress` task held by an agent.
    async fn find_live_task_for_agent(&self, agent_id: Uuid)
    -> Result<Option<Task>, DatabaseError>;

    // ── Agents ──────────────────────────────────────────────────────

    async fn insert_agent(&self, agent: &Agent) -> Result<(), DatabaseError>;

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError>;

    /// All agents in roster order (creation time, then id).
    async fn list_agents(&self) -> Result<Vec<Agent>, DatabaseError>;

    /// Agents whose status is not `offline`, in roster order.
    async fn list_dispatchable_agents(&self) -> Result<Vec<Agent>, DatabaseError>;

    async fn update_agent_status(
        &self,
        id: Uuid,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    async fn insert_session(&self, session: &AgentSession) -> Result<(), DatabaseError>;

    async fn find_active_session_for_agent(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<AgentSession>, DatabaseError>;

    /// Look up an active session by its runtime session id.
    async fn find_active_session(
        &self,
        session_id: &str,
    ) -> Result<Option<AgentSession>, DatabaseError>;

    // ── Attempts ────────────────────────────────────────────────────

    /// Insert unless `(task_id, attempt_number)` already exists.
    /// Returns `false` when a row was already present.
    async fn insert_attempt_if_absent(&self, attempt: &Attempt) -> Result<bool, DatabaseError>;

    /// Close an attempt only if it is still open. Returns `false` otherwise.
    async fn close_attempt(
        &self,
        id: Uuid,
        outcome: AttemptOutcome,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>, DatabaseError>;

    async fn find_open_attempt(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Attempt>, DatabaseError>;

    /// The task's open attempt, whichever agent holds it.
    async fn find_open_attempt_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Attempt>, DatabaseError>;

    async fn find_latest_closed_attempt(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Attempt>, DatabaseError>;

    async fn count_attempts(&self, task_id: Uuid) -> Result<u32, DatabaseError>;

    /// Attempts of a task ordered by attempt number.
    async fn list_attempts(&self, task_id: Uuid) -> Result<Vec<Attempt>, DatabaseError>;

    /// Distinct agents that already received an attempt of this task.
    async fn list_task_agent_ids(&self, task_id: Uuid) -> Result<Vec<Uuid>, DatabaseError>;

    /// Outcomes of an agent's most recently closed attempts, newest first.
    async fn recent_closed_outcomes(
        &self,
        agent_id: Uuid,
        limit: u32,
    ) -> Result<Vec<AttemptOutcome>, DatabaseError>;

    // ── Agent health ────────────────────────────────────────────────

    async fn get_agent_health(&self, agent_id: Uuid) -> Result<Option<AgentHealth>, DatabaseError>;

    /// Create the health row if missing and bump the matching counter.
    async fn increment_agent_health(
        &self,
        agent_id: Uuid,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn set_agent_degraded(
        &self,
        agent_id: Uuid,
        degraded: bool,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Outcomes ────────────────────────────────────────────────────

    /// Insert unless the task already has an outcome. Returns `false` otherwise.
    async fn insert_outcome_if_absent(&self, outcome: &OutcomeRecord)
    -> Result<bool, DatabaseError>;

    async fn get_outcome(&self, task_id: Uuid) -> Result<Option<OutcomeRecord>, DatabaseError>;

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(&self, event: &Event) -> Result<(), DatabaseError>;

    /// Latest events of a type, joined with agent and task names.
    async fn recent_events(
        &self,
        event_type: EventType,
        limit: u32,
    ) -> Result<Vec<CompletionEntry>, DatabaseError>;

    // ── Ops reporting ───────────────────────────────────────────────

    async fn outcome_summary(&self) -> Result<OutcomeSummary, DatabaseError>;

    async fn list_outcomes(&self, limit: u32) -> Result<Vec<OutcomeListing>, DatabaseError>;

    /// `(attempts, task count)` pairs ordered by attempts.
    async fn retry_distribution(&self) -> Result<Vec<(u32, u64)>, DatabaseError>;
}

/// A store with a schema and transactional scopes.
#[async_trait]
pub trait Database: Store {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Begin a write transaction. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError>;
}

/// An open write transaction.
#[async_trait]
pub trait StoreTransaction: Store {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}
