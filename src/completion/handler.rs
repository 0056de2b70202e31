//! Completion handler: folds an agent's completion signal into the ledger,
//! the agent's health and the task's terminal outcome.
//!
//! The whole state transition runs in one immediate transaction. A retry
//! decision is handed to the retry queue only after that transaction commits.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::signal::{CompletionPayload, CompletionSignal, Selector};
use crate::agents::health;
use crate::agents::model::AgentStatus;
use crate::attempts::ledger::{self, CloseResult};
use crate::attempts::outcome::{self, WriteResult};
use crate::attempts::{Attempt, AttemptOutcome, MAX_ATTEMPTS};
use crate::dispatch::retry::{RetryRequest, RetrySender};
use crate::error::{CompletionError, DatabaseError};
use crate::events::{Event, EventType};
use crate::store::{Database, Store};
use crate::tasks::model::{Task, TaskStatus};

/// What the handler did with a completion signal.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub outcome: AttemptOutcome,
    /// The attempt was already closed; nothing changed.
    pub idempotent: bool,
    pub should_retry: bool,
    /// Status the task was finalized to, if it was finalized.
    pub new_status: Option<TaskStatus>,
}

impl CompletionReport {
    fn idempotent(task_id: Uuid, agent_id: Uuid, outcome: AttemptOutcome) -> Self {
        Self {
            task_id,
            agent_id,
            summary: None,
            outcome,
            idempotent: true,
            should_retry: false,
            new_status: None,
        }
    }
}

pub struct CompletionHandler {
    db: Arc<dyn Database>,
    retry_tx: RetrySender,
}

impl CompletionHandler {
    pub fn new(db: Arc<dyn Database>, retry_tx: RetrySender) -> Self {
        Self { db, retry_tx }
    }

    /// Parse a raw webhook payload and apply it.
    pub async fn handle_payload(
        &self,
        payload: CompletionPayload,
    ) -> Result<CompletionReport, CompletionError> {
        let signal = CompletionSignal::from_payload(payload)?;
        self.handle(&signal).await
    }

    pub async fn handle(
        &self,
        signal: &CompletionSignal,
    ) -> Result<CompletionReport, CompletionError> {
        let tx = self.db.begin().await?;
        let (report, retry) = match apply_completion(&*tx, signal).await {
            Ok(applied) => applied,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        if let Some(request) = retry {
            let task_id = request.task_id;
            if let Err(e) = self.retry_tx.send(request) {
                error!(task_id = %task_id, error = %e, "Failed to queue retry");
            }
        }

        Ok(report)
    }
}

/// Resolve the completing task and agent.
async fn resolve<S: Store + ?Sized>(
    store: &S,
    selector: &Selector,
) -> Result<(Task, Uuid), CompletionError> {
    match selector {
        Selector::Task(task_id) => {
            let task = store
                .get_task(*task_id)
                .await?
                .ok_or(CompletionError::TaskNotFound(*task_id))?;
            let agent_id = task
                .assigned_agent_id
                .ok_or(CompletionError::NoAssignedAgent(*task_id))?;
            Ok((task, agent_id))
        }
        Selector::Session(session_id) => {
            let session = store
                .find_active_session(session_id)
                .await?
                .ok_or_else(|| CompletionError::SessionNotFound(session_id.clone()))?;
            let task = store
                .find_live_task_for_agent(session.agent_id)
                .await?
                .ok_or(CompletionError::NoActiveTask(session.agent_id))?;
            Ok((task, session.agent_id))
        }
    }
}

/// Apply a completion inside the caller's transaction.
async fn apply_completion<S: Store + ?Sized>(
    store: &S,
    signal: &CompletionSignal,
) -> Result<(CompletionReport, Option<RetryRequest>), CompletionError> {
    let (task, reporter_id) = resolve(store, &signal.selector).await?;

    let attempt = match ledger::find_open_attempt(store, task.id, reporter_id).await? {
        Some(open) => open,
        None => {
            if let Some(closed) =
                ledger::find_latest_closed_attempt(store, task.id, reporter_id).await?
            {
                info!(task_id = %task.id, agent_id = %reporter_id, "Completion already recorded");
                let stored = closed.outcome.unwrap_or(signal.outcome);
                return Ok((CompletionReport::idempotent(task.id, reporter_id, stored), None));
            }
            match ledger::find_open_attempt_for_task(store, task.id).await? {
                Some(open) => {
                    warn!(
                        task_id = %task.id,
                        reporter_id = %reporter_id,
                        holder_id = %open.agent_id,
                        "Completion credited to the open attempt of another agent"
                    );
                    open
                }
                None => synthesize_attempt(store, task.id, reporter_id).await?,
            }
        }
    };

    // The attempt holder is credited, which differs from the reporter only
    // when the task was reassigned mid-attempt.
    let agent_id = attempt.agent_id;
    let agent_name = store
        .get_agent(agent_id)
        .await?
        .map(|a| a.name)
        .unwrap_or_else(|| "Agent".to_string());

    let now = Utc::now();
    let closed = ledger::close_attempt(
        store,
        attempt.id,
        signal.outcome,
        signal.error.as_deref(),
        now,
    )
    .await?;
    if closed == CloseResult::AlreadyClosed {
        let stored = store
            .get_attempt(attempt.id)
            .await?
            .and_then(|a| a.outcome)
            .unwrap_or(signal.outcome);
        return Ok((CompletionReport::idempotent(task.id, agent_id, stored), None));
    }

    health::record_outcome(store, agent_id, signal.outcome).await?;
    let attempts = ledger::count_attempts(store, task.id).await?;

    let mut retry = None;
    let mut new_status = None;
    if !signal.outcome.is_success() && attempts < MAX_ATTEMPTS {
        info!(
            task_id = %task.id,
            agent = %agent_name,
            attempt_number = attempt.attempt_number,
            "Attempt failed, retry queued"
        );
        retry = Some(RetryRequest {
            task_id: task.id,
            failed_attempt: attempt.attempt_number,
            failed_agent_id: agent_id,
        });
    } else {
        let target = if signal.outcome.is_success() {
            TaskStatus::Testing
        } else {
            TaskStatus::Review
        };
        new_status = Some(target);

        match outcome::write_outcome(store, task.id, signal.outcome, attempts, agent_id).await? {
            WriteResult::Inserted => {
                if !task.status.is_operator_settled() {
                    store.update_task_status(task.id, target, now).await?;
                }
                let event = if signal.outcome.is_success() {
                    Event::new(
                        EventType::TaskCompleted,
                        format!("{agent_name} completed: {}", signal.summary),
                    )
                } else {
                    Event::new(
                        EventType::TaskStatusChanged,
                        format!("{agent_name} failed after {attempts} attempts"),
                    )
                };
                store
                    .append_event(&event.with_agent(agent_id).with_task(task.id))
                    .await?;
            }
            WriteResult::AlreadyExists => {
                warn!(task_id = %task.id, "Task already finalized, status left unchanged");
            }
        }
    }

    store
        .update_agent_status(agent_id, AgentStatus::Standby, now)
        .await?;

    Ok((
        CompletionReport {
            task_id: task.id,
            agent_id,
            summary: Some(signal.summary.clone()),
            outcome: signal.outcome,
            idempotent: false,
            should_retry: retry.is_some(),
            new_status,
        },
        retry,
    ))
}

/// Record an attempt for a completion that arrived without one.
///
/// Refused once the task has used every attempt, so a stray completion can
/// never push the sequence past the cap.
async fn synthesize_attempt<S: Store + ?Sized>(
    store: &S,
    task_id: Uuid,
    agent_id: Uuid,
) -> Result<Attempt, CompletionError> {
    let used = ledger::count_attempts(store, task_id).await?;
    if used >= MAX_ATTEMPTS {
        warn!(task_id = %task_id, agent_id = %agent_id, attempts = used, "Completion without an attempt to close");
        return Err(CompletionError::AttemptsExhausted {
            task_id,
            attempts: used,
        });
    }
    let attempt_number = used + 1;
    warn!(
        task_id = %task_id,
        agent_id = %agent_id,
        attempt_number,
        "Completion without a dispatched attempt, recording one"
    );
    let attempt = Attempt::open(task_id, agent_id, attempt_number, None, Utc::now());
    if !store.insert_attempt_if_absent(&attempt).await? {
        return Err(DatabaseError::Constraint(format!(
            "attempt {attempt_number} of task {task_id} already exists"
        ))
        .into());
    }
    Ok(attempt)
}
