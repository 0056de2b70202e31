//! Dispatch decision engine: picks the agent for an attempt and delivers the task.
//!
//! Selection, reassignment, attempt numbering and session resolution run in
//! one write transaction that commits before anything is sent to the
//! runtime. Delivery happens after commit; a failed delivery leaves the
//! attempt open.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::message::build_task_message;
use crate::agents::model::{Agent, AgentSession, AgentStatus};
use crate::agents::{health, scorer};
use crate::attempts::ledger::{self, OpenResult};
use crate::attempts::{Attempt, MAX_ATTEMPTS};
use crate::config::ServerConfig;
use crate::error::DispatchError;
use crate::events::{Event, EventType};
use crate::gateway::{AgentGateway, CHAT_SEND};
use crate::store::{Database, Store};
use crate::tasks::model::{Task, TaskStatus};

/// Where agents put their work and report back.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub projects_path: PathBuf,
    pub completion_url: String,
}

impl DispatchSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            projects_path: config.projects_path.clone(),
            completion_url: config.completion_webhook_url(),
        }
    }
}

/// What a successful dispatch did.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub session_id: String,
    pub attempt_number: u32,
    pub auto_retry: bool,
    pub selection_score: Option<f64>,
    /// The task moved to a different agent for this attempt.
    pub reassigned: bool,
}

/// Everything decided inside the dispatch transaction.
struct DispatchPlan {
    task: Task,
    agent: Agent,
    session: AgentSession,
    attempt: Attempt,
    reassigned: bool,
}

pub struct Dispatcher {
    db: Arc<dyn Database>,
    gateway: Arc<dyn AgentGateway>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        gateway: Arc<dyn AgentGateway>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            settings,
        }
    }

    /// Open the next attempt for `task_id` and send the task to the chosen agent.
    pub async fn dispatch(&self, task_id: Uuid) -> Result<DispatchReceipt, DispatchError> {
        // An unreachable runtime must not consume an attempt.
        self.gateway.connect().await.map_err(|e| {
            warn!(task_id = %task_id, error = %e, "Agent gateway unreachable");
            DispatchError::Gateway(e)
        })?;

        let tx = self.db.begin().await?;
        let plan = match plan_dispatch(&*tx, task_id).await {
            Ok(plan) => plan,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(task_id = %task_id, error = %rb, "Rollback failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        self.deliver(&plan).await?;
        self.mark_in_progress(&plan).await?;

        info!(
            task_id = %plan.task.id,
            agent = %plan.agent.name,
            attempt_number = plan.attempt.attempt_number,
            reassigned = plan.reassigned,
            "Task dispatched"
        );

        Ok(DispatchReceipt {
            task_id: plan.task.id,
            agent_id: plan.agent.id,
            agent_name: plan.agent.name.clone(),
            session_id: plan.session.session_id.clone(),
            attempt_number: plan.attempt.attempt_number,
            auto_retry: plan.attempt.auto_retry,
            selection_score: plan.attempt.selection_score,
            reassigned: plan.reassigned,
        })
    }

    async fn deliver(&self, plan: &DispatchPlan) -> Result<(), DispatchError> {
        let message = build_task_message(
            &plan.task,
            &plan.agent,
            &self.settings.projects_path,
            &self.settings.completion_url,
        );
        let params = serde_json::json!({
            "sessionKey": plan.session.session_key(&plan.agent),
            "message": message,
            "idempotencyKey": format!("dispatch-{}-{}", plan.task.id, Utc::now().timestamp_millis()),
        });

        self.gateway
            .call(CHAT_SEND, params)
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(
                    task_id = %plan.task.id,
                    agent = %plan.agent.name,
                    attempt_number = plan.attempt.attempt_number,
                    error = %e,
                    "Delivery failed, attempt left open"
                );
                DispatchError::Delivery {
                    task_id: plan.task.id,
                    attempt_number: plan.attempt.attempt_number,
                    source: e,
                }
            })
    }

    /// Record that the agent is working on the task.
    ///
    /// Skipped when a completion already closed the attempt, so a fast
    /// reply is not overwritten.
    async fn mark_in_progress(&self, plan: &DispatchPlan) -> Result<(), DispatchError> {
        let tx = self.db.begin().await?;
        let still_open = tx
            .get_attempt(plan.attempt.id)
            .await?
            .is_some_and(|a| a.is_open());
        if !still_open {
            tx.rollback().await?;
            return Ok(());
        }

        let now = Utc::now();
        tx.update_task_status(plan.task.id, TaskStatus::InProgress, now)
            .await?;
        tx.update_agent_status(plan.agent.id, AgentStatus::Working, now)
            .await?;
        tx.append_event(
            &Event::new(
                EventType::TaskDispatched,
                format!("Task \"{}\" dispatched to {}", plan.task.title, plan.agent.name),
            )
            .with_agent(plan.agent.id)
            .with_task(plan.task.id),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Decide and record the next attempt. Runs inside the dispatch transaction.
async fn plan_dispatch<S: Store + ?Sized>(
    store: &S,
    task_id: Uuid,
) -> Result<DispatchPlan, DispatchError> {
    let task = store
        .get_task(task_id)
        .await?
        .ok_or(DispatchError::TaskNotFound(task_id))?;
    let assigned_id = task
        .assigned_agent_id
        .ok_or(DispatchError::NoAssignedAgent(task_id))?;
    let assigned = store
        .get_agent(assigned_id)
        .await?
        .ok_or(DispatchError::AgentNotFound(assigned_id))?;

    if let Some(open) = ledger::find_open_attempt_for_task(store, task_id).await? {
        info!(
            task_id = %task_id,
            attempt_number = open.attempt_number,
            "Attempt still open, dispatch refused"
        );
        return Err(DispatchError::Conflict {
            task_id,
            attempt_number: open.attempt_number,
        });
    }

    let used = ledger::count_attempts(store, task_id).await?;
    let attempt_number = used + 1;
    if attempt_number > MAX_ATTEMPTS {
        info!(task_id = %task_id, attempts = used, "Attempts exhausted");
        return Err(DispatchError::AttemptsExhausted {
            task_id,
            attempts: used,
        });
    }

    let (agent, score) = if attempt_number == 1 {
        let score = scorer::score(&health::snapshot(store, assigned.id).await?);
        (assigned.clone(), score)
    } else {
        let mut pool = Vec::new();
        for candidate in store.list_dispatchable_agents().await? {
            let score = scorer::score(&health::snapshot(store, candidate.id).await?);
            pool.push((candidate, score));
        }
        let tried = store.list_task_agent_ids(task_id).await?;
        match select_candidate(pool, &tried) {
            Some(choice) => choice,
            None => {
                warn!(task_id = %task_id, "No dispatchable agents, keeping assigned agent");
                let score = scorer::score(&health::snapshot(store, assigned.id).await?);
                (assigned.clone(), score)
            }
        }
    };

    let now = Utc::now();
    let reassigned = agent.id != assigned.id;
    if reassigned {
        store.assign_task(task_id, agent.id, now).await?;
        store
            .append_event(
                &Event::new(
                    EventType::TaskAssigned,
                    format!("Task \"{}\" reassigned to {} for retry", task.title, agent.name),
                )
                .with_agent(agent.id)
                .with_task(task_id),
            )
            .await?;
        info!(task_id = %task_id, from = %assigned.name, to = %agent.name, "Task reassigned");
    }

    let attempt = match ledger::open_attempt(store, task_id, agent.id, attempt_number, Some(score)).await? {
        OpenResult::Opened(attempt) => attempt,
        OpenResult::Conflict => {
            return Err(DispatchError::Conflict {
                task_id,
                attempt_number,
            });
        }
    };

    let session = match store.find_active_session_for_agent(agent.id).await? {
        Some(session) => session,
        None => {
            let session = AgentSession::for_agent(&agent);
            store.insert_session(&session).await?;
            store
                .append_event(
                    &Event::new(
                        EventType::AgentStatusChanged,
                        format!("{} session created", agent.name),
                    )
                    .with_agent(agent.id),
                )
                .await?;
            session
        }
    };

    let mut task = task;
    task.assigned_agent_id = Some(agent.id);

    Ok(DispatchPlan {
        task,
        agent,
        session,
        attempt,
        reassigned,
    })
}

/// Pick the retry agent from a scored pool in roster order.
///
/// Agents not in `tried` are preferred; when every agent was tried the
/// whole pool is eligible again. Highest score wins, ties keep roster order.
pub fn select_candidate(pool: Vec<(Agent, f64)>, tried: &[Uuid]) -> Option<(Agent, f64)> {
    let (fresh, seen): (Vec<_>, Vec<_>) = pool
        .into_iter()
        .partition(|(agent, _)| !tried.contains(&agent.id));
    let mut eligible = if fresh.is_empty() { seen } else { fresh };
    eligible.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    eligible.into_iter().next()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::*;
    use crate::attempts::AttemptOutcome;
    use crate::gateway::test_support::StubGateway;
    use crate::store::test_support::shared_db;

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<dyn Database>,
        gateway: Arc<StubGateway>,
        dispatcher: Arc<Dispatcher>,
    }

    async fn harness() -> Harness {
        let (dir, db) = shared_db().await;
        let gateway = Arc::new(StubGateway::default());
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            gateway.clone(),
            DispatchSettings {
                projects_path: PathBuf::from("/srv/projects"),
                completion_url: "http://localhost:8080/api/webhooks/agent-completion".into(),
            },
        ));
        Harness {
            _dir: dir,
            db,
            gateway,
            dispatcher,
        }
    }

    async fn add_agent(db: &Arc<dyn Database>, agent: Agent, success: u32, failure: u32) -> Agent {
        db.insert_agent(&agent).await.unwrap();
        for _ in 0..success {
            db.increment_agent_health(agent.id, AttemptOutcome::Success, Utc::now())
                .await
                .unwrap();
        }
        for _ in 0..failure {
            db.increment_agent_health(agent.id, AttemptOutcome::Failed, Utc::now())
                .await
                .unwrap();
        }
        agent
    }

    async fn add_task(db: &Arc<dyn Database>, agent: &Agent) -> Task {
        let task = Task::new("Write release notes").assigned_to(agent.id);
        db.insert_task(&task).await.unwrap();
        task
    }

    /// Close the open attempt of `task` as failed, as a completion would.
    async fn fail_open_attempt(db: &Arc<dyn Database>, task: &Task) {
        let open = db
            .list_attempts(task.id)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.is_open())
            .unwrap();
        db.close_attempt(open.id, AttemptOutcome::Failed, Some("boom"), Utc::now())
            .await
            .unwrap();
    }

    fn agent_named(name: &str, offset_ms: i64) -> Agent {
        let mut agent = Agent::new(name);
        agent.created_at = agent.created_at + chrono::Duration::milliseconds(offset_ms);
        agent
    }

    #[tokio::test]
    async fn first_dispatch_goes_to_assigned_agent() {
        let h = harness().await;
        let agent = add_agent(&h.db, agent_named("Builder", 0), 3, 1).await;
        let task = add_task(&h.db, &agent).await;

        let receipt = h.dispatcher.dispatch(task.id).await.unwrap();
        assert_eq!(receipt.agent_id, agent.id);
        assert_eq!(receipt.attempt_number, 1);
        assert!(!receipt.auto_retry);
        assert!(!receipt.reassigned);
        assert_eq!(receipt.selection_score, Some(0.75));
        assert_eq!(receipt.session_id, "console-builder");

        let sent = h.gateway.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "chat.send");
        assert_eq!(sent[0].1["sessionKey"], "agent:main:console-builder");
        let key = sent[0].1["idempotencyKey"].as_str().unwrap();
        assert!(key.starts_with(&format!("dispatch-{}-", task.id)));
        assert!(sent[0].1["message"].as_str().unwrap().contains("Write release notes"));

        let stored = h.db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        let agent = h.db.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Working);
        assert!(h.db.find_active_session_for_agent(agent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_task_and_agent_are_refused() {
        let h = harness().await;
        let err = h.dispatcher.dispatch(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DispatchError::TaskNotFound(_)));

        let unassigned = Task::new("orphan");
        h.db.insert_task(&unassigned).await.unwrap();
        let err = h.dispatcher.dispatch(unassigned.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoAssignedAgent(_)));

        let ghost = Task::new("ghost").assigned_to(Uuid::new_v4());
        h.db.insert_task(&ghost).await.unwrap();
        let err = h.dispatcher.dispatch(ghost.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn unreachable_gateway_consumes_no_attempt() {
        let h = harness().await;
        let agent = add_agent(&h.db, agent_named("Builder", 0), 0, 0).await;
        let task = add_task(&h.db, &agent).await;
        h.gateway.refuse_connect.store(true, AtomicOrdering::SeqCst);

        let err = h.dispatcher.dispatch(task.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::Gateway(_)));
        assert_eq!(h.db.count_attempts(task.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delivery_failure_leaves_attempt_open() {
        let h = harness().await;
        let agent = add_agent(&h.db, agent_named("Builder", 0), 0, 0).await;
        let task = add_task(&h.db, &agent).await;
        h.gateway.reject_calls.store(true, AtomicOrdering::SeqCst);

        let err = h.dispatcher.dispatch(task.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::Delivery { attempt_number: 1, .. }));

        let open = h.db.find_open_attempt(task.id, agent.id).await.unwrap();
        assert!(open.is_some());
        let stored = h.db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn retry_prefers_best_unused_online_agent() {
        let h = harness().await;
        let first = add_agent(&h.db, agent_named("First", 0), 5, 0).await;
        let _weak = add_agent(&h.db, agent_named("Weak", 1), 1, 1).await;
        let strong = add_agent(&h.db, agent_named("Strong", 2), 9, 1).await;
        let _away = add_agent(
            &h.db,
            agent_named("Away", 3).with_status(AgentStatus::Offline),
            4,
            0,
        )
        .await;
        let task = add_task(&h.db, &first).await;

        h.dispatcher.dispatch(task.id).await.unwrap();
        fail_open_attempt(&h.db, &task).await;

        let receipt = h.dispatcher.dispatch(task.id).await.unwrap();
        assert_eq!(receipt.agent_id, strong.id);
        assert_eq!(receipt.attempt_number, 2);
        assert!(receipt.auto_retry);
        assert!(receipt.reassigned);
        assert_eq!(receipt.selection_score, Some(0.9));

        let stored = h.db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_agent_id, Some(strong.id));
    }

    #[tokio::test]
    async fn retry_reuses_agent_when_no_other_is_available() {
        let h = harness().await;
        let only = add_agent(&h.db, agent_named("Solo", 0), 0, 3).await;
        add_agent(
            &h.db,
            agent_named("Away", 1).with_status(AgentStatus::Offline),
            9,
            0,
        )
        .await;
        let task = add_task(&h.db, &only).await;

        h.dispatcher.dispatch(task.id).await.unwrap();
        fail_open_attempt(&h.db, &task).await;

        let receipt = h.dispatcher.dispatch(task.id).await.unwrap();
        assert_eq!(receipt.agent_id, only.id);
        assert_eq!(receipt.attempt_number, 2);
        assert!(!receipt.reassigned);
    }

    #[tokio::test]
    async fn third_dispatch_is_exhausted() {
        let h = harness().await;
        let agent = add_agent(&h.db, agent_named("Builder", 0), 0, 0).await;
        let task = add_task(&h.db, &agent).await;

        h.dispatcher.dispatch(task.id).await.unwrap();
        fail_open_attempt(&h.db, &task).await;
        h.dispatcher.dispatch(task.id).await.unwrap();

        let err = h.dispatcher.dispatch(task.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::AttemptsExhausted { attempts: 2, .. }));
        assert_eq!(h.db.count_attempts(task.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dispatch_with_open_attempt_conflicts() {
        let h = harness().await;
        let builder = add_agent(&h.db, agent_named("Builder", 0), 0, 0).await;
        add_agent(&h.db, agent_named("Helper", 1), 0, 0).await;
        let task = add_task(&h.db, &builder).await;

        h.dispatcher.dispatch(task.id).await.unwrap();
        let err = h.dispatcher.dispatch(task.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::Conflict { attempt_number: 1, .. }));

        let attempts = h.db.list_attempts(task.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].is_open());
        assert_eq!(h.gateway.sent().len(), 1);
        let stored = h.db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_agent_id, Some(builder.id));
    }

    #[tokio::test]
    async fn undelivered_attempt_blocks_redispatch() {
        let h = harness().await;
        let builder = add_agent(&h.db, agent_named("Builder", 0), 0, 0).await;
        let task = add_task(&h.db, &builder).await;
        h.gateway.reject_calls.store(true, AtomicOrdering::SeqCst);
        h.dispatcher.dispatch(task.id).await.unwrap_err();
        h.gateway.reject_calls.store(false, AtomicOrdering::SeqCst);

        let err = h.dispatcher.dispatch(task.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::Conflict { .. }));
        assert_eq!(h.db.count_attempts(task.id).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatch_opens_a_single_attempt() {
        let h = harness().await;
        let agent = add_agent(&h.db, agent_named("Builder", 0), 0, 0).await;
        add_agent(&h.db, agent_named("Helper", 1), 0, 0).await;
        let task = add_task(&h.db, &agent).await;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = h.dispatcher.clone();
                let task_id = task.id;
                tokio::spawn(async move { dispatcher.dispatch(task_id).await })
            })
            .collect();
        let results = futures::future::join_all(handles).await;

        let mut succeeded = 0;
        for result in results {
            match result.unwrap() {
                Ok(_) => succeeded += 1,
                Err(DispatchError::AttemptsExhausted { .. } | DispatchError::Conflict { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(succeeded, 1);

        let attempts = h.db.list_attempts(task.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt_number, 1);
        assert_eq!(attempts.iter().filter(|a| a.is_open()).count(), 1);
        assert_eq!(h.gateway.sent().len(), 1);
    }

    #[test]
    fn selection_prefers_untried_then_score_then_roster_order() {
        let a = Agent::new("a");
        let b = Agent::new("b");
        let c = Agent::new("c");

        let pool = vec![(a.clone(), 0.9), (b.clone(), 0.5), (c.clone(), 0.5)];
        let (picked, score) = select_candidate(pool, &[a.id]).unwrap();
        assert_eq!(picked.id, b.id);
        assert_eq!(score, 0.5);

        let pool = vec![(a.clone(), 0.2), (b.clone(), 0.6)];
        let (picked, _) = select_candidate(pool, &[a.id, b.id]).unwrap();
        assert_eq!(picked.id, b.id);

        assert!(select_candidate(Vec::new(), &[]).is_none());
    }
}
