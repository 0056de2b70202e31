//! Attempt ledger: idempotent open/close of per-task delivery attempts.
//!
//! Both writes are single conditional statements, so concurrent callers
//! racing on the same attempt number (or the same close) see exactly one
//! winner without any in-process locking.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{Attempt, AttemptOutcome, AttemptView};
use crate::error::DatabaseError;
use crate::store::Store;

/// Result of [`open_attempt`].
#[derive(Debug, Clone)]
pub enum OpenResult {
    Opened(Attempt),
    /// Another writer already holds this attempt number for the task.
    Conflict,
}

/// Result of [`close_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseResult {
    Closed,
    /// The attempt was closed earlier; nothing was written.
    AlreadyClosed,
}

/// Record a new open attempt unless the number is already taken.
///
/// `auto_retry` is not an input: every attempt after the first is a retry,
/// so it is derived from `attempt_number`.
pub async fn open_attempt<S: Store + ?Sized>(
    store: &S,
    task_id: Uuid,
    agent_id: Uuid,
    attempt_number: u32,
    selection_score: Option<f64>,
) -> Result<OpenResult, DatabaseError> {
    let attempt = Attempt::open(task_id, agent_id, attempt_number, selection_score, Utc::now());
    if !store.insert_attempt_if_absent(&attempt).await? {
        debug!(task_id = %task_id, attempt_number, "Attempt number already taken");
        return Ok(OpenResult::Conflict);
    }
    info!(
        task_id = %task_id,
        agent_id = %agent_id,
        attempt_number,
        auto_retry = attempt.auto_retry,
        "Attempt opened"
    );
    Ok(OpenResult::Opened(attempt))
}

/// Close an open attempt. A second close is a no-op.
pub async fn close_attempt<S: Store + ?Sized>(
    store: &S,
    attempt_id: Uuid,
    outcome: AttemptOutcome,
    error: Option<&str>,
    completed_at: DateTime<Utc>,
) -> Result<CloseResult, DatabaseError> {
    if store
        .close_attempt(attempt_id, outcome, error, completed_at)
        .await?
    {
        info!(attempt_id = %attempt_id, outcome = %outcome, "Attempt closed");
        Ok(CloseResult::Closed)
    } else {
        debug!(attempt_id = %attempt_id, "Attempt already closed");
        Ok(CloseResult::AlreadyClosed)
    }
}

pub async fn find_open_attempt<S: Store + ?Sized>(
    store: &S,
    task_id: Uuid,
    agent_id: Uuid,
) -> Result<Option<Attempt>, DatabaseError> {
    store.find_open_attempt(task_id, agent_id).await
}

/// Open attempt of the task regardless of agent. At most one exists.
pub async fn find_open_attempt_for_task<S: Store + ?Sized>(
    store: &S,
    task_id: Uuid,
) -> Result<Option<Attempt>, DatabaseError> {
    store.find_open_attempt_for_task(task_id).await
}

pub async fn find_latest_closed_attempt<S: Store + ?Sized>(
    store: &S,
    task_id: Uuid,
    agent_id: Uuid,
) -> Result<Option<Attempt>, DatabaseError> {
    store.find_latest_closed_attempt(task_id, agent_id).await
}

pub async fn count_attempts<S: Store + ?Sized>(
    store: &S,
    task_id: Uuid,
) -> Result<u32, DatabaseError> {
    store.count_attempts(task_id).await
}

/// Attempts of a task in order, with durations for closed ones.
pub async fn attempt_history<S: Store + ?Sized>(
    store: &S,
    task_id: Uuid,
) -> Result<Vec<AttemptView>, DatabaseError> {
    let attempts = store.list_attempts(task_id).await?;
    Ok(attempts.iter().map(AttemptView::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::test_db;

    #[tokio::test]
    async fn duplicate_attempt_number_conflicts() {
        let (_dir, db) = test_db().await;
        let task_id = Uuid::new_v4();

        let first = open_attempt(&db, task_id, Uuid::new_v4(), 1, Some(0.8))
            .await
            .unwrap();
        assert!(matches!(first, OpenResult::Opened(ref a) if !a.auto_retry));

        let second = open_attempt(&db, task_id, Uuid::new_v4(), 1, None)
            .await
            .unwrap();
        assert!(matches!(second, OpenResult::Conflict));
        assert_eq!(count_attempts(&db, task_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_attempt_is_flagged() {
        let (_dir, db) = test_db().await;
        let task_id = Uuid::new_v4();
        let OpenResult::Opened(attempt) = open_attempt(&db, task_id, Uuid::new_v4(), 2, Some(0.5))
            .await
            .unwrap()
        else {
            panic!("expected a new attempt");
        };
        assert!(attempt.auto_retry);
        assert_eq!(attempt.selection_score, Some(0.5));
    }

    #[tokio::test]
    async fn second_close_is_a_no_op() {
        let (_dir, db) = test_db().await;
        let task_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let OpenResult::Opened(attempt) = open_attempt(&db, task_id, agent_id, 1, None)
            .await
            .unwrap()
        else {
            panic!("expected a new attempt");
        };

        let first = close_attempt(&db, attempt.id, AttemptOutcome::Failed, Some("boom"), Utc::now())
            .await
            .unwrap();
        assert_eq!(first, CloseResult::Closed);

        let second = close_attempt(&db, attempt.id, AttemptOutcome::Success, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(second, CloseResult::AlreadyClosed);

        let stored = db.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Some(AttemptOutcome::Failed));
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(find_open_attempt(&db, task_id, agent_id).await.unwrap().is_none());
        let closed = find_latest_closed_attempt(&db, task_id, agent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.id, attempt.id);
    }

    #[tokio::test]
    async fn history_is_ordered_with_durations() {
        let (_dir, db) = test_db().await;
        let task_id = Uuid::new_v4();
        let agent_a = Uuid::new_v4();
        let agent_b = Uuid::new_v4();

        let OpenResult::Opened(first) = open_attempt(&db, task_id, agent_a, 1, Some(1.0))
            .await
            .unwrap()
        else {
            panic!("expected a new attempt");
        };
        close_attempt(
            &db,
            first.id,
            AttemptOutcome::Failed,
            None,
            first.dispatched_at + chrono::Duration::seconds(3),
        )
        .await
        .unwrap();
        open_attempt(&db, task_id, agent_b, 2, Some(0.4)).await.unwrap();

        let history = attempt_history(&db, task_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt_number, 1);
        assert_eq!(history[0].duration, Some(3.0));
        assert_eq!(history[1].attempt_number, 2);
        assert!(history[1].auto_retry);
        assert!(history[1].duration.is_none());
        assert!(find_open_attempt(&db, task_id, agent_b).await.unwrap().is_some());
    }
}
