//! Outcome finalizer: the single terminal record of a task's attempts.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{AttemptOutcome, OutcomeRecord};
use crate::error::DatabaseError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Inserted,
    /// The task was finalized earlier; the stored record is unchanged.
    AlreadyExists,
}

/// Write the task's outcome unless one exists.
pub async fn write_outcome<S: Store + ?Sized>(
    store: &S,
    task_id: Uuid,
    final_status: AttemptOutcome,
    attempts: u32,
    last_agent_id: Uuid,
) -> Result<WriteResult, DatabaseError> {
    let record = OutcomeRecord {
        id: Uuid::new_v4(),
        task_id,
        final_status,
        attempts,
        last_agent_id,
        created_at: Utc::now(),
    };
    if store.insert_outcome_if_absent(&record).await? {
        info!(task_id = %task_id, final_status = %final_status, attempts, "Task finalized");
        Ok(WriteResult::Inserted)
    } else {
        debug!(task_id = %task_id, "Outcome already recorded");
        Ok(WriteResult::AlreadyExists)
    }
}
