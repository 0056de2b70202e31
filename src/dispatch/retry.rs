//! Retry queue: completions that warrant another attempt land here and a
//! background worker re-dispatches them.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::engine::Dispatcher;
use crate::error::DispatchError;

/// Request to dispatch the next attempt of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRequest {
    pub task_id: Uuid,
    /// Attempt whose failure triggered the retry.
    pub failed_attempt: u32,
    pub failed_agent_id: Uuid,
}

pub type RetrySender = mpsc::UnboundedSender<RetryRequest>;
pub type RetryReceiver = mpsc::UnboundedReceiver<RetryRequest>;

pub fn retry_channel() -> (RetrySender, RetryReceiver) {
    mpsc::unbounded_channel()
}

/// Spawn the retry worker.
///
/// Each request is dispatched on its own task so a slow delivery does not
/// hold up the queue. The worker exits once every sender is dropped.
pub fn spawn_retry_worker(dispatcher: Arc<Dispatcher>, mut rx: RetryReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Retry worker started");
        while let Some(request) = rx.recv().await {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                run_retry(&dispatcher, request).await;
            });
        }
        info!("Retry worker stopped");
    })
}

async fn run_retry(dispatcher: &Dispatcher, request: RetryRequest) {
    info!(
        task_id = %request.task_id,
        failed_attempt = request.failed_attempt,
        "Retrying task"
    );
    match dispatcher.dispatch(request.task_id).await {
        Ok(receipt) => info!(
            task_id = %receipt.task_id,
            agent = %receipt.agent_name,
            attempt_number = receipt.attempt_number,
            "Retry dispatched"
        ),
        Err(e @ (DispatchError::AttemptsExhausted { .. } | DispatchError::Conflict { .. })) => {
            warn!(task_id = %request.task_id, error = %e, "Retry skipped")
        }
        Err(e) => error!(task_id = %request.task_id, error = %e, "Retry dispatch failed"),
    }
}
