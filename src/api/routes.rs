//! REST endpoints for dispatch, completion webhooks and ops reporting.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::agents::health;
use crate::attempts::ledger;
use crate::completion::{CompletionHandler, CompletionPayload};
use crate::dispatch::Dispatcher;
use crate::error::{CompletionError, DatabaseError, DispatchError};
use crate::ops;
use crate::store::Database;

/// Path of the completion webhook.
pub const COMPLETION_WEBHOOK_PATH: &str = "/api/webhooks/agent-completion";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<dyn Database>,
    pub dispatcher: Arc<Dispatcher>,
    pub completions: Arc<CompletionHandler>,
}

/// Build the Axum router with every REST route.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/tasks/{id}/dispatch", post(dispatch_task))
        .route("/api/tasks/{id}/attempts", get(task_attempts))
        .route(
            COMPLETION_WEBHOOK_PATH,
            post(agent_completion).get(completion_status),
        )
        .route("/api/agents/{id}/stats", get(agent_stats))
        .route("/api/ops/overview", get(ops_overview))
        .route("/api/ops/agents", get(ops_agents))
        .route("/api/ops/tasks", get(ops_tasks))
        .route("/api/ops/retries", get(ops_retries))
        .with_state(state)
}

// ── Responses ───────────────────────────────────────────────────────────

/// Successful body with a `success: true` marker.
#[derive(Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn success<T: Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(Success { success: true, body })).into_response()
}

fn error_response(status: StatusCode, kind: &str, message: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string(), "kind": kind })),
    )
        .into_response()
}

fn invalid_id(what: &str) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        "invalid_id",
        format!("Invalid {what} ID"),
    )
}

fn database_error(e: DatabaseError) -> Response {
    error!(error = %e, "Database error");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "database", e)
}

fn dispatch_status(e: &DispatchError) -> StatusCode {
    match e {
        DispatchError::TaskNotFound(_) | DispatchError::AgentNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::NoAssignedAgent(_) => StatusCode::BAD_REQUEST,
        DispatchError::AttemptsExhausted { .. } | DispatchError::Conflict { .. } => {
            StatusCode::CONFLICT
        }
        DispatchError::Gateway(_) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Delivery { .. } => StatusCode::BAD_GATEWAY,
        DispatchError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn completion_status_code(e: &CompletionError) -> StatusCode {
    match e {
        CompletionError::InvalidPayload
        | CompletionError::MalformedSignal
        | CompletionError::NoAssignedAgent(_) => StatusCode::BAD_REQUEST,
        CompletionError::TaskNotFound(_)
        | CompletionError::SessionNotFound(_)
        | CompletionError::NoActiveTask(_) => StatusCode::NOT_FOUND,
        CompletionError::AttemptsExhausted { .. } => StatusCode::CONFLICT,
        CompletionError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-dispatch"
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn dispatch_task(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return invalid_id("task");
    };

    match state.dispatcher.dispatch(task_id).await {
        Ok(receipt) => success(receipt),
        Err(e) => {
            let status = dispatch_status(&e);
            if status.is_server_error() {
                error!(task_id = %task_id, error = %e, "Dispatch failed");
            } else {
                warn!(task_id = %task_id, error = %e, "Dispatch refused");
            }
            error_response(status, e.kind(), e)
        }
    }
}

async fn task_attempts(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return invalid_id("task");
    };

    match ledger::attempt_history(&*state.db, task_id).await {
        Ok(attempts) => Json(serde_json::json!({ "task_id": task_id, "attempts": attempts }))
            .into_response(),
        Err(e) => database_error(e),
    }
}

// ── Completion webhook ──────────────────────────────────────────────────

async fn agent_completion(
    State(state): State<ApiState>,
    payload: Result<Json<CompletionPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            debug!(error = %rejection, "Unreadable completion payload");
            let e = CompletionError::InvalidPayload;
            return error_response(StatusCode::BAD_REQUEST, e.kind(), e);
        }
    };

    match state.completions.handle_payload(payload).await {
        Ok(report) => success(report),
        Err(e) => {
            let status = completion_status_code(&e);
            if status.is_server_error() {
                error!(error = %e, "Completion failed");
            } else {
                warn!(error = %e, "Completion rejected");
            }
            error_response(status, e.kind(), e)
        }
    }
}

async fn completion_status(State(state): State<ApiState>) -> Response {
    match ops::recent_completions(&*state.db).await {
        Ok(recent) => Json(serde_json::json!({
            "status": "active",
            "recent_completions": recent,
            "endpoint": COMPLETION_WEBHOOK_PATH,
        }))
        .into_response(),
        Err(e) => database_error(e),
    }
}

// ── Agents ──────────────────────────────────────────────────────────────

async fn agent_stats(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let Ok(agent_id) = Uuid::parse_str(&id) else {
        return invalid_id("agent");
    };

    let agent = match state.db.get_agent(agent_id).await {
        Ok(agent) => agent,
        Err(e) => return database_error(e),
    };
    match health::health_report(&*state.db, agent_id, agent.as_ref()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => database_error(e),
    }
}

// ── Ops ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OutcomeQuery {
    limit: Option<u32>,
}

async fn ops_overview(State(state): State<ApiState>) -> Response {
    match ops::overview(&*state.db).await {
        Ok(overview) => Json(overview).into_response(),
        Err(e) => database_error(e),
    }
}

async fn ops_agents(State(state): State<ApiState>) -> Response {
    match ops::agent_health(&*state.db).await {
        Ok(agents) => Json(agents).into_response(),
        Err(e) => database_error(e),
    }
}

async fn ops_tasks(State(state): State<ApiState>, Query(query): Query<OutcomeQuery>) -> Response {
    let limit = query
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(ops::DEFAULT_OUTCOME_LIMIT);
    match ops::recent_outcomes(&*state.db, limit).await {
        Ok(outcomes) => Json(outcomes).into_response(),
        Err(e) => database_error(e),
    }
}

async fn ops_retries(State(state): State<ApiState>) -> Response {
    match ops::retry_distribution(&*state.db).await {
        Ok(distribution) => Json(distribution).into_response(),
        Err(e) => database_error(e),
    }
}
