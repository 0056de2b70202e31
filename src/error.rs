//! Error types for agent-dispatch.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors talking to the agent runtime gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway is not connected")]
    NotConnected,

    #[error("Failed to connect to gateway at {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("Gateway call {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Gateway call {method} failed: {reason}")]
    RequestFailed { method: String, reason: String },

    #[error("Gateway rejected {method}: {message}")]
    Rpc { method: String, message: String },

    #[error("Invalid response from gateway for {method}: {reason}")]
    InvalidResponse { method: String, reason: String },
}

/// Errors refusing or aborting a dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Agent {0} not found")]
    AgentNotFound(Uuid),

    #[error("Task {0} has no assigned agent")]
    NoAssignedAgent(Uuid),

    #[error("Max dispatch attempts reached for task {task_id} ({attempts} used)")]
    AttemptsExhausted { task_id: Uuid, attempts: u32 },

    #[error("Dispatch attempt {attempt_number} of task {task_id} is already recorded or still open")]
    Conflict { task_id: Uuid, attempt_number: u32 },

    #[error("Failed to connect to agent gateway: {0}")]
    Gateway(#[source] GatewayError),

    #[error("Failed to send attempt {attempt_number} of task {task_id} to agent: {source}")]
    Delivery {
        task_id: Uuid,
        attempt_number: u32,
        #[source]
        source: GatewayError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl DispatchError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) | Self::AgentNotFound(_) => "not_found",
            Self::NoAssignedAgent(_) => "no_assigned_agent",
            Self::AttemptsExhausted { .. } => "attempts_exhausted",
            Self::Conflict { .. } => "conflict",
            Self::Gateway(_) => "gateway_unavailable",
            Self::Delivery { .. } => "delivery_failure",
            Self::Database(_) => "database",
        }
    }
}

/// Errors rejecting a completion signal.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Invalid payload. Provide either task_id or session_id + message")]
    InvalidPayload,

    #[error("Invalid completion message format. Expected: TASK_COMPLETE: [summary]")]
    MalformedSignal,

    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Session {0} not found or inactive")]
    SessionNotFound(String),

    #[error("Task {0} has no assigned agent")]
    NoAssignedAgent(Uuid),

    #[error("No active task found for agent {0}")]
    NoActiveTask(Uuid),

    #[error("Task {task_id} has no open attempt and all {attempts} attempts are used")]
    AttemptsExhausted { task_id: Uuid, attempts: u32 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl CompletionError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::MalformedSignal => "malformed_signal",
            Self::TaskNotFound(_) | Self::SessionNotFound(_) => "not_found",
            Self::NoAssignedAgent(_) => "no_assigned_agent",
            Self::NoActiveTask(_) => "no_active_task",
            Self::AttemptsExhausted { .. } => "attempts_exhausted",
            Self::Database(_) => "database",
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_kinds_are_stable() {
        let id = Uuid::new_v4();
        assert_eq!(DispatchError::TaskNotFound(id).kind(), "not_found");
        assert_eq!(
            DispatchError::AttemptsExhausted { task_id: id, attempts: 2 }.kind(),
            "attempts_exhausted"
        );
        assert_eq!(
            DispatchError::Conflict { task_id: id, attempt_number: 1 }.kind(),
            "conflict"
        );
        assert_eq!(
            DispatchError::Delivery {
                task_id: id,
                attempt_number: 1,
                source: GatewayError::NotConnected,
            }
            .kind(),
            "delivery_failure"
        );
    }

    #[test]
    fn component_errors_lift_into_service_error() {
        let err: Error = GatewayError::NotConnected.into();
        assert!(matches!(err, Error::Gateway(_)));
        let err: Error = ConfigError::InvalidValue {
            key: "AGENT_DISPATCH_PORT".into(),
            message: "not a number".into(),
        }
        .into();
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn completion_messages_name_the_marker() {
        let msg = CompletionError::MalformedSignal.to_string();
        assert!(msg.contains("TASK_COMPLETE"));
        assert_eq!(CompletionError::NoActiveTask(Uuid::nil()).kind(), "no_active_task");
    }
}
