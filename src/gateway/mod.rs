//! Agent runtime gateway: the remote side that hosts agent sessions.

pub mod http;

use async_trait::async_trait;

use crate::error::GatewayError;

pub use http::HttpGateway;

/// RPC method that posts a message into an agent session.
pub const CHAT_SEND: &str = "chat.send";

/// Connection to the agent runtime.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Establish the connection. Safe to call when already connected.
    async fn connect(&self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    /// Invoke an RPC method and return its result payload.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError>;

    async fn disconnect(&self);
}
