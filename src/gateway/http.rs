//! HTTP JSON transport for the agent runtime gateway.
//!
//! `GET {base}/health` checks reachability, `POST {base}/rpc` carries
//! `{method, params}` and answers `{result}` or `{error: {message}}`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::AgentGateway;
use crate::config::GatewayConfig;
use crate::error::GatewayError;

pub struct HttpGateway {
    base_url: String,
    token: Option<SecretString>,
    call_timeout: Duration,
    client: reqwest::Client,
    connected: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.call_timeout)
            .build()
            .map_err(|e| GatewayError::ConnectFailed {
                url: config.url.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            call_timeout: config.call_timeout,
            client,
            connected: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    fn request_error(&self, method: &str, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout {
                method: method.to_string(),
                timeout: self.call_timeout,
            }
        } else {
            GatewayError::RequestFailed {
                method: method.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl AgentGateway for HttpGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        if self.is_connected() {
            return Ok(());
        }

        let url = self.endpoint("health");
        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| GatewayError::ConnectFailed {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(GatewayError::ConnectFailed {
                url: self.base_url.clone(),
                reason: format!("health check returned {}", resp.status()),
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(url = %self.base_url, "Connected to agent gateway");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        debug!(method, "Gateway call");
        let body = serde_json::json!({ "method": method, "params": params });
        let resp = self
            .authorize(self.client.post(self.endpoint("rpc")))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(method, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(method, status = %status, "Gateway call rejected");
            return Err(GatewayError::RequestFailed {
                method: method.to_string(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let parsed: RpcResponse =
            resp.json()
                .await
                .map_err(|e| GatewayError::InvalidResponse {
                    method: method.to_string(),
                    reason: e.to_string(),
                })?;

        match parsed {
            RpcResponse {
                error: Some(err), ..
            } => Err(GatewayError::Rpc {
                method: method.to_string(),
                message: err.message,
            }),
            RpcResponse { result, .. } => Ok(result.unwrap_or(serde_json::Value::Null)),
        }
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(url = %self.base_url, "Disconnected from agent gateway");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use super::*;

    type Seen = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn rpc(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.lock().unwrap().push((auth, body.clone()));

        match body["method"].as_str() {
            Some("chat.send") => (
                StatusCode::OK,
                Json(serde_json::json!({ "result": { "ok": true } })),
            ),
            Some("broken") => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({}))),
            _ => (
                StatusCode::OK,
                Json(serde_json::json!({ "error": { "message": "unknown method" } })),
            ),
        }
    }

    async fn start_runtime() -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/rpc", post(rpc))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn config(url: &str, token: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            url: url.to_string(),
            token: token.map(SecretString::from),
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn call_requires_connection() {
        let gateway = HttpGateway::new(&config("http://127.0.0.1:9", None)).unwrap();
        let err = gateway
            .call("chat.send", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
    }

    #[tokio::test]
    async fn unreachable_runtime_fails_to_connect() {
        let gateway = HttpGateway::new(&config("http://127.0.0.1:9", None)).unwrap();
        let err = gateway.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectFailed { .. }));
        assert!(!gateway.is_connected());
    }

    #[tokio::test]
    async fn rpc_round_trip_with_token() {
        let (url, seen) = start_runtime().await;
        let gateway = HttpGateway::new(&config(&url, Some("s3cret"))).unwrap();
        gateway.connect().await.unwrap();
        assert!(gateway.is_connected());

        let result = gateway
            .call("chat.send", serde_json::json!({ "message": "hi" }))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.as_deref(), Some("Bearer s3cret"));
        assert_eq!(seen[0].1["params"]["message"], "hi");
    }

    #[tokio::test]
    async fn rpc_errors_are_surfaced() {
        let (url, _seen) = start_runtime().await;
        let gateway = HttpGateway::new(&config(&url, None)).unwrap();
        gateway.connect().await.unwrap();

        let err = gateway
            .call("nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rpc { ref message, .. } if message == "unknown method"));

        let err = gateway
            .call("broken", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RequestFailed { .. }));

        gateway.disconnect().await;
        assert!(!gateway.is_connected());
    }
}
