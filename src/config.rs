//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

const DEFAULT_DB_PATH: &str = "./data/agent-dispatch.db";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:18789";

/// HTTP server and store settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub port: u16,
    /// Base URL agents use to reach the completion webhook.
    pub public_url: String,
    /// Root under which agents write task output.
    pub projects_path: PathBuf,
    /// Directory for daily-rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = parse_or(get("AGENT_DISPATCH_PORT"), "AGENT_DISPATCH_PORT", DEFAULT_PORT)?;
        let public_url = get("AGENT_DISPATCH_PUBLIC_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://localhost:{port}"));

        let projects_path = match get("AGENT_DISPATCH_PROJECTS_PATH") {
            Some(path) => PathBuf::from(path),
            None => get("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("projects"),
        };

        Ok(Self {
            db_path: get("AGENT_DISPATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            port,
            public_url,
            projects_path,
            log_dir: get("AGENT_DISPATCH_LOG_DIR").map(PathBuf::from),
        })
    }

    /// URL agents post completion signals to.
    pub fn completion_webhook_url(&self) -> String {
        format!("{}/api/webhooks/agent-completion", self.public_url)
    }
}

/// Agent runtime gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: Option<SecretString>,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let connect_secs: u64 = parse_or(
            get("GATEWAY_CONNECT_TIMEOUT_SECS"),
            "GATEWAY_CONNECT_TIMEOUT_SECS",
            5,
        )?;
        let call_secs: u64 = parse_or(
            get("GATEWAY_CALL_TIMEOUT_SECS"),
            "GATEWAY_CALL_TIMEOUT_SECS",
            30,
        )?;

        Ok(Self {
            url: get("GATEWAY_URL").unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            token: get("GATEWAY_TOKEN").map(SecretString::from),
            connect_timeout: Duration::from_secs(connect_secs),
            call_timeout: Duration::from_secs(call_secs),
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}
