//! Agent data model: identities, health snapshots, delivery sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime agent used in session keys when an agent has none configured.
pub const DEFAULT_RUNTIME_NAME: &str = "main";

/// Prefix of generated delivery session ids.
pub const SESSION_PREFIX: &str = "console";

/// Channel recorded on sessions created by the dispatcher.
pub const SESSION_CHANNEL: &str = "console";

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Standby,
    Working,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standby => write!(f, "standby"),
            Self::Working => write!(f, "working"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standby" => Ok(Self::Standby),
            "working" => Ok(Self::Working),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("Unknown agent status: {}", s)),
        }
    }
}

/// A worker identity capable of executing one task at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub status: AgentStatus,
    /// Name of the agent inside the remote runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_name: Option<String>,
    /// Behavioral documents, opaque to the orchestration core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soul_md: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_md: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents_md: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Create a standby agent with no runtime name or documents.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: AgentStatus::Standby,
            runtime_name: None,
            soul_md: None,
            user_md: None,
            agents_md: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the remote runtime name.
    pub fn with_runtime_name(mut self, runtime: impl Into<String>) -> Self {
        self.runtime_name = Some(runtime.into());
        self
    }

    /// Builder: set the lifecycle status.
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: attach the soul document.
    pub fn with_soul(mut self, soul: impl Into<String>) -> Self {
        self.soul_md = Some(soul.into());
        self
    }

    /// Runtime name used when addressing this agent's sessions.
    pub fn runtime(&self) -> &str {
        self.runtime_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_RUNTIME_NAME)
    }

    /// Session id generated from the display name.
    pub fn session_slug(&self) -> String {
        let name = self
            .name
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-");
        format!("{SESSION_PREFIX}-{name}")
    }
}

/// Cumulative health counters for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: Uuid,
    pub total_success: u64,
    pub total_failure: u64,
    pub is_degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AgentHealth {
    /// Zero-valued snapshot for an agent with no recorded completions.
    pub fn empty(agent_id: Uuid) -> Self {
        Self {
            agent_id,
            total_success: 0,
            total_failure: 0,
            is_degraded: false,
            updated_at: None,
        }
    }

    pub fn total_attempts(&self) -> u64 {
        self.total_success + self.total_failure
    }

    /// Lifetime success ratio, `0.0` with no attempts.
    pub fn success_rate(&self) -> f64 {
        match self.total_attempts() {
            0 => 0.0,
            total => self.total_success as f64 / total as f64,
        }
    }
}

/// Lifecycle of a delivery session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Durable record of an agent's delivery session in the remote runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Session id inside the remote runtime.
    pub session_id: String,
    pub channel: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentSession {
    /// New active session for `agent`, keyed by its display name.
    pub fn for_agent(agent: &Agent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id: agent.id,
            session_id: agent.session_slug(),
            channel: SESSION_CHANNEL.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Gateway address: `agent:<runtime>:<session>`.
    pub fn session_key(&self, agent: &Agent) -> String {
        format!("agent:{}:{}", agent.runtime(), self.session_id)
    }
}
