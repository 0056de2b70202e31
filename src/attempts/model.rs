//! Attempt and outcome records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of a closed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
}

impl AttemptOutcome {
    /// Normalize a reported outcome: absent, blank or `success` (any case)
    /// is a success, every other value is a failure.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::Success,
            Some(s) if s.eq_ignore_ascii_case("success") => Self::Success,
            Some(_) => Self::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for AttemptOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown attempt outcome: {}", s)),
        }
    }
}

/// One dispatch of a task to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub task_id: Uuid,
    /// 1-based, unique per task.
    pub attempt_number: u32,
    pub agent_id: Uuid,
    pub auto_retry: bool,
    /// Fitness score at selection time. `None` for attempts synthesized
    /// from an unmatched completion.
    pub selection_score: Option<f64>,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
    pub error: Option<String>,
}

impl Attempt {
    /// A new open attempt. Any attempt numbered above 1 is an automatic retry.
    pub fn open(
        task_id: Uuid,
        agent_id: Uuid,
        attempt_number: u32,
        selection_score: Option<f64>,
        dispatched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            attempt_number,
            agent_id,
            auto_retry: attempt_number > 1,
            selection_score,
            dispatched_at,
            completed_at: None,
            outcome: None,
            error: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }

    /// Seconds between dispatch and completion, once closed.
    pub fn duration_secs(&self) -> Option<f64> {
        self.completed_at
            .map(|done| (done - self.dispatched_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// The single terminal record for a task's attempt sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub final_status: AttemptOutcome,
    pub attempts: u32,
    pub last_agent_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Attempt as reported in a task's history.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptView {
    pub attempt_number: u32,
    pub agent_id: Uuid,
    pub auto_retry: bool,
    pub selection_score: Option<f64>,
    pub outcome: Option<AttemptOutcome>,
    pub error: Option<String>,
    /// Seconds; `None` while open.
    pub duration: Option<f64>,
}

impl From<&Attempt> for AttemptView {
    fn from(attempt: &Attempt) -> Self {
        Self {
            attempt_number: attempt.attempt_number,
            agent_id: attempt.agent_id,
            auto_retry: attempt.auto_retry,
            selection_score: attempt.selection_score,
            outcome: attempt.outcome,
            error: attempt.error.clone(),
            duration: attempt.duration_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_outcomes() {
        assert_eq!(AttemptOutcome::normalize(None), AttemptOutcome::Success);
        assert_eq!(AttemptOutcome::normalize(Some("SUCCESS")), AttemptOutcome::Success);
        assert_eq!(AttemptOutcome::normalize(Some("failed")), AttemptOutcome::Failed);
        assert_eq!(AttemptOutcome::normalize(Some("timeout")), AttemptOutcome::Failed);
        assert_eq!(AttemptOutcome::normalize(Some("")), AttemptOutcome::Success);
        assert_eq!(AttemptOutcome::normalize(Some("  ")), AttemptOutcome::Success);
    }

    #[test]
    fn retry_flag_follows_attempt_number() {
        let now = Utc::now();
        let first = Attempt::open(Uuid::new_v4(), Uuid::new_v4(), 1, Some(0.5), now);
        let second = Attempt::open(Uuid::new_v4(), Uuid::new_v4(), 2, None, now);
        assert!(!first.auto_retry);
        assert!(second.auto_retry);
        assert!(first.is_open());
    }

    #[test]
    fn duration_only_when_closed() {
        let start = Utc::now();
        let mut attempt = Attempt::open(Uuid::new_v4(), Uuid::new_v4(), 1, None, start);
        assert!(attempt.duration_secs().is_none());
        attempt.completed_at = Some(start + chrono::Duration::milliseconds(2500));
        assert_eq!(attempt.duration_secs(), Some(2.5));
        assert_eq!(AttemptView::from(&attempt).duration, Some(2.5));
    }
}
