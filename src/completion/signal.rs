//! Completion signal adapter: turns raw webhook payloads into structured signals.
//!
//! Agents report back either directly (`task_id` plus an optional outcome)
//! or by relaying their chat reply (`session_id` plus the transcript line
//! containing `TASK_COMPLETE: <summary>`). All free-text parsing lives here.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use uuid::Uuid;

use crate::attempts::model::AttemptOutcome;
use crate::error::CompletionError;

/// Summary used when the agent did not supply one.
pub const DEFAULT_SUMMARY: &str = "Task finished";

static COMPLETION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)TASK_COMPLETE:\s*(.+)").expect("completion marker pattern is valid")
});

/// Webhook body as posted by agents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionPayload {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub outcome: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// How the completing task is identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Task(Uuid),
    /// Runtime session id; the task is the agent's live one.
    Session(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSignal {
    pub selector: Selector,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub summary: String,
}

impl CompletionSignal {
    pub fn from_payload(payload: CompletionPayload) -> Result<Self, CompletionError> {
        let outcome_text = payload.outcome.as_ref().and_then(scalar_text);
        let outcome = AttemptOutcome::normalize(outcome_text.as_deref());
        let error = payload.error.as_ref().and_then(scalar_text);
        let supplied_summary = payload
            .summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let task_id = payload
            .task_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(raw) = task_id {
            let id = Uuid::parse_str(raw).map_err(|_| CompletionError::InvalidPayload)?;
            return Ok(Self {
                selector: Selector::Task(id),
                outcome,
                error,
                summary: supplied_summary.unwrap_or_else(|| DEFAULT_SUMMARY.to_string()),
            });
        }

        let session_id = payload
            .session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let transcript = payload.message.filter(|m| !m.trim().is_empty());
        match (session_id, transcript) {
            (Some(session_id), Some(transcript)) => {
                let summary =
                    parse_completion_marker(&transcript).ok_or(CompletionError::MalformedSignal)?;
                Ok(Self {
                    selector: Selector::Session(session_id),
                    outcome,
                    error,
                    summary,
                })
            }
            _ => Err(CompletionError::InvalidPayload),
        }
    }
}

/// Summary following the first `TASK_COMPLETE:` marker, up to end of line.
pub fn parse_completion_marker(text: &str) -> Option<String> {
    COMPLETION_MARKER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Text of a scalar JSON value. Empty strings and null count as absent.
fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: serde_json::Value) -> CompletionPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn marker_is_case_insensitive_and_trimmed() {
        assert_eq!(
            parse_completion_marker("done!\ntask_complete:   Built the login page  \nbye"),
            Some("Built the login page".to_string())
        );
        assert_eq!(parse_completion_marker("all done"), None);
        assert_eq!(parse_completion_marker("TASK_COMPLETE:   "), None);
    }

    #[test]
    fn task_selector_with_defaults() {
        let id = Uuid::new_v4();
        let signal =
            CompletionSignal::from_payload(payload(json!({ "task_id": id.to_string() }))).unwrap();
        assert_eq!(signal.selector, Selector::Task(id));
        assert_eq!(signal.outcome, AttemptOutcome::Success);
        assert_eq!(signal.summary, DEFAULT_SUMMARY);
        assert!(signal.error.is_none());
    }

    #[test]
    fn outcome_normalization() {
        let id = Uuid::new_v4().to_string();
        let cases = [
            (json!("SUCCESS"), AttemptOutcome::Success),
            (json!("success"), AttemptOutcome::Success),
            (json!(""), AttemptOutcome::Success),
            (json!("failed"), AttemptOutcome::Failed),
            (json!("timeout"), AttemptOutcome::Failed),
            (json!(false), AttemptOutcome::Failed),
        ];
        for (outcome, expected) in cases {
            let signal = CompletionSignal::from_payload(payload(
                json!({ "task_id": id, "outcome": outcome, "error": "boom" }),
            ))
            .unwrap();
            assert_eq!(signal.outcome, expected, "outcome {outcome}");
            assert_eq!(signal.error.as_deref(), Some("boom"));
        }
    }

    #[test]
    fn session_selector_takes_summary_from_transcript() {
        let signal = CompletionSignal::from_payload(payload(json!({
            "session_id": "console-builder",
            "message": "TASK_COMPLETE: Shipped v2",
            "summary": "ignored"
        })))
        .unwrap();
        assert_eq!(signal.selector, Selector::Session("console-builder".into()));
        assert_eq!(signal.summary, "Shipped v2");
    }

    #[test]
    fn transcript_without_marker_is_malformed() {
        let err = CompletionSignal::from_payload(payload(json!({
            "session_id": "console-builder",
            "message": "I think I'm done?"
        })))
        .unwrap_err();
        assert!(matches!(err, CompletionError::MalformedSignal));
    }

    #[test]
    fn missing_selector_is_invalid() {
        for body in [
            json!({}),
            json!({ "session_id": "console-builder" }),
            json!({ "message": "TASK_COMPLETE: x" }),
            json!({ "task_id": "not-a-uuid" }),
        ] {
            let err = CompletionSignal::from_payload(payload(body)).unwrap_err();
            assert!(matches!(err, CompletionError::InvalidPayload));
        }
    }
}
