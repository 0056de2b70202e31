//! Ops metrics: delivery health across tasks and agents.

pub mod model;

use tracing::debug;

use crate::agents::health;
use crate::error::DatabaseError;
use crate::events::{CompletionEntry, EventType};
use crate::store::Store;

pub use model::{
    AgentHealthReport, OpsOverview, OutcomeListing, OutcomeSummary, RetryDistribution,
    TaskOutcomeReport,
};

/// Default number of rows in the recent outcomes listing.
pub const DEFAULT_OUTCOME_LIMIT: u32 = 50;

/// Number of completions in the webhook status listing.
pub const RECENT_COMPLETIONS_LIMIT: u32 = 10;

/// Round a ratio to two decimals for display.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

pub async fn overview<S: Store + ?Sized>(store: &S) -> Result<OpsOverview, DatabaseError> {
    let summary = store.outcome_summary().await?;
    debug!(outcomes = summary.total_outcomes, "Ops overview computed");
    Ok(OpsOverview {
        total_tasks: summary.total_tasks,
        total_outcomes: summary.total_outcomes,
        success_rate: round2(ratio(summary.successes, summary.total_outcomes)),
        avg_attempts_per_task: round2(summary.avg_attempts),
        retry_rate: round2(ratio(summary.retried, summary.total_outcomes)),
        degraded_agents: summary.degraded_agents,
    })
}

/// Health of every agent, most successful first.
pub async fn agent_health<S: Store + ?Sized>(
    store: &S,
) -> Result<Vec<AgentHealthReport>, DatabaseError> {
    let agents = store.list_agents().await?;
    let mut reports = Vec::with_capacity(agents.len());
    for agent in &agents {
        reports.push(health::health_report(store, agent.id, Some(agent)).await?);
    }
    reports.sort_by(|a, b| b.total_success.cmp(&a.total_success));
    Ok(reports)
}

pub async fn recent_outcomes<S: Store + ?Sized>(
    store: &S,
    limit: u32,
) -> Result<Vec<TaskOutcomeReport>, DatabaseError> {
    let rows = store.list_outcomes(limit).await?;
    Ok(rows.into_iter().map(TaskOutcomeReport::from).collect())
}

/// Finished tasks keyed by attempts consumed.
pub async fn retry_distribution<S: Store + ?Sized>(
    store: &S,
) -> Result<RetryDistribution, DatabaseError> {
    let buckets = store.retry_distribution().await?;
    Ok(buckets
        .into_iter()
        .map(|(attempts, count)| (bucket_label(attempts), count))
        .collect())
}

fn bucket_label(attempts: u32) -> String {
    match attempts {
        1 => "single_attempt".to_string(),
        2 => "double_attempt".to_string(),
        n => format!("{n}_attempts"),
    }
}

/// Latest completion events with agent and task names.
pub async fn recent_completions<S: Store + ?Sized>(
    store: &S,
) -> Result<Vec<CompletionEntry>, DatabaseError> {
    store
        .recent_events(EventType::TaskCompleted, RECENT_COMPLETIONS_LIMIT)
        .await
}
