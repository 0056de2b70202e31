//! Agent health tracking: cumulative counters, rolling window, degradation flag.
//!
//! The degradation flag uses hysteresis: an agent is flagged once it has at
//! least [`MIN_ATTEMPTS_FOR_DEGRADE`] closed attempts and its rolling success
//! ratio drops below [`DEGRADE_BELOW`], and is cleared only when the ratio
//! rises above [`RECOVER_ABOVE`]. Between the two thresholds the flag keeps
//! its previous value.

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Agent, AgentHealth};
use crate::attempts::model::AttemptOutcome;
use crate::error::DatabaseError;
use crate::ops::model::AgentHealthReport;
use crate::ops::round2;
use crate::store::Store;

/// Number of most recently closed attempts in the rolling ratio.
pub const ROLLING_WINDOW: u32 = 20;

/// Lifetime attempts required before an agent can be flagged.
pub const MIN_ATTEMPTS_FOR_DEGRADE: u64 = 10;

/// Rolling ratio below which an agent becomes degraded.
pub const DEGRADE_BELOW: f64 = 0.6;

/// Rolling ratio above which a degraded agent recovers.
pub const RECOVER_ABOVE: f64 = 0.7;

/// Next value of the degradation flag.
pub fn apply_hysteresis(currently_degraded: bool, total_attempts: u64, rolling_rate: f64) -> bool {
    if total_attempts >= MIN_ATTEMPTS_FOR_DEGRADE && rolling_rate < DEGRADE_BELOW {
        true
    } else if rolling_rate > RECOVER_ABOVE {
        false
    } else {
        currently_degraded
    }
}

/// Share of successes in a window of outcomes, `0.0` when empty.
pub fn success_ratio(outcomes: &[AttemptOutcome]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let successes = outcomes.iter().filter(|o| o.is_success()).count();
    successes as f64 / outcomes.len() as f64
}

/// Success ratio over the agent's most recently closed attempts.
pub async fn rolling_success_rate<S: Store + ?Sized>(
    store: &S,
    agent_id: Uuid,
) -> Result<f64, DatabaseError> {
    let window = store.recent_closed_outcomes(agent_id, ROLLING_WINDOW).await?;
    Ok(success_ratio(&window))
}

/// Current snapshot, zero-valued when the agent has no recorded completions.
pub async fn snapshot<S: Store + ?Sized>(
    store: &S,
    agent_id: Uuid,
) -> Result<AgentHealth, DatabaseError> {
    Ok(store
        .get_agent_health(agent_id)
        .await?
        .unwrap_or_else(|| AgentHealth::empty(agent_id)))
}

/// Fold one closed attempt into the agent's health.
///
/// The attempt must already be closed in `store` so it is part of the
/// rolling window. Run inside the completion transaction.
pub async fn record_outcome<S: Store + ?Sized>(
    store: &S,
    agent_id: Uuid,
    outcome: AttemptOutcome,
) -> Result<AgentHealth, DatabaseError> {
    let now = Utc::now();
    store.increment_agent_health(agent_id, outcome, now).await?;

    let mut health = snapshot(store, agent_id).await?;
    let rolling = rolling_success_rate(store, agent_id).await?;
    let degraded = apply_hysteresis(health.is_degraded, health.total_attempts(), rolling);

    if degraded != health.is_degraded {
        store.set_agent_degraded(agent_id, degraded, now).await?;
        if degraded {
            warn!(agent_id = %agent_id, rolling_rate = rolling, "Agent degraded");
        } else {
            info!(agent_id = %agent_id, rolling_rate = rolling, "Agent recovered");
        }
        health.is_degraded = degraded;
    }

    debug!(
        agent_id = %agent_id,
        outcome = %outcome,
        success = health.total_success,
        failure = health.total_failure,
        "Health updated"
    );
    Ok(health)
}

/// Health figures for one agent as reported to operators.
pub async fn health_report<S: Store + ?Sized>(
    store: &S,
    agent_id: Uuid,
    agent: Option<&Agent>,
) -> Result<AgentHealthReport, DatabaseError> {
    let health = snapshot(store, agent_id).await?;
    let rolling = rolling_success_rate(store, agent_id).await?;
    Ok(AgentHealthReport {
        agent_id,
        name: agent.map(|a| a.name.clone()),
        total_success: health.total_success,
        total_failure: health.total_failure,
        total_attempts: health.total_attempts(),
        success_rate: round2(health.success_rate()),
        last_20_success_rate: round2(rolling),
        is_degraded: health.is_degraded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempts::model::Attempt;
    use crate::store::test_support::test_db;

    /// Close one attempt for `agent_id` and fold it into health.
    async fn complete<S: Store + ?Sized>(
        store: &S,
        agent_id: Uuid,
        outcome: AttemptOutcome,
    ) -> AgentHealth {
        let attempt = Attempt::open(Uuid::new_v4(), agent_id, 1, None, Utc::now());
        store.insert_attempt_if_absent(&attempt).await.unwrap();
        store
            .close_attempt(attempt.id, outcome, None, Utc::now())
            .await
            .unwrap();
        record_outcome(store, agent_id, outcome).await.unwrap()
    }

    #[test]
    fn hysteresis_band() {
        // Not enough history.
        assert!(!apply_hysteresis(false, 9, 0.0));
        assert!(apply_hysteresis(false, 10, 0.59));
        // Inside the band the flag sticks either way.
        assert!(apply_hysteresis(true, 20, 0.65));
        assert!(!apply_hysteresis(false, 20, 0.65));
        assert!(apply_hysteresis(true, 20, 0.7));
        assert!(!apply_hysteresis(true, 20, 0.71));
    }

    #[test]
    fn ratio_of_empty_window_is_zero() {
        assert_eq!(success_ratio(&[]), 0.0);
        assert_eq!(
            success_ratio(&[AttemptOutcome::Success, AttemptOutcome::Failed]),
            0.5
        );
    }

    #[tokio::test]
    async fn seven_of_ten_is_not_degraded() {
        let (_dir, db) = test_db().await;
        let agent_id = Uuid::new_v4();

        for _ in 0..3 {
            complete(&db, agent_id, AttemptOutcome::Failed).await;
        }
        let mut health = AgentHealth::empty(agent_id);
        for _ in 0..7 {
            health = complete(&db, agent_id, AttemptOutcome::Success).await;
        }
        assert_eq!(health.total_attempts(), 10);
        assert!(!health.is_degraded);
    }

    #[tokio::test]
    async fn three_of_ten_degrades_on_tenth_outcome() {
        let (_dir, db) = test_db().await;
        let agent_id = Uuid::new_v4();

        for _ in 0..3 {
            complete(&db, agent_id, AttemptOutcome::Success).await;
        }
        for _ in 0..6 {
            let health = complete(&db, agent_id, AttemptOutcome::Failed).await;
            assert!(!health.is_degraded, "needs ten attempts first");
        }
        let health = complete(&db, agent_id, AttemptOutcome::Failed).await;
        assert_eq!(health.total_attempts(), 10);
        assert!(health.is_degraded);
        assert!(snapshot(&db, agent_id).await.unwrap().is_degraded);
    }

    #[tokio::test]
    async fn degraded_agent_recovers_after_successes() {
        let (_dir, db) = test_db().await;
        let agent_id = Uuid::new_v4();

        for _ in 0..10 {
            complete(&db, agent_id, AttemptOutcome::Failed).await;
        }
        assert!(snapshot(&db, agent_id).await.unwrap().is_degraded);

        let mut health = AgentHealth::empty(agent_id);
        for _ in 0..20 {
            health = complete(&db, agent_id, AttemptOutcome::Success).await;
            if !health.is_degraded {
                break;
            }
        }
        assert!(!health.is_degraded);
        assert!(rolling_success_rate(&db, agent_id).await.unwrap() > RECOVER_ABOVE);
    }

    #[tokio::test]
    async fn snapshot_defaults_to_zero() {
        let (_dir, db) = test_db().await;
        let health = snapshot(&db, Uuid::new_v4()).await.unwrap();
        assert_eq!(health.total_attempts(), 0);
        assert!(!health.is_degraded);
    }

    #[tokio::test]
    async fn report_rounds_rates() {
        let (_dir, db) = test_db().await;
        let agent = Agent::new("Rounder");
        for outcome in [
            AttemptOutcome::Success,
            AttemptOutcome::Success,
            AttemptOutcome::Failed,
        ] {
            complete(&db, agent.id, outcome).await;
        }

        let report = health_report(&db, agent.id, Some(&agent)).await.unwrap();
        assert_eq!(report.name.as_deref(), Some("Rounder"));
        assert_eq!(report.total_attempts, 3);
        assert_eq!(report.success_rate, 0.67);
        assert_eq!(report.last_20_success_rate, 0.67);
    }
}
