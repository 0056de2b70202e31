//! Agent fitness scoring.

use super::model::AgentHealth;

/// Penalty subtracted from a degraded agent's success rate.
pub const DEGRADED_PENALTY: f64 = 0.2;

/// Comparable fitness score: lifetime success rate minus the degradation penalty.
///
/// Agents with no history score `0.0`. Higher is better.
pub fn score(health: &AgentHealth) -> f64 {
    let penalty = if health.is_degraded {
        DEGRADED_PENALTY
    } else {
        0.0
    };
    health.success_rate() - penalty
}
