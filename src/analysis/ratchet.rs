use crate::models::day::BASE_SCORE_FLOOR;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatchetConfig {
    /// Fraction of the previous base score that may be added in one day.
    pub daily_cap_ratio: f64,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        RatchetConfig {
            daily_cap_ratio: 0.35,
        }
    }
}

const CHURN_CEILING: f64 = 100.0;
const CHURN_SCALE: f64 = 220.0;
const INSERTION_WEIGHT: f64 = 1.6;
const DELETION_WEIGHT: f64 = 0.8;
const AI_ALLOWANCE: f64 = 30.0;
const LOCAL_ALLOWANCE: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetStep {
    pub previous_base: i64,
    pub allowed: i64,
    pub base_score: i64,
}

impl RatchetStep {
    pub fn trend(&self) -> i64 {
        self.base_score - self.previous_base
    }
}

/// Diminishing-returns increment from line churn alone.
pub fn churn_increment(insertions: i64, deletions: i64) -> f64 {
    let weighted = INSERTION_WEIGHT * insertions.max(0) as f64 + DELETION_WEIGHT * deletions.max(0) as f64;
    CHURN_CEILING * (1.0 - (-weighted / CHURN_SCALE).exp())
}

/// Churn increment plus scaled AI (≤ 30) and local (≤ 40) score allowances.
pub fn allowance_increment(
    insertions: i64,
    deletions: i64,
    ai_score: Option<i64>,
    local_score: Option<i64>,
) -> f64 {
    let ai = ai_score.map_or(0.0, |s| AI_ALLOWANCE * s.clamp(0, 100) as f64 / 100.0);
    let local = local_score.map_or(0.0, |s| LOCAL_ALLOWANCE * s.clamp(0, 100) as f64 / 100.0);
    churn_increment(insertions, deletions) + ai + local
}

/// Add `increment` to the previous base, limited by the day's remaining headroom.
///
/// A strictly positive allowance below one point is granted as exactly one
/// point so small days still register.
pub fn apply_ratchet(
    previous_base: Option<i64>,
    increment: f64,
    already_added: i64,
    config: &RatchetConfig,
) -> RatchetStep {
    let previous = previous_base.unwrap_or(BASE_SCORE_FLOOR).max(BASE_SCORE_FLOOR);
    let headroom = (previous as f64 * config.daily_cap_ratio - already_added.max(0) as f64).max(0.0);
    let allowed_raw = increment.max(0.0).min(headroom);

    let allowed = if allowed_raw > 0.0 && allowed_raw < 1.0 {
        1
    } else {
        allowed_raw.round() as i64
    };

    RatchetStep {
        previous_base: previous,
        allowed,
        base_score: previous + allowed,
    }
}

/// Base score for a day from its full churn counts, as the store recomputes it.
pub fn base_from_churn(
    previous_base: Option<i64>,
    insertions: i64,
    deletions: i64,
    config: &RatchetConfig,
) -> RatchetStep {
    apply_ratchet(previous_base, churn_increment(insertions, deletions), 0, config)
}
