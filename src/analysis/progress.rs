use serde::{Deserialize, Serialize};

/// Upper bound of the per-day progress percent.
pub const PROGRESS_CAP: f64 = 25.0;
/// Above this the value eases toward the cap instead of growing linearly.
pub const PROGRESS_SOFT_THRESHOLD: f64 = 21.0;

const TREND_WEIGHT: f64 = 0.40;
const LOCAL_WEIGHT: f64 = 0.30;
const AI_WEIGHT: f64 = 0.20;
const SIZE_WEIGHT: f64 = 0.10;
const SIZE_SCALE: f64 = 400.0;
const EASING_SCALE: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressInputs {
    pub trend: i64,
    pub previous_base: i64,
    pub daily_cap_ratio: f64,
    pub local_score: i64,
    pub ai_score: i64,
    pub changed_lines: i64,
    pub hunks: i64,
}

/// Blend trend, local score, AI score and size into a 0–25 percent.
pub fn progress_percent(inputs: &ProgressInputs) -> i64 {
    let max_trend = (inputs.previous_base.max(1) as f64 * inputs.daily_cap_ratio).max(1.0);
    let trend = (inputs.trend.max(0) as f64 / max_trend).min(1.0);
    let local = inputs.local_score.clamp(0, 100) as f64 / 100.0;
    let ai = inputs.ai_score.clamp(0, 100) as f64 / 100.0;
    let size = 1.0 - (-(inputs.changed_lines.max(0) as f64) / SIZE_SCALE).exp();

    let blended = TREND_WEIGHT * trend + LOCAL_WEIGHT * local + AI_WEIGHT * ai + SIZE_WEIGHT * size;
    let mut percent = blended * PROGRESS_CAP;

    if percent > PROGRESS_SOFT_THRESHOLD {
        let span = PROGRESS_CAP - PROGRESS_SOFT_THRESHOLD;
        let excess = percent - PROGRESS_SOFT_THRESHOLD;
        percent = PROGRESS_SOFT_THRESHOLD + span * (1.0 - (-excess / EASING_SCALE).exp());
    }

    let has_signal = inputs.changed_lines > 0 || inputs.local_score > 0 || inputs.hunks > 0;
    if has_signal && percent < 1.0 {
        percent = 1.0;
    }

    percent.round().clamp(0.0, PROGRESS_CAP) as i64
}
