use serde::{Deserialize, Serialize};

/// Tunables for mapping a raw score onto the recent history of raw scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    pub cold_start_samples: usize,
    pub window_days: u32,
    pub alpha: f64,
    pub cold_cap: f64,
    pub steady_cap: f64,
    pub winsor_low_pct: f64,
    pub winsor_high_pct: f64,
    pub cold_mean: f64,
    pub cold_std: f64,
    pub regression_threshold: f64,
    pub regression_cap: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        NormalizerConfig {
            cold_start_samples: 5,
            window_days: 30,
            alpha: 0.6,
            cold_cap: 70.0,
            steady_cap: 85.0,
            winsor_low_pct: 5.0,
            winsor_high_pct: 95.0,
            cold_mean: 50.0,
            cold_std: 20.0,
            regression_threshold: 80.0,
            regression_cap: 70.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMode {
    ColdStart,
    Steady,
}

/// Yesterday's stored values, used to damp today's result.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SmoothingAnchor {
    pub normalized: Option<i64>,
    pub raw: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedScore {
    pub score: i64,
    pub raw: i64,
    pub mode: NormalizationMode,
}

/// Under-confidence factor applied while history is thin.
const COLD_START_SCALE: f64 = 0.9;

pub fn normalize(
    raw: i64,
    samples: &[i64],
    anchor: SmoothingAnchor,
    config: &NormalizerConfig,
) -> NormalizedScore {
    let mode = mode_for(samples, config);
    let cap = cap_for(mode, config);
    let today = normalize_unsmoothed(raw, samples, config);

    let mut score = today;
    if let Some(previous) = anchor.normalized {
        let previous_form = match anchor.raw {
            Some(previous_raw) => normalize_unsmoothed(previous_raw, samples, config),
            None => previous as f64,
        };
        let blended = config.alpha * today + (1.0 - config.alpha) * previous_form;
        score = today.min(blended);

        if previous as f64 >= config.regression_threshold {
            score = score.min(config.regression_cap);
        }
    }

    NormalizedScore {
        score: score.clamp(0.0, cap).round() as i64,
        raw,
        mode,
    }
}

pub fn mode_for(samples: &[i64], config: &NormalizerConfig) -> NormalizationMode {
    if samples.len() < config.cold_start_samples {
        NormalizationMode::ColdStart
    } else {
        NormalizationMode::Steady
    }
}

fn cap_for(mode: NormalizationMode, config: &NormalizerConfig) -> f64 {
    match mode {
        NormalizationMode::ColdStart => config.cold_cap,
        NormalizationMode::Steady => config.steady_cap,
    }
}

/// Mode-dependent mapping before smoothing. A raw score of 0 means nothing
/// changed and stays 0.
fn normalize_unsmoothed(raw: i64, samples: &[i64], config: &NormalizerConfig) -> f64 {
    if raw <= 0 {
        return 0.0;
    }

    let raw = raw.min(100) as f64;
    match mode_for(samples, config) {
        NormalizationMode::ColdStart => {
            let z = (raw - config.cold_mean) / config.cold_std.max(f64::EPSILON);
            (standard_normal_cdf(z) * 100.0 * COLD_START_SCALE).min(config.cold_cap)
        }
        NormalizationMode::Steady => {
            let window = winsorize(samples, config.winsor_low_pct, config.winsor_high_pct);
            percentile_rank(raw, &window) * config.steady_cap
        }
    }
}

/// Clip samples to the values at the given percentiles.
pub fn winsorize(samples: &[i64], low_pct: f64, high_pct: f64) -> Vec<f64> {
    let mut sorted: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let low = percentile(&sorted, low_pct);
    let high = percentile(&sorted, high_pct);
    sorted.into_iter().map(|s| s.clamp(low, high)).collect()
}

/// Linear-interpolated percentile of an ascending slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Share of the window below `value`, counting ties as half.
fn percentile_rank(value: f64, window: &[f64]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let below = window.iter().filter(|&&s| s < value).count() as f64;
    let equal = window.iter().filter(|&&s| s == value).count() as f64;
    (below + 0.5 * equal) / window.len() as f64
}

/// Φ(z) via the Abramowitz–Stegun 7.1.26 erf approximation.
fn standard_normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}
