use crate::analysis::normalizer::NormalizerConfig;
use crate::analysis::ratchet::RatchetConfig;
use crate::commands::db::STORE_DIR;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_SCHEMA_VERSION: i64 = 2;
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarizerProvider {
    /// HTTP provider when the API key variable is set, local rendering otherwise.
    Auto,
    Local,
    OpenAi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizerConfig {
    pub provider: SummarizerProvider,
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub chunk_chars: usize,
}

/// Validated settings snapshot; every default is resolved at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSettings {
    pub normalizer: NormalizerConfig,
    pub ratchet: RatchetConfig,
    pub poll_interval: Duration,
    pub summarizer: SummarizerConfig,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        ProgressSettings::from_value(&default_settings())
    }
}

impl ProgressSettings {
    /// Build from a sanitized settings document.
    pub fn from_value(settings: &Value) -> Self {
        let defaults = NormalizerConfig::default();
        let n = settings.get("normalizer").cloned().unwrap_or_else(|| json!({}));
        let f = |key: &str, fallback: f64| n.get(key).and_then(Value::as_f64).unwrap_or(fallback);

        let normalizer = NormalizerConfig {
            cold_start_samples: n
                .get("coldStartSamples")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(defaults.cold_start_samples),
            window_days: n
                .get("windowDays")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(defaults.window_days),
            alpha: f("alpha", defaults.alpha),
            cold_cap: f("coldCap", defaults.cold_cap),
            steady_cap: f("steadyCap", defaults.steady_cap),
            winsor_low_pct: f("winsorLowPct", defaults.winsor_low_pct),
            winsor_high_pct: f("winsorHighPct", defaults.winsor_high_pct),
            cold_mean: f("coldMean", defaults.cold_mean),
            cold_std: f("coldStd", defaults.cold_std),
            regression_threshold: f("regressionThreshold", defaults.regression_threshold),
            regression_cap: f("regressionCap", defaults.regression_cap),
        };

        let ratchet = RatchetConfig {
            daily_cap_ratio: settings
                .get("dailyCapRatio")
                .and_then(Value::as_f64)
                .unwrap_or(RatchetConfig::default().daily_cap_ratio),
        };

        let poll_interval = Duration::from_secs(
            settings
                .get("pollIntervalSecs")
                .and_then(Value::as_u64)
                .unwrap_or(60),
        );

        let s = settings.get("summarizer").cloned().unwrap_or_else(|| json!({}));
        let text = |key: &str, fallback: &str| {
            s.get(key)
                .and_then(Value::as_str)
                .unwrap_or(fallback)
                .to_string()
        };
        let provider = match s.get("provider").and_then(Value::as_str) {
            Some("local") => SummarizerProvider::Local,
            Some("openai") => SummarizerProvider::OpenAi,
            _ => SummarizerProvider::Auto,
        };
        let summarizer = SummarizerConfig {
            provider,
            endpoint: text("endpoint", "https://api.openai.com/v1/chat/completions"),
            model: text("model", "gpt-4o-mini"),
            api_key_env: text("apiKeyEnv", "OPENAI_API_KEY"),
            chunk_chars: s
                .get("chunkChars")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(12_000),
        };

        ProgressSettings {
            normalizer,
            ratchet,
            poll_interval,
            summarizer,
        }
    }
}

pub fn load_progress_settings(repo_path: &Path) -> Result<ProgressSettings> {
    let settings = load_settings_from_disk(repo_path)?;
    Ok(ProgressSettings::from_value(&settings))
}

pub fn load_settings_from_disk(repo_path: &Path) -> Result<Value> {
    let path = settings_path(repo_path);
    ensure_store_dir(repo_path)?;

    let original = if path.exists() {
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str::<Value>(&raw).unwrap_or_else(|e| {
            log::warn!("ignoring unreadable {}: {e}", path.display());
            json!({})
        })
    } else {
        json!({})
    };

    let migrated = migrate_settings(original.clone());
    if migrated != original || !path.exists() {
        write_settings_file(&path, &migrated)?;
    }

    Ok(migrated)
}

pub fn save_settings_to_disk(repo_path: &Path, settings: Value) -> Result<Value> {
    let path = settings_path(repo_path);
    ensure_store_dir(repo_path)?;

    let mut merged = load_settings_from_disk(repo_path).unwrap_or_else(|_| default_settings());
    merge_settings(&mut merged, &settings);

    let migrated = migrate_settings(merged);
    write_settings_file(&path, &migrated)?;
    Ok(migrated)
}

fn settings_path(repo_path: &Path) -> PathBuf {
    repo_path.join(STORE_DIR).join(SETTINGS_FILE)
}

fn ensure_store_dir(repo_path: &Path) -> Result<()> {
    fs::create_dir_all(repo_path.join(STORE_DIR))?;
    Ok(())
}

fn write_settings_file(path: &Path, settings: &Value) -> Result<()> {
    let raw = serde_json::to_string_pretty(settings)?;
    fs::write(path, raw)?;
    Ok(())
}

fn migrate_settings(input: Value) -> Value {
    let defaults = default_settings();
    let mut out = match input {
        Value::Object(map) => Value::Object(map),
        _ => Value::Object(Map::new()),
    };

    let version = out
        .get("schema_version")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    if version < 1 {
        // V0 stored the daily cap as a whole-number percentage.
        migrate_cap_ratio_from_percentage(&mut out);
    }

    if version < 2 {
        // V2 introduces the summarizer block with explicit chunking.
        ensure_key(&mut out, "summarizer", json!({}));
    }

    deep_merge_defaults(&mut out, &defaults);
    sanitize_settings(&mut out);
    if let Some(obj) = out.as_object_mut() {
        obj.insert("schema_version".to_string(), json!(SETTINGS_SCHEMA_VERSION));
    }

    out
}

fn default_settings() -> Value {
    let n = NormalizerConfig::default();
    json!({
        "schema_version": SETTINGS_SCHEMA_VERSION,
        "normalizer": {
            "coldStartSamples": n.cold_start_samples,
            "windowDays": n.window_days,
            "alpha": n.alpha,
            "coldCap": n.cold_cap,
            "steadyCap": n.steady_cap,
            "winsorLowPct": n.winsor_low_pct,
            "winsorHighPct": n.winsor_high_pct,
            "coldMean": n.cold_mean,
            "coldStd": n.cold_std,
            "regressionThreshold": n.regression_threshold,
            "regressionCap": n.regression_cap
        },
        "dailyCapRatio": RatchetConfig::default().daily_cap_ratio,
        "pollIntervalSecs": 60,
        "summarizer": {
            "provider": "auto",
            "endpoint": "https://api.openai.com/v1/chat/completions",
            "model": "gpt-4o-mini",
            "apiKeyEnv": "OPENAI_API_KEY",
            "chunkChars": 12000
        }
    })
}

fn deep_merge_defaults(target: &mut Value, defaults: &Value) {
    let (Some(target_obj), Some(default_obj)) = (target.as_object_mut(), defaults.as_object()) else {
        return;
    };

    for (key, default_value) in default_obj {
        match target_obj.get_mut(key) {
            Some(existing) => {
                if existing.is_object() && default_value.is_object() {
                    deep_merge_defaults(existing, default_value);
                }
            }
            None => {
                target_obj.insert(key.clone(), default_value.clone());
            }
        }
    }
}

fn ensure_key(target: &mut Value, key: &str, value: Value) {
    if let Some(obj) = target.as_object_mut() {
        obj.entry(key.to_string()).or_insert(value);
    }
}

fn merge_settings(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(target_obj), Value::Object(incoming_obj)) => {
            for (key, value) in incoming_obj {
                if let Some(existing) = target_obj.get_mut(key) {
                    merge_settings(existing, value);
                } else {
                    target_obj.insert(key.clone(), value.clone());
                }
            }
        }
        (target_slot, incoming_value) => {
            *target_slot = incoming_value.clone();
        }
    }
}

fn migrate_cap_ratio_from_percentage(settings: &mut Value) {
    let Some(obj) = settings.as_object_mut() else {
        return;
    };
    if let Some(percent) = obj.get("dailyCapRatio").and_then(Value::as_f64) {
        if percent > 1.0 {
            obj.insert("dailyCapRatio".to_string(), json!(percent / 100.0));
        }
    }
}

fn sanitize_settings(settings: &mut Value) {
    let defaults = NormalizerConfig::default();
    let Some(obj) = settings.as_object_mut() else {
        return;
    };

    clamp_f64(obj, "dailyCapRatio", 0.01, 1.0, RatchetConfig::default().daily_cap_ratio);
    clamp_u64(obj, "pollIntervalSecs", 5, 3600, 60);

    if let Some(n) = obj.get_mut("normalizer").and_then(Value::as_object_mut) {
        clamp_u64(n, "coldStartSamples", 1, 365, defaults.cold_start_samples as u64);
        clamp_u64(n, "windowDays", 7, 365, u64::from(defaults.window_days));
        clamp_f64(n, "alpha", 0.0, 1.0, defaults.alpha);
        clamp_f64(n, "coldCap", 1.0, 100.0, defaults.cold_cap);
        clamp_f64(n, "steadyCap", 1.0, 100.0, defaults.steady_cap);
        clamp_f64(n, "winsorLowPct", 0.0, 49.0, defaults.winsor_low_pct);
        clamp_f64(n, "winsorHighPct", 51.0, 100.0, defaults.winsor_high_pct);
        clamp_f64(n, "coldMean", 0.0, 100.0, defaults.cold_mean);
        clamp_f64(n, "coldStd", 1.0, 100.0, defaults.cold_std);
        clamp_f64(n, "regressionThreshold", 1.0, 100.0, defaults.regression_threshold);
        clamp_f64(n, "regressionCap", 1.0, 100.0, defaults.regression_cap);
    } else {
        obj.insert("normalizer".to_string(), default_settings()["normalizer"].clone());
    }

    if let Some(s) = obj.get_mut("summarizer").and_then(Value::as_object_mut) {
        sanitize_enum(s, "provider", &["auto", "local", "openai"], "auto");
        clamp_u64(s, "chunkChars", 1000, 200_000, 12_000);
        ensure_string(s, "endpoint", "https://api.openai.com/v1/chat/completions");
        ensure_string(s, "model", "gpt-4o-mini");
        ensure_string(s, "apiKeyEnv", "OPENAI_API_KEY");
    } else {
        obj.insert("summarizer".to_string(), default_settings()["summarizer"].clone());
    }
}

fn clamp_u64(map: &mut Map<String, Value>, key: &str, min: u64, max: u64, default: u64) {
    let raw = map.get(key).and_then(Value::as_u64).unwrap_or(default);
    map.insert(key.to_string(), json!(raw.clamp(min, max)));
}

fn clamp_f64(map: &mut Map<String, Value>, key: &str, min: f64, max: f64, default: f64) {
    let raw = map
        .get(key)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .unwrap_or(default);
    map.insert(key.to_string(), json!(raw.clamp(min, max)));
}

fn sanitize_enum(map: &mut Map<String, Value>, key: &str, allowed: &[&str], default: &str) {
    let valid = map
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| allowed.contains(value))
        .unwrap_or(default);
    map.insert(key.to_string(), json!(valid));
}

fn ensure_string(map: &mut Map<String, Value>, key: &str, default: &str) {
    let value = map
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
        .to_string();
    map.insert(key.to_string(), json!(value));
}
