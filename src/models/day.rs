use serde::{Deserialize, Serialize};

/// Floor of the cumulative base score.
pub const BASE_SCORE_FLOOR: i64 = 100;

/// Metadata recorded for the summarization call that produced a day's summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiMetadata {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub chunks_count: Option<i64>,
    pub generated_at: Option<i64>,
}

/// One row per local calendar date (`YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRecord {
    pub date: String,
    pub insertions: i64,
    pub deletions: i64,
    pub base_score: i64,
    pub trend: i64,
    pub summary: Option<String>,
    pub ai_score: Option<i64>,
    pub local_score: Option<i64>,
    pub local_score_raw: Option<i64>,
    pub progress_percent: Option<i64>,
    pub ai: AiMetadata,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DayRecord {
    pub fn empty(date: &str) -> Self {
        DayRecord {
            date: date.to_string(),
            insertions: 0,
            deletions: 0,
            base_score: BASE_SCORE_FLOOR,
            trend: 0,
            summary: None,
            ai_score: None,
            local_score: None,
            local_score_raw: None,
            progress_percent: None,
            ai: AiMetadata::default(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// How a write reconciles against a row that may have been touched concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    Overwrite,
    /// Numeric fields keep the larger of the stored and incoming value.
    KeepMax,
}

/// Partial update applied by `save_day`; `None` leaves the stored field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayUpdate {
    pub insertions: Option<i64>,
    pub deletions: Option<i64>,
    pub base_score: Option<i64>,
    pub summary: Option<String>,
    pub ai_score: Option<i64>,
    pub local_score: Option<i64>,
    pub local_score_raw: Option<i64>,
    pub progress_percent: Option<i64>,
    pub ai: Option<AiMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Week,
    Month,
    Year,
}

impl PeriodKind {
    pub fn table(self) -> &'static str {
        match self {
            PeriodKind::Week => "weeks",
            PeriodKind::Month => "months",
            PeriodKind::Year => "years",
        }
    }
}

/// Week, month or year rollup derived from day rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRecord {
    pub kind: PeriodKind,
    pub key: String,
    pub insertions: i64,
    pub deletions: i64,
    pub base_score: i64,
    pub summary: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
