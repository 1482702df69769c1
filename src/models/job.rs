use serde::{Deserialize, Serialize};

use super::day::AiMetadata;
use super::features::DiffFeatureSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    GenerateTodaySummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: Option<String>,
    pub kind: JobKind,
    pub state: JobState,
    pub progress: u8,
    pub message: Option<String>,
    pub result: Option<ProgressReport>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl JobStatus {
    pub fn idle(kind: JobKind) -> Self {
        JobStatus {
            id: None,
            kind,
            state: JobState::Idle,
            progress: 0,
            message: None,
            result: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}

/// Payload returned by one "generate today's summary" cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub date: String,
    pub insertions: i64,
    pub deletions: i64,
    pub base_score: i64,
    pub trend: i64,
    pub raw_score: i64,
    pub local_score: i64,
    pub ai_score: Option<i64>,
    pub progress_percent: i64,
    pub summary: String,
    pub used_fallback: bool,
    pub ai: AiMetadata,
    pub features: DiffFeatureSummary,
}
