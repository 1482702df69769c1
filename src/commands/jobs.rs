use crate::models::job::{JobKind, JobState, JobStatus, ProgressReport};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Tracks one status per job kind and refuses to start a kind that is
/// already running.
#[derive(Debug, Default)]
pub struct JobManager {
    jobs: Mutex<HashMap<JobKind, JobStatus>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobKind, JobStatus>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self, kind: JobKind) -> JobStatus {
        self.lock()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| JobStatus::idle(kind))
    }

    /// Mark `kind` running under a fresh id. When a run is already in flight
    /// its status comes back as the error value and nothing changes.
    pub fn try_start(&self, kind: JobKind) -> Result<JobStatus, JobStatus> {
        let mut jobs = self.lock();
        if let Some(current) = jobs.get(&kind) {
            if current.is_running() {
                return Err(current.clone());
            }
        }

        let status = JobStatus {
            id: Some(uuid::Uuid::new_v4().to_string()),
            kind,
            state: JobState::Running,
            progress: 0,
            message: Some("starting".to_string()),
            result: None,
            started_at: Some(chrono::Utc::now().timestamp_millis()),
            finished_at: None,
        };
        jobs.insert(kind, status.clone());
        log::info!("job {:?} started ({})", kind, status.id.as_deref().unwrap_or_default());
        Ok(status)
    }

    /// Advance progress. Values never move backwards and updates for a
    /// stale id are ignored.
    pub fn set_progress(&self, kind: JobKind, id: &str, progress: u8, message: &str) {
        let mut jobs = self.lock();
        if let Some(status) = running_with_id(&mut jobs, kind, id) {
            status.progress = status.progress.max(progress.min(99));
            status.message = Some(message.to_string());
        }
    }

    pub fn finish(&self, kind: JobKind, id: &str, report: ProgressReport) -> JobStatus {
        let mut jobs = self.lock();
        match running_with_id(&mut jobs, kind, id) {
            Some(status) => {
                status.state = JobState::Done;
                status.progress = 100;
                status.message = Some("done".to_string());
                status.result = Some(report);
                status.finished_at = Some(chrono::Utc::now().timestamp_millis());
                log::info!("job {:?} finished ({id})", kind);
                status.clone()
            }
            None => jobs.get(&kind).cloned().unwrap_or_else(|| JobStatus::idle(kind)),
        }
    }

    pub fn fail(&self, kind: JobKind, id: &str, message: String) -> JobStatus {
        let mut jobs = self.lock();
        match running_with_id(&mut jobs, kind, id) {
            Some(status) => {
                log::error!("job {:?} failed ({id}): {message}", kind);
                status.state = JobState::Error;
                status.message = Some(message);
                status.finished_at = Some(chrono::Utc::now().timestamp_millis());
                status.clone()
            }
            None => jobs.get(&kind).cloned().unwrap_or_else(|| JobStatus::idle(kind)),
        }
    }
}

fn running_with_id<'a>(
    jobs: &'a mut HashMap<JobKind, JobStatus>,
    kind: JobKind,
    id: &str,
) -> Option<&'a mut JobStatus> {
    jobs.get_mut(&kind)
        .filter(|status| status.is_running() && status.id.as_deref() == Some(id))
}
