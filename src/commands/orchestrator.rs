use crate::analysis::features::extract_features;
use crate::analysis::normalizer::{normalize, SmoothingAnchor};
use crate::analysis::progress::{progress_percent, ProgressInputs};
use crate::analysis::ratchet::{allowance_increment, apply_ratchet};
use crate::analysis::raw_score::compute_raw_score;
use crate::commands::db::SharedStore;
use crate::commands::git::VcsProvider;
use crate::commands::jobs::JobManager;
use crate::commands::settings::ProgressSettings;
use crate::commands::summarize::{
    parse_summary_text, LocalSummarizer, SummaryContext, SummaryResponse, Summarizer,
};
use crate::error::{Error, Result};
use crate::models::day::{AiMetadata, DayUpdate, MergePolicy};
use crate::models::job::{JobKind, JobStatus, ProgressReport};
use chrono::{DateTime, Local, NaiveDate};
use std::sync::Arc;

const KIND: JobKind = JobKind::GenerateTodaySummary;

/// Runs the "generate today's summary" pipeline against one repository.
#[derive(Clone)]
pub struct ProgressOrchestrator {
    store: SharedStore,
    vcs: Arc<dyn VcsProvider>,
    summarizer: Arc<dyn Summarizer>,
    settings: ProgressSettings,
    jobs: Arc<JobManager>,
}

impl ProgressOrchestrator {
    pub fn new(
        store: SharedStore,
        vcs: Arc<dyn VcsProvider>,
        summarizer: Arc<dyn Summarizer>,
        settings: ProgressSettings,
        jobs: Arc<JobManager>,
    ) -> Self {
        ProgressOrchestrator {
            store,
            vcs,
            summarizer,
            settings,
            jobs,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.jobs.status(KIND)
    }

    /// Start a run in the background and return its status immediately.
    /// A run already in flight is returned instead of starting another.
    pub fn start(&self, date: NaiveDate) -> JobStatus {
        let status = match self.jobs.try_start(KIND) {
            Ok(status) => status,
            Err(in_flight) => return in_flight,
        };
        let Some(id) = status.id.clone() else {
            return status;
        };

        let this = self.clone();
        let run_id = id.clone();
        let task = tokio::spawn(async move {
            this.drive(&run_id, date).await;
        });
        // A panicking run must not leave the job marked running.
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                jobs.fail(KIND, &id, format!("summary task aborted: {e}"));
            }
        });
        status
    }

    /// Run to completion on the current task and return the final status.
    pub async fn run(&self, date: NaiveDate) -> JobStatus {
        let status = match self.jobs.try_start(KIND) {
            Ok(status) => status,
            Err(in_flight) => return in_flight,
        };
        match status.id.clone() {
            Some(id) => self.drive(&id, date).await,
            None => status,
        }
    }

    async fn drive(&self, id: &str, date: NaiveDate) -> JobStatus {
        match self.execute(id, date).await {
            Ok(report) => self.jobs.finish(KIND, id, report),
            Err(e) => self.jobs.fail(KIND, id, e.to_string()),
        }
    }

    async fn execute(&self, id: &str, date: NaiveDate) -> Result<ProgressReport> {
        let since = local_midnight(date)?;

        self.jobs.set_progress(KIND, id, 5, "reading changes");
        let counts = self.vcs.numstat_since(since).await?;
        let diff = self.vcs.unified_diff_since(since).await?;

        self.jobs.set_progress(KIND, id, 20, "scoring diff");
        let features = extract_features(&diff);
        let raw_score = compute_raw_score(&features);

        let (history, anchor) = {
            let store = self.store.lock().await;
            let history = store.recent_raw_scores(date, self.settings.normalizer.window_days)?;
            // Only yesterday smooths today; an older day is not an anchor.
            let anchor = date
                .pred_opt()
                .map(|yesterday| store.get_day(yesterday))
                .transpose()?
                .flatten()
                .map(|day| SmoothingAnchor {
                    normalized: day.local_score,
                    raw: day.local_score_raw,
                })
                .unwrap_or_default();
            (history, anchor)
        };
        let local = normalize(raw_score, &history, anchor, &self.settings.normalizer);
        log::debug!(
            "raw score {raw_score} -> local {} ({:?}, {} samples)",
            local.score,
            local.mode,
            history.len()
        );

        // Counts land before the trend is read so the trend reflects them.
        let day = {
            let store = self.store.lock().await;
            store.save_day(
                date,
                &DayUpdate {
                    insertions: Some(counts.insertions),
                    deletions: Some(counts.deletions),
                    ..DayUpdate::default()
                },
                MergePolicy::KeepMax,
            )?
        };
        let previous_base = day.base_score - day.trend;

        let mut inputs = ProgressInputs {
            trend: day.trend,
            previous_base,
            daily_cap_ratio: self.settings.ratchet.daily_cap_ratio,
            local_score: local.score,
            ai_score: 0,
            changed_lines: day.insertions + day.deletions,
            hunks: features.hunks as i64,
        };
        let preliminary = progress_percent(&inputs);

        self.jobs.set_progress(KIND, id, 40, "summarizing");
        let context = SummaryContext {
            date: day.date.clone(),
            insertions: day.insertions,
            deletions: day.deletions,
            raw_score,
            local_score: local.score,
            progress_percent: preliminary,
            features: features.clone(),
        };
        let (response, used_fallback) = self.summarize(&diff, &context).await?;
        let parsed = parse_summary_text(&response.text);

        inputs.ai_score = parsed.score_ai.unwrap_or(0);
        let percent = progress_percent(&inputs);

        let step = apply_ratchet(
            Some(previous_base),
            allowance_increment(day.insertions, day.deletions, parsed.score_ai, Some(local.score)),
            0,
            &self.settings.ratchet,
        );

        self.jobs.set_progress(KIND, id, 85, "saving");
        let ai = AiMetadata {
            model: response.model.clone(),
            provider: response.provider.clone(),
            tokens: response.tokens,
            duration_ms: response.duration_ms,
            chunks_count: response.chunks_count,
            generated_at: Some(chrono::Utc::now().timestamp_millis()),
        };
        let saved = {
            let store = self.store.lock().await;
            store.save_day(
                date,
                &DayUpdate {
                    base_score: Some(step.base_score),
                    ..DayUpdate::default()
                },
                MergePolicy::KeepMax,
            )?;
            let saved = store.save_day(
                date,
                &DayUpdate {
                    summary: Some(parsed.markdown.clone()),
                    ai_score: parsed.score_ai,
                    local_score: Some(local.score),
                    local_score_raw: Some(raw_score),
                    progress_percent: Some(percent),
                    ai: Some(ai.clone()),
                    ..DayUpdate::default()
                },
                MergePolicy::Overwrite,
            )?;
            store.recompute_rollups(date)?;
            saved
        };

        Ok(ProgressReport {
            date: saved.date,
            insertions: saved.insertions,
            deletions: saved.deletions,
            base_score: saved.base_score,
            trend: saved.trend,
            raw_score,
            local_score: local.score,
            ai_score: parsed.score_ai,
            progress_percent: percent,
            summary: parsed.markdown,
            used_fallback,
            ai,
            features,
        })
    }

    /// Chunked first, then single-shot, then local rendering. Returns whether
    /// the local rendering had to stand in for a failed provider.
    async fn summarize(&self, diff: &str, context: &SummaryContext) -> Result<(SummaryResponse, bool)> {
        if diff.trim().is_empty() {
            return Ok((LocalSummarizer.summarize(diff, context).await?, false));
        }

        let remote = match self.summarizer.summarize_chunked(diff, context).await {
            Ok(response) => Ok(response),
            Err(e) => {
                log::debug!("chunked summary unavailable from {}: {e}", self.summarizer.provider_name());
                self.summarizer.summarize(diff, context).await
            }
        };

        match remote {
            Ok(response) => Ok((response, false)),
            Err(e) => {
                log::warn!("summarization failed, rendering locally: {e}");
                Ok((LocalSummarizer.summarize(diff, context).await?, true))
            }
        }
    }
}

fn local_midnight(date: NaiveDate) -> Result<DateTime<Local>> {
    date.and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .ok_or_else(|| Error::InvalidDate(format!("no local midnight for {date}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ratchet::RatchetConfig;
    use crate::commands::db::AggregationStore;
    use crate::commands::git::ChurnCounts;
    use crate::models::job::JobState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const DIFF: &str = "diff --git a/src/app.ts b/src/app.ts
--- a/src/app.ts
+++ b/src/app.ts
@@ -1,2 +1,5 @@
 import x from 'y';
+export function start() {
+  return run();
+}
-const old = 1;
";

    struct FakeVcs {
        counts: ChurnCounts,
        diff: String,
        fail: bool,
        panic: bool,
        gate: Option<Arc<Notify>>,
    }

    impl FakeVcs {
        fn new(insertions: i64, deletions: i64, diff: &str) -> Self {
            FakeVcs {
                counts: ChurnCounts { insertions, deletions },
                diff: diff.to_string(),
                fail: false,
                panic: false,
                gate: None,
            }
        }
    }

    #[async_trait]
    impl VcsProvider for FakeVcs {
        async fn numstat_since(&self, _since: DateTime<Local>) -> Result<ChurnCounts> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(Error::Git(git2::Error::from_str("not a repository")));
            }
            if self.panic {
                panic!("numstat blew up");
            }
            Ok(self.counts)
        }

        async fn unified_diff_since(&self, _since: DateTime<Local>) -> Result<String> {
            Ok(self.diff.clone())
        }

        async fn head_commit(&self) -> Result<Option<String>> {
            Ok(None)
        }

        async fn diff_numstat(&self, _from: Option<&str>, _to: &str) -> Result<ChurnCounts> {
            Ok(self.counts)
        }
    }

    struct ScriptedSummarizer {
        reply: Option<String>,
        chunked: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for ScriptedSummarizer {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        async fn summarize(&self, _diff: &str, _context: &SummaryContext) -> Result<SummaryResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(text) => Ok(SummaryResponse {
                    text: text.clone(),
                    model: Some("scripted-1".to_string()),
                    provider: Some("scripted".to_string()),
                    tokens: Some(42),
                    duration_ms: Some(5),
                    chunks_count: Some(1),
                }),
                None => Err(Error::Summarize("provider down".to_string())),
            }
        }

        async fn summarize_chunked(&self, diff: &str, context: &SummaryContext) -> Result<SummaryResponse> {
            if !self.chunked {
                return Err(Error::Summarize("no chunking".to_string()));
            }
            let mut response = self.summarize(diff, context).await?;
            response.chunks_count = Some(3);
            Ok(response)
        }
    }

    fn scripted(reply: Option<&str>, chunked: bool) -> Arc<ScriptedSummarizer> {
        Arc::new(ScriptedSummarizer {
            reply: reply.map(str::to_string),
            chunked,
            calls: AtomicUsize::new(0),
        })
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn orchestrator(vcs: FakeVcs, summarizer: Arc<dyn Summarizer>) -> (ProgressOrchestrator, SharedStore) {
        let store = AggregationStore::open_in_memory(RatchetConfig::default())
            .expect("store")
            .into_shared();
        let orchestrator = ProgressOrchestrator::new(
            store.clone(),
            Arc::new(vcs),
            summarizer,
            ProgressSettings::default(),
            Arc::new(JobManager::new()),
        );
        (orchestrator, store)
    }

    #[tokio::test]
    async fn full_run_persists_scores_summary_and_rollups() {
        let summarizer = scripted(Some(r#"{"score_ai": 60, "markdown": "Added start()"}"#), true);
        let (orchestrator, store) = orchestrator(FakeVcs::new(3, 1, DIFF), summarizer.clone());

        let status = orchestrator.run(date("2024-03-05")).await;
        assert_eq!(status.state, JobState::Done);
        let report = status.result.expect("report");
        assert_eq!(report.ai_score, Some(60));
        assert_eq!(report.summary, "Added start()");
        assert_eq!(report.ai.chunks_count, Some(3));
        assert!(!report.used_fallback);
        assert!(report.progress_percent >= 1 && report.progress_percent <= 25);
        assert!(report.base_score > 100);
        assert_eq!(report.trend, report.base_score - 100);

        let store = store.lock().await;
        let day = store.get_day(date("2024-03-05")).expect("read").expect("day");
        assert_eq!(day.insertions, 3);
        assert_eq!(day.deletions, 1);
        assert_eq!(day.summary.as_deref(), Some("Added start()"));
        assert_eq!(day.local_score_raw, Some(report.raw_score));
        assert_eq!(day.progress_percent, Some(report.progress_percent));
        assert_eq!(day.ai.model.as_deref(), Some("scripted-1"));
        assert_eq!(day.base_score, report.base_score);

        let week = store
            .get_period(crate::models::day::PeriodKind::Week, "2024-W10")
            .expect("week")
            .expect("week row");
        assert_eq!(week.insertions, 3);
        assert_eq!(week.base_score, report.base_score);
    }

    #[tokio::test]
    async fn single_shot_is_used_when_chunking_is_unsupported() {
        let summarizer = scripted(Some("Plain words, no JSON."), false);
        let (orchestrator, _store) = orchestrator(FakeVcs::new(3, 1, DIFF), summarizer.clone());

        let report = orchestrator.run(date("2024-03-05")).await.result.expect("report");
        assert_eq!(report.ai_score, None);
        assert_eq!(report.summary, "Plain words, no JSON.");
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_local_markdown() {
        let (orchestrator, store) = orchestrator(FakeVcs::new(3, 1, DIFF), scripted(None, true));

        let status = orchestrator.run(date("2024-03-05")).await;
        assert_eq!(status.state, JobState::Done);
        let report = status.result.expect("report");
        assert!(report.used_fallback);
        assert_eq!(report.ai.provider.as_deref(), Some("local"));
        assert!(report.summary.contains("+3 / -1"));

        let store = store.lock().await;
        let day = store.get_day(date("2024-03-05")).expect("read").expect("day");
        assert_eq!(day.ai_score, None);
        assert!(day.summary.is_some());
    }

    #[tokio::test]
    async fn empty_day_skips_provider_and_scores_zero() {
        let summarizer = scripted(Some(r#"{"score_ai": 90, "markdown": "x"}"#), true);
        let (orchestrator, _store) = orchestrator(FakeVcs::new(0, 0, ""), summarizer.clone());

        let report = orchestrator.run(date("2024-03-05")).await.result.expect("report");
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.raw_score, 0);
        assert_eq!(report.local_score, 0);
        assert_eq!(report.progress_percent, 0);
        assert_eq!(report.base_score, 100);
    }

    #[tokio::test]
    async fn vcs_failure_marks_job_errored() {
        let mut vcs = FakeVcs::new(0, 0, "");
        vcs.fail = true;
        let (orchestrator, _store) = orchestrator(vcs, scripted(None, false));

        let status = orchestrator.run(date("2024-03-05")).await;
        assert_eq!(status.state, JobState::Error);
        assert!(status.message.unwrap_or_default().contains("not a repository"));
        assert!(!orchestrator.status().is_running());
    }

    #[tokio::test]
    async fn counts_written_by_poller_are_not_lowered() {
        let (orchestrator, store) = orchestrator(FakeVcs::new(3, 1, DIFF), scripted(None, false));
        store
            .lock()
            .await
            .accumulate_day(date("2024-03-05"), 50, 20)
            .expect("poller write");

        let report = orchestrator.run(date("2024-03-05")).await.result.expect("report");
        assert_eq!(report.insertions, 50);
        assert_eq!(report.deletions, 20);
    }

    #[tokio::test]
    async fn concurrent_start_returns_in_flight_job() {
        let gate = Arc::new(Notify::new());
        let mut vcs = FakeVcs::new(3, 1, DIFF);
        vcs.gate = Some(gate.clone());
        let (orchestrator, _store) = orchestrator(vcs, scripted(None, false));

        let first = orchestrator.start(date("2024-03-05"));
        let second = orchestrator.start(date("2024-03-05"));
        assert!(first.is_running());
        assert_eq!(first.id, second.id);

        gate.notify_one();
        for _ in 0..200 {
            if !orchestrator.status().is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(orchestrator.status().state, JobState::Done);
    }

    #[tokio::test]
    async fn panicking_background_run_marks_job_errored() {
        let mut vcs = FakeVcs::new(3, 1, DIFF);
        vcs.panic = true;
        let (orchestrator, _store) = orchestrator(vcs, scripted(None, false));

        assert!(orchestrator.start(date("2024-03-05")).is_running());
        for _ in 0..200 {
            if !orchestrator.status().is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let status = orchestrator.status();
        assert_eq!(status.state, JobState::Error);
        assert!(status.message.unwrap_or_default().contains("aborted"));
    }

    fn seed_scores(store: &AggregationStore, day: &str) {
        store
            .save_day(
                date(day),
                &DayUpdate {
                    local_score: Some(95),
                    local_score_raw: Some(90),
                    ..DayUpdate::default()
                },
                MergePolicy::Overwrite,
            )
            .expect("seed scores");
    }

    #[tokio::test]
    async fn only_yesterday_anchors_smoothing() {
        let config = ProgressSettings::default().normalizer;

        let (after_gap, store) = orchestrator(FakeVcs::new(3, 1, DIFF), scripted(None, false));
        seed_scores(&*store.lock().await, "2024-03-01");
        let report = after_gap.run(date("2024-03-05")).await.result.expect("report");
        let unanchored = normalize(report.raw_score, &[90], SmoothingAnchor::default(), &config);
        assert_eq!(report.local_score, unanchored.score);

        let (next_day, store) = orchestrator(FakeVcs::new(3, 1, DIFF), scripted(None, false));
        seed_scores(&*store.lock().await, "2024-03-04");
        let report = next_day.run(date("2024-03-05")).await.result.expect("report");
        let anchor = SmoothingAnchor {
            normalized: Some(95),
            raw: Some(90),
        };
        let anchored = normalize(report.raw_score, &[90], anchor, &config);
        assert_eq!(report.local_score, anchored.score);
    }
}
