use crate::commands::db::SharedStore;
use crate::commands::git::{ChurnCounts, VcsProvider};
use crate::error::{Error, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Store meta key holding the last commit the poller attributed.
pub const LAST_COMMIT_KEY: &str = "poller.last_commit";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerStatus {
    pub last_commit: Option<String>,
    pub last_tick_at: Option<i64>,
    pub last_error: Option<String>,
    pub ticks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    NoCommits,
    Unchanged,
    /// First sighting: the marker is recorded, nothing is attributed.
    Initialized { head: String },
    Accumulated {
        from: String,
        to: String,
        counts: ChurnCounts,
    },
}

/// Folds new commits into today's counts on an interval.
#[derive(Clone)]
pub struct BackgroundPoller {
    store: SharedStore,
    vcs: Arc<dyn VcsProvider>,
    status: Arc<Mutex<PollerStatus>>,
}

impl BackgroundPoller {
    pub fn new(store: SharedStore, vcs: Arc<dyn VcsProvider>) -> Self {
        BackgroundPoller {
            store,
            vcs,
            status: Arc::new(Mutex::new(PollerStatus::default())),
        }
    }

    pub fn status(&self) -> PollerStatus {
        lock_status(&self.status).clone()
    }

    pub async fn tick(&self, today: NaiveDate) -> Result<TickOutcome> {
        let Some(head) = self.vcs.head_commit().await? else {
            return Ok(TickOutcome::NoCommits);
        };

        let last = self.store.lock().await.get_meta(LAST_COMMIT_KEY)?;
        let last = match last {
            Some(last) if last == head => return Ok(TickOutcome::Unchanged),
            Some(last) => last,
            None => {
                self.store.lock().await.set_meta(LAST_COMMIT_KEY, &head)?;
                log::info!("poller tracking from {head}");
                return Ok(TickOutcome::Initialized { head });
            }
        };

        let counts = match self.vcs.diff_numstat(Some(&last), &head).await {
            Ok(counts) => counts,
            Err(Error::Git(e)) if e.code() == git2::ErrorCode::NotFound => {
                log::warn!("last seen commit {last} is gone, restarting from {head}");
                self.store.lock().await.set_meta(LAST_COMMIT_KEY, &head)?;
                return Ok(TickOutcome::Initialized { head });
            }
            Err(e) => return Err(e),
        };

        let store = self.store.lock().await;
        if store.get_meta(LAST_COMMIT_KEY)?.as_deref() != Some(last.as_str()) {
            return Ok(TickOutcome::Unchanged);
        }
        store.accumulate_day(today, counts.insertions, counts.deletions)?;
        store.recompute_rollups(today)?;
        store.set_meta(LAST_COMMIT_KEY, &head)?;
        log::debug!(
            "poller attributed +{} -{} for {last}..{head}",
            counts.insertions,
            counts.deletions
        );

        Ok(TickOutcome::Accumulated {
            from: last,
            to: head,
            counts,
        })
    }

    /// Tick and record the result in the status. Errors are kept as
    /// `last_error` and cleared by the next successful tick.
    pub async fn tick_and_record(&self, today: NaiveDate) -> Option<TickOutcome> {
        let result = self.tick(today).await;
        let mut status = lock_status(&self.status);
        status.ticks += 1;
        status.last_tick_at = Some(chrono::Utc::now().timestamp_millis());
        match result {
            Ok(outcome) => {
                match &outcome {
                    TickOutcome::Initialized { head } => status.last_commit = Some(head.clone()),
                    TickOutcome::Accumulated { to, .. } => status.last_commit = Some(to.clone()),
                    TickOutcome::NoCommits | TickOutcome::Unchanged => {}
                }
                status.last_error = None;
                Some(outcome)
            }
            Err(e) => {
                log::warn!("poller tick failed: {e}");
                status.last_error = Some(e.to_string());
                None
            }
        }
    }

    /// Run ticks every `every` until the returned handle is shut down or dropped.
    pub fn spawn(self, every: Duration) -> PollerHandle {
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let status = self.status.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = interval.tick() => {
                        self.tick_and_record(Local::now().date_naive()).await;
                    }
                }
            }
            log::debug!("poller stopped");
        });

        PollerHandle {
            shutdown: Some(shutdown),
            task: Some(task),
            status,
        }
    }
}

/// Owner of a running poll loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct PollerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    status: Arc<Mutex<PollerStatus>>,
}

impl PollerHandle {
    pub fn status(&self) -> PollerStatus {
        lock_status(&self.status).clone()
    }

    /// Stop the loop and wait for an in-progress tick to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

fn lock_status(status: &Mutex<PollerStatus>) -> MutexGuard<'_, PollerStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ratchet::RatchetConfig;
    use crate::commands::db::AggregationStore;
    use crate::models::day::PeriodKind;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MovingHead {
        head: Mutex<Option<String>>,
        delta: ChurnCounts,
        fail_next: AtomicBool,
    }

    impl MovingHead {
        fn new() -> Arc<Self> {
            Arc::new(MovingHead {
                head: Mutex::new(None),
                delta: ChurnCounts {
                    insertions: 12,
                    deletions: 4,
                },
                fail_next: AtomicBool::new(false),
            })
        }

        fn move_to(&self, id: &str) {
            *self.head.lock().expect("head") = Some(id.to_string());
        }
    }

    #[async_trait]
    impl VcsProvider for MovingHead {
        async fn numstat_since(&self, _since: DateTime<Local>) -> Result<ChurnCounts> {
            Ok(ChurnCounts::default())
        }

        async fn unified_diff_since(&self, _since: DateTime<Local>) -> Result<String> {
            Ok(String::new())
        }

        async fn head_commit(&self) -> Result<Option<String>> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::Git(git2::Error::from_str("lock file exists")));
            }
            Ok(self.head.lock().expect("head").clone())
        }

        async fn diff_numstat(&self, _from: Option<&str>, _to: &str) -> Result<ChurnCounts> {
            Ok(self.delta)
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn poller(vcs: Arc<MovingHead>) -> (BackgroundPoller, SharedStore) {
        let store = AggregationStore::open_in_memory(RatchetConfig::default())
            .expect("store")
            .into_shared();
        (BackgroundPoller::new(store.clone(), vcs), store)
    }

    #[tokio::test]
    async fn first_sighting_only_records_marker() {
        let vcs = MovingHead::new();
        let (poller, store) = poller(vcs.clone());
        let today = date("2024-03-05");

        assert_eq!(poller.tick(today).await.expect("tick"), TickOutcome::NoCommits);

        vcs.move_to("aaa");
        assert_eq!(
            poller.tick(today).await.expect("tick"),
            TickOutcome::Initialized { head: "aaa".to_string() }
        );
        assert_eq!(poller.tick(today).await.expect("tick"), TickOutcome::Unchanged);

        let store = store.lock().await;
        assert_eq!(store.get_meta(LAST_COMMIT_KEY).expect("meta").as_deref(), Some("aaa"));
        assert!(store.get_day(today).expect("day").is_none());
    }

    #[tokio::test]
    async fn new_head_accumulates_into_today() {
        let vcs = MovingHead::new();
        let (poller, store) = poller(vcs.clone());
        let today = date("2024-03-05");

        vcs.move_to("aaa");
        poller.tick(today).await.expect("init");
        vcs.move_to("bbb");
        let outcome = poller.tick(today).await.expect("tick");
        assert!(matches!(outcome, TickOutcome::Accumulated { ref to, .. } if to == "bbb"));
        vcs.move_to("ccc");
        poller.tick(today).await.expect("tick");

        let store = store.lock().await;
        let day = store.get_day(today).expect("read").expect("day");
        assert_eq!(day.insertions, 24);
        assert_eq!(day.deletions, 8);
        let month = store
            .get_period(PeriodKind::Month, "2024-03")
            .expect("month")
            .expect("month row");
        assert_eq!(month.insertions, 24);
        assert_eq!(store.get_meta(LAST_COMMIT_KEY).expect("meta").as_deref(), Some("ccc"));
    }

    #[tokio::test]
    async fn tick_errors_are_captured_and_retried() {
        let vcs = MovingHead::new();
        let (poller, _store) = poller(vcs.clone());
        let today = date("2024-03-05");
        vcs.move_to("aaa");

        vcs.fail_next.store(true, Ordering::SeqCst);
        assert!(poller.tick_and_record(today).await.is_none());
        let status = poller.status();
        assert!(status.last_error.unwrap_or_default().contains("lock file exists"));

        assert!(poller.tick_and_record(today).await.is_some());
        let status = poller.status();
        assert_eq!(status.last_error, None);
        assert_eq!(status.last_commit.as_deref(), Some("aaa"));
        assert_eq!(status.ticks, 2);
    }

    #[tokio::test]
    async fn spawned_loop_ticks_until_shutdown() {
        let vcs = MovingHead::new();
        vcs.move_to("aaa");
        let (poller, _store) = poller(vcs);

        let handle = poller.spawn(Duration::from_millis(10));
        for _ in 0..200 {
            if handle.status().ticks >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.status().ticks >= 2);
        assert_eq!(handle.status().last_commit.as_deref(), Some("aaa"));
        handle.shutdown().await.expect("shutdown");
    }
}
