use crate::commands::db::{store_path, AggregationStore, SharedStore};
use crate::commands::git::{Git2Provider, VcsProvider};
use crate::commands::jobs::JobManager;
use crate::commands::orchestrator::ProgressOrchestrator;
use crate::commands::poller::{BackgroundPoller, PollerHandle};
use crate::commands::settings::{load_progress_settings, ProgressSettings};
use crate::commands::summarize::{build_summarizer, Summarizer};
use crate::error::{Error, Result};
use git2::Repository;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMeta {
    pub path: String,
    pub repo_name: String,
    pub branch: String,
    pub store_path: String,
}

/// Validate a repository path and prepare its `.devpulse` directory.
pub fn inspect_repository(path: &Path) -> Result<RepoMeta> {
    if !path.exists() {
        return Err(Error::PathNotFound(path.to_path_buf()));
    }

    let repo = Repository::open(path).map_err(|_| Error::NotGitRepo(path.to_path_buf()))?;

    let repo_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let branch = repo
        .head()
        .ok()
        .and_then(|head| head.shorthand().map(|s| s.to_string()))
        .unwrap_or_else(|| "main".to_string());

    Ok(RepoMeta {
        path: path.to_string_lossy().to_string(),
        repo_name,
        branch,
        store_path: store_path(path).to_string_lossy().to_string(),
    })
}

/// Everything bound to one repository: its store, collaborators and poller.
pub struct RepoSession {
    pub meta: RepoMeta,
    pub settings: ProgressSettings,
    pub store: SharedStore,
    pub orchestrator: ProgressOrchestrator,
    poller: BackgroundPoller,
    poller_handle: Option<PollerHandle>,
}

impl RepoSession {
    pub fn open(path: &Path) -> Result<Self> {
        let settings = load_progress_settings(path)?;
        let summarizer = build_summarizer(&settings.summarizer);
        Self::open_with(path, Arc::new(Git2Provider::new(path)), summarizer)
    }

    /// Open with caller-supplied collaborators. Settings and the store still
    /// come from the repository's `.devpulse` directory.
    pub fn open_with(
        path: &Path,
        vcs: Arc<dyn VcsProvider>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self> {
        let meta = inspect_repository(path)?;
        let settings = load_progress_settings(path)?;
        let store = AggregationStore::open_for_repo(path, settings.ratchet.clone())?.into_shared();

        let orchestrator = ProgressOrchestrator::new(
            store.clone(),
            vcs.clone(),
            summarizer,
            settings.clone(),
            Arc::new(JobManager::new()),
        );
        let poller = BackgroundPoller::new(store.clone(), vcs);

        log::info!("opened repository {} ({})", meta.repo_name, meta.path);
        Ok(RepoSession {
            meta,
            settings,
            store,
            orchestrator,
            poller,
            poller_handle: None,
        })
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.meta.path)
    }

    pub fn poller(&self) -> &BackgroundPoller {
        &self.poller
    }

    /// Start the interval loop. Must be called from within a tokio runtime.
    pub fn start_polling(&mut self) {
        if self.poller_handle.is_none() {
            self.poller_handle = Some(self.poller.clone().spawn(self.settings.poll_interval));
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller_handle.is_some()
    }

    pub async fn close(mut self) -> Result<()> {
        if let Some(handle) = self.poller_handle.take() {
            handle.shutdown().await?;
        }
        log::info!("closed repository {}", self.meta.repo_name);
        Ok(())
    }
}

/// Holds at most one active repository session.
#[derive(Default)]
pub struct ProgressApp {
    session: Option<RepoSession>,
}

impl ProgressApp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to `path`. The previous session's poller is stopped and its
    /// store handle released before the new one is returned.
    pub async fn open_repository(&mut self, path: &Path) -> Result<&mut RepoSession> {
        let session = RepoSession::open(path)?;
        self.replace_session(session).await
    }

    pub async fn replace_session(&mut self, session: RepoSession) -> Result<&mut RepoSession> {
        if let Some(previous) = self.session.take() {
            previous.close().await?;
        }
        Ok(self.session.insert(session))
    }

    pub fn active(&self) -> Result<&RepoSession> {
        self.session.as_ref().ok_or(Error::NoActiveRepository)
    }

    pub fn active_mut(&mut self) -> Result<&mut RepoSession> {
        self.session.as_mut().ok_or(Error::NoActiveRepository)
    }

    pub async fn close(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}
