use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use git2::{Diff, DiffFindOptions, DiffFormat, DiffOptions, ErrorCode, Oid, Repository, Tree};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChurnCounts {
    pub insertions: i64,
    pub deletions: i64,
}

/// Version-control queries the scoring pipeline depends on.
#[async_trait]
pub trait VcsProvider: Send + Sync {
    /// Line counts of everything changed since `since`, including uncommitted work.
    async fn numstat_since(&self, since: DateTime<Local>) -> Result<ChurnCounts>;

    /// Unified diff text covering the same range as `numstat_since`.
    async fn unified_diff_since(&self, since: DateTime<Local>) -> Result<String>;

    /// Current HEAD commit id, or `None` for a repository without commits.
    async fn head_commit(&self) -> Result<Option<String>>;

    /// Line counts between two commits; `from = None` diffs against the empty tree.
    async fn diff_numstat(&self, from: Option<&str>, to: &str) -> Result<ChurnCounts>;
}

/// `VcsProvider` backed by libgit2. Each call opens the repository on a
/// blocking thread.
#[derive(Debug, Clone)]
pub struct Git2Provider {
    repo_path: PathBuf,
}

impl Git2Provider {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Git2Provider {
            repo_path: repo_path.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }
}

#[async_trait]
impl VcsProvider for Git2Provider {
    async fn numstat_since(&self, since: DateTime<Local>) -> Result<ChurnCounts> {
        let path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path)?;
            let diff = diff_since(&repo, since)?;
            counts_of(&diff)
        })
        .await?
    }

    async fn unified_diff_since(&self, since: DateTime<Local>) -> Result<String> {
        let path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path)?;
            let diff = diff_since(&repo, since)?;
            patch_text(&diff)
        })
        .await?
    }

    async fn head_commit(&self) -> Result<Option<String>> {
        let path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path)?;
            head_commit_id(&repo)
        })
        .await?
    }

    async fn diff_numstat(&self, from: Option<&str>, to: &str) -> Result<ChurnCounts> {
        let path = self.repo_path.clone();
        let from = from.map(str::to_string);
        let to = to.to_string();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path)?;
            let from_tree = match from {
                Some(id) => Some(repo.find_commit(Oid::from_str(&id)?)?.tree()?),
                None => None,
            };
            let to_tree = repo.find_commit(Oid::from_str(&to)?)?.tree()?;
            let diff = repo.diff_tree_to_tree(from_tree.as_ref(), Some(&to_tree), None)?;
            counts_of(&diff)
        })
        .await?
    }
}

fn head_commit_id(repo: &Repository) -> Result<Option<String>> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?.id().to_string())),
        Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Tree of the newest first-parent commit older than `since_ts`.
fn baseline_tree(repo: &Repository, since_ts: i64) -> Result<Option<Tree<'_>>> {
    let head = match repo.head() {
        Ok(head) => head,
        Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    };

    let mut commit = head.peel_to_commit()?;
    loop {
        if commit.time().seconds() < since_ts {
            return Ok(Some(commit.tree()?));
        }
        match commit.parent(0) {
            Ok(parent) => commit = parent,
            Err(_) => return Ok(None),
        }
    }
}

fn diff_since(repo: &Repository, since: DateTime<Local>) -> Result<Diff<'_>> {
    let base = baseline_tree(repo, since.timestamp())?;

    let mut diff = if repo.is_bare() {
        let head_tree = match head_commit_id(repo)? {
            Some(id) => Some(repo.find_commit(Oid::from_str(&id)?)?.tree()?),
            None => None,
        };
        repo.diff_tree_to_tree(base.as_ref(), head_tree.as_ref(), None)?
    } else {
        let mut opts = DiffOptions::new();
        opts.include_untracked(false);
        repo.diff_tree_to_workdir_with_index(base.as_ref(), Some(&mut opts))?
    };

    let mut find = DiffFindOptions::new();
    find.renames(true).copies(false);
    diff.find_similar(Some(&mut find))?;
    Ok(diff)
}

fn counts_of(diff: &Diff<'_>) -> Result<ChurnCounts> {
    let stats = diff.stats()?;
    Ok(ChurnCounts {
        insertions: stats.insertions() as i64,
        deletions: stats.deletions() as i64,
    })
}

fn patch_text(diff: &Diff<'_>) -> Result<String> {
    let mut text = String::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        let content = String::from_utf8_lossy(line.content());
        match line.origin() {
            origin @ ('+' | '-' | ' ') => {
                text.push(origin);
                text.push_str(&content);
            }
            _ => text.push_str(&content),
        }
        true
    })?;
    Ok(text)
}
