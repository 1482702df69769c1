use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no active repository: open a repository before running this operation")]
    NoActiveRepository,
    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),
    #[error("not a git repository: {}", .0.display())]
    NotGitRepo(PathBuf),
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("summarization failed: {0}")]
    Summarize(String),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("import is only supported for file-backed stores")]
    ImportUnsupported,
    #[error("settings error: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, Error>;
