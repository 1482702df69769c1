pub mod db;
pub mod git;
pub mod jobs;
pub mod orchestrator;
pub mod poller;
pub mod settings;
pub mod summarize;
pub mod workspace;
