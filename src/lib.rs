pub mod analysis;
pub mod commands;
pub mod error;
pub mod models;

pub use commands::db::{AggregationStore, SharedStore};
pub use commands::orchestrator::ProgressOrchestrator;
pub use commands::poller::{BackgroundPoller, PollerHandle};
pub use commands::workspace::{ProgressApp, RepoSession};
pub use error::{Error, Result};
