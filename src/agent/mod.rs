//! Agent execution
//!
//! A run is one pass of the Think–Tool–Act loop for one inbound envelope.
//! The runner streams [`events::RunEvent`]s while it works and terminates
//! with exactly one `final` or one `error` event.

pub mod events;
pub mod runner;

use serde::{Deserialize, Serialize};

pub use runner::AgentRunner;

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Aborted,
    Failed,
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: uuid::Uuid,
    pub status: RunStatus,
    /// Final assistant text, possibly empty on failure
    pub text: String,
}
