//! Crash recovery.
//!
//! Every transition leaves a [`RecoverySnapshot`] in a [`RecoveryStore`].
//! At start-up the state machine loads it, asks [`planner::plan`] what the
//! session became while the process was gone, and either finalizes it or
//! installs it as a resumable session.

pub mod planner;
mod snapshot;
mod store;

pub use planner::RecoveryPlan;
pub use snapshot::{RecoverySnapshot, SNAPSHOT_VERSION};
pub use store::{MemoryRecoveryStore, RecoveryStore};

pub(crate) use store::supersedes;

use serde::{Deserialize, Serialize};

use crate::outcome::SessionOutcome;
use crate::timer::{SessionType, TimerState};

/// How a still-live session is restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Restore as Paused; the caller must resume explicitly.
    #[default]
    Pause,
    /// Restore a session that was running as Running.
    ContinueRunning,
}

/// A session recovery reinstalled into the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableSession {
    pub session_id: String,
    pub session_type: SessionType,
    pub state: TimerState,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
    pub interruption_count: u32,
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryReport {
    /// No snapshot on disk.
    Nothing,
    /// The session ended while the process was gone.
    Finalized { outcome: SessionOutcome },
    Resumable { session: ResumableSession },
    /// The stored snapshot was unreadable and has been dropped.
    Discarded { reason: String },
}
