//! Durable projection of an in-flight session.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::timer::clock::millis_between;
use crate::timer::{InterruptionTracker, SessionType, TimerSession};

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub session_id: String,
    pub session_type: SessionType,
    pub planned_duration_ms: u64,
    pub start_time: DateTime<Utc>,
    pub paused_duration_ms: u64,
    pub pause_timestamps: Vec<DateTime<Utc>>,
    /// Lets recovery tell an open pause apart from a running session.
    #[serde(default)]
    pub resume_timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub last_persisted_at: DateTime<Utc>,
}

impl RecoverySnapshot {
    pub fn capture(session: &TimerSession, at: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            session_id: session.id.clone(),
            session_type: session.session_type,
            planned_duration_ms: session.planned_duration_ms,
            start_time: session.start_time,
            paused_duration_ms: session.paused_duration_ms,
            pause_timestamps: session.pause_timestamps().to_vec(),
            resume_timestamps: session.resume_timestamps().to_vec(),
            task_id: session.task_id.clone(),
            metadata: session.metadata.clone(),
            last_persisted_at: at,
        }
    }

    /// Parse a stored snapshot, rejecting schemas this build does not know.
    pub fn from_json(raw: &str) -> Result<Self, PersistenceError> {
        let snapshot: RecoverySnapshot =
            serde_json::from_str(raw).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        if snapshot.planned_duration_ms == 0 {
            return Err(PersistenceError::Corrupt(
                "planned_duration_ms must be greater than zero".into(),
            ));
        }
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string(self).map_err(|e| PersistenceError::WriteFailed(e.to_string()))
    }

    fn tracker(&self) -> InterruptionTracker {
        InterruptionTracker::from_parts(
            self.pause_timestamps.clone(),
            self.resume_timestamps.clone(),
        )
    }

    /// Closed pause total. The stored sum is trusted unless the recorded
    /// pause/resume pairs show more.
    fn closed_paused_ms(&self) -> u64 {
        self.paused_duration_ms.max(
            self.tracker()
                .paused_between(self.start_time, self.last_persisted_at),
        )
    }

    /// Open pause at persist time, if the session was paused.
    pub fn open_pause(&self) -> Option<DateTime<Utc>> {
        self.tracker().open_pause()
    }

    pub fn was_paused(&self) -> bool {
        self.open_pause().is_some()
    }

    /// When the session would complete naturally, judged at `now`.
    ///
    /// Closed pauses shift the deadline forward. A pause still open at
    /// persist time shifts it by the whole time since, so a paused session
    /// never completes while the process is away.
    pub fn natural_completion_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = self.start_time
            + Duration::milliseconds(
                self.planned_duration_ms
                    .saturating_add(self.closed_paused_ms())
                    .min(i64::MAX as u64) as i64,
            );
        match self.open_pause() {
            Some(opened) => base + Duration::milliseconds(millis_between(opened, now).max(0)),
            None => base,
        }
    }

    /// Running time as of `at`, excluding pauses.
    pub fn elapsed_at(&self, at: DateTime<Utc>) -> u64 {
        let effective = self.open_pause().unwrap_or(at).min(at);
        let span = millis_between(self.start_time, effective).max(0) as u64;
        span.saturating_sub(self.closed_paused_ms())
    }

    /// Rebuild the session this snapshot was taken from.
    pub fn into_session(self) -> TimerSession {
        let interruptions = self.tracker();
        let paused_duration_ms = self.closed_paused_ms();
        TimerSession {
            id: self.session_id,
            session_type: self.session_type,
            planned_duration_ms: self.planned_duration_ms,
            start_time: self.start_time,
            end_time: None,
            completed: false,
            task_id: self.task_id,
            actual_duration_ms: None,
            paused_duration_ms,
            interruptions,
            metadata: self.metadata,
        }
    }
}
