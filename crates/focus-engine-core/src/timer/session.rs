use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clock::millis_between;
use super::interruption::InterruptionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Focus,
    ShortBreak,
    LongBreak,
    Custom,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Focus => "focus",
            SessionType::ShortBreak => "short_break",
            SessionType::LongBreak => "long_break",
            SessionType::Custom => "custom",
        }
    }

    pub fn is_break(&self) -> bool {
        matches!(self, SessionType::ShortBreak | SessionType::LongBreak)
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "focus" => Ok(SessionType::Focus),
            "short_break" | "short" => Ok(SessionType::ShortBreak),
            "long_break" | "long" => Ok(SessionType::LongBreak),
            "custom" => Ok(SessionType::Custom),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

/// Lifecycle state of the state machine.
///
/// ```text
/// Idle -> Running <-> Paused
/// Running | Paused -> Completed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl TimerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TimerState::Completed | TimerState::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TimerState::Running | TimerState::Paused)
    }
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimerState::Idle => "idle",
            TimerState::Running => "running",
            TimerState::Paused => "paused",
            TimerState::Completed => "completed",
            TimerState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One run of the timer for a single focus or break interval.
///
/// Only the state machine mutates a session; everything else sees clones
/// or snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSession {
    pub id: String,
    pub session_type: SessionType,
    pub planned_duration_ms: u64,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub actual_duration_ms: Option<u64>,
    #[serde(default)]
    pub paused_duration_ms: u64,
    #[serde(flatten)]
    pub(crate) interruptions: InterruptionTracker,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TimerSession {
    pub(crate) fn new(
        session_type: SessionType,
        planned_duration_ms: u64,
        start_time: DateTime<Utc>,
        task_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_type,
            planned_duration_ms,
            start_time,
            end_time: None,
            completed: false,
            task_id,
            actual_duration_ms: None,
            paused_duration_ms: 0,
            interruptions: InterruptionTracker::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn pause_timestamps(&self) -> &[DateTime<Utc>] {
        self.interruptions.pause_timestamps()
    }

    pub fn resume_timestamps(&self) -> &[DateTime<Utc>] {
        self.interruptions.resume_timestamps()
    }

    pub fn interruptions(&self) -> &InterruptionTracker {
        &self.interruptions
    }

    pub fn interruption_count(&self) -> u32 {
        self.interruptions.interruption_count()
    }

    pub fn is_paused(&self) -> bool {
        self.interruptions.is_paused()
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    /// Running time at `now`, excluding paused time.
    ///
    /// While paused, time is frozen at the open pause. Computed from the
    /// wall-clock delta against `start_time` each call; never accumulated.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> u64 {
        let effective_now = self.interruptions.open_pause().unwrap_or(now);
        let span = millis_between(self.start_time, effective_now).max(0) as u64;
        span.saturating_sub(self.paused_duration_ms)
    }

    /// Deadline for natural completion given the pauses closed so far.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.start_time
            + chrono::Duration::milliseconds(
                self.planned_duration_ms
                    .saturating_add(self.paused_duration_ms)
                    .min(i64::MAX as u64) as i64,
            )
    }

    /// Set the terminal fields together so they are never half-set.
    pub(crate) fn finalize(&mut self, end_time: DateTime<Utc>, actual_ms: u64, completed: bool) {
        self.end_time = Some(end_time);
        self.actual_duration_ms = Some(actual_ms);
        self.completed = completed;
    }
}
