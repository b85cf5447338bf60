//! Pause/resume accounting for a single session.
//!
//! The tracker owns the two timestamp sequences and nothing else. It has no
//! timers of its own; the state machine feeds it timestamps and adds the
//! intervals it returns to the session's paused duration.
//!
//! Invariant: `resumes.len() <= pauses.len() <= resumes.len() + 1`, with
//! equality on the right exactly while paused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::clock::millis_between;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionTracker {
    #[serde(default)]
    pause_timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    resume_timestamps: Vec<DateTime<Utc>>,
}

impl InterruptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted sequences.
    ///
    /// Surplus resumes (more resumes than pauses) are dropped so the
    /// invariant holds for whatever was on disk.
    pub fn from_parts(pauses: Vec<DateTime<Utc>>, mut resumes: Vec<DateTime<Utc>>) -> Self {
        if resumes.len() > pauses.len() {
            resumes.truncate(pauses.len());
        }
        if pauses.len() > resumes.len() + 1 {
            // Several unmatched pauses: keep the latest open one only.
            let keep = resumes.len() + 1;
            let open = pauses[pauses.len() - 1];
            let mut trimmed: Vec<_> = pauses.into_iter().take(keep - 1).collect();
            trimmed.push(open);
            return Self {
                pause_timestamps: trimmed,
                resume_timestamps: resumes,
            };
        }
        Self {
            pause_timestamps: pauses,
            resume_timestamps: resumes,
        }
    }

    /// Record the start of an interruption. Returns `false` if already paused.
    pub fn record_pause(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_paused() {
            return false;
        }
        self.pause_timestamps.push(at);
        true
    }

    /// Record the end of an interruption.
    ///
    /// Returns the length of the just-closed pause in milliseconds, or `None`
    /// if there was no open pause. A resume stamped before its pause (wall
    /// clock stepped back) closes a zero-length interval.
    pub fn record_resume(&mut self, at: DateTime<Utc>) -> Option<u64> {
        let opened = self.open_pause()?;
        self.resume_timestamps.push(at);
        Some(millis_between(opened, at).max(0) as u64)
    }

    /// Number of interruptions, counting one that is still open.
    pub fn interruption_count(&self) -> u32 {
        self.pause_timestamps.len() as u32
    }

    /// Number of pause/resume cycles that have been closed.
    pub fn closed_count(&self) -> u32 {
        self.resume_timestamps.len() as u32
    }

    pub fn is_paused(&self) -> bool {
        self.pause_timestamps.len() > self.resume_timestamps.len()
    }

    /// Timestamp of the currently open pause, if any.
    pub fn open_pause(&self) -> Option<DateTime<Utc>> {
        if self.is_paused() {
            self.pause_timestamps.last().copied()
        } else {
            None
        }
    }

    /// Closed pause time falling inside `[from, to]`. An open pause is not
    /// counted.
    pub fn paused_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
        self.pause_timestamps
            .iter()
            .zip(self.resume_timestamps.iter())
            .map(|(p, r)| millis_between((*p).max(from), (*r).min(to)).max(0) as u64)
            .sum()
    }

    pub fn pause_timestamps(&self) -> &[DateTime<Utc>] {
        &self.pause_timestamps
    }

    pub fn resume_timestamps(&self) -> &[DateTime<Utc>] {
        &self.resume_timestamps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn pause_resume_returns_closed_interval() {
        let mut tracker = InterruptionTracker::new();
        assert!(tracker.record_pause(t0()));
        assert!(tracker.is_paused());
        let closed = tracker.record_resume(t0() + Duration::minutes(2));
        assert_eq!(closed, Some(120_000));
        assert!(!tracker.is_paused());
        assert_eq!(tracker.interruption_count(), 1);
        assert_eq!(tracker.paused_between(t0(), t0() + Duration::hours(1)), 120_000);
    }

    #[test]
    fn paused_between_clips_to_window() {
        let mut tracker = InterruptionTracker::new();
        tracker.record_pause(t0() + Duration::minutes(5));
        tracker.record_resume(t0() + Duration::minutes(7));
        tracker.record_pause(t0() + Duration::minutes(10));
        tracker.record_resume(t0() + Duration::minutes(13));
        tracker.record_pause(t0() + Duration::minutes(20));

        let end = t0() + Duration::minutes(30);
        assert_eq!(tracker.paused_between(t0(), end), 5 * 60_000);
        assert_eq!(
            tracker.paused_between(t0() + Duration::minutes(6), t0() + Duration::minutes(11)),
            2 * 60_000
        );
        assert_eq!(tracker.paused_between(end, t0()), 0);
    }

    #[test]
    fn double_pause_is_rejected() {
        let mut tracker = InterruptionTracker::new();
        assert!(tracker.record_pause(t0()));
        assert!(!tracker.record_pause(t0() + Duration::seconds(1)));
        assert_eq!(tracker.pause_timestamps().len(), 1);
    }

    #[test]
    fn resume_without_pause_is_rejected() {
        let mut tracker = InterruptionTracker::new();
        assert_eq!(tracker.record_resume(t0()), None);
        assert!(tracker.resume_timestamps().is_empty());
    }

    #[test]
    fn backwards_resume_closes_zero_interval() {
        let mut tracker = InterruptionTracker::new();
        tracker.record_pause(t0());
        assert_eq!(tracker.record_resume(t0() - Duration::seconds(30)), Some(0));
    }

    #[test]
    fn open_pause_counts_as_interruption() {
        let mut tracker = InterruptionTracker::new();
        tracker.record_pause(t0());
        tracker.record_resume(t0() + Duration::seconds(10));
        tracker.record_pause(t0() + Duration::seconds(20));
        assert_eq!(tracker.interruption_count(), 2);
        assert_eq!(tracker.closed_count(), 1);
        assert_eq!(tracker.open_pause(), Some(t0() + Duration::seconds(20)));
    }

    #[test]
    fn from_parts_repairs_surplus_resumes() {
        let tracker = InterruptionTracker::from_parts(vec![t0()], vec![t0(), t0()]);
        assert_eq!(tracker.resume_timestamps().len(), 1);
        assert!(!tracker.is_paused());
    }

    #[test]
    fn from_parts_keeps_latest_open_pause() {
        let late = t0() + Duration::minutes(3);
        let tracker = InterruptionTracker::from_parts(vec![t0(), late], vec![]);
        assert_eq!(tracker.pause_timestamps(), &[late]);
        assert_eq!(tracker.open_pause(), Some(late));
    }
}
