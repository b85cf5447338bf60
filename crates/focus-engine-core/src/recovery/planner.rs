//! Decides what happens to a snapshot found at start-up.
//!
//! Pure: takes the snapshot, the current time and the policy, returns a
//! plan. The state machine applies it.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::snapshot::RecoverySnapshot;
use super::RecoveryPolicy;
use crate::outcome::EndReason;
use crate::timer::clock::millis_between;
use crate::timer::{TimerSession, TimerState};

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryPlan {
    /// The session is over; `session` is already finalized.
    Finalize {
        session: TimerSession,
        reason: EndReason,
    },
    /// The session can continue from `state`.
    Resume {
        session: TimerSession,
        state: TimerState,
        remaining_ms: u64,
    },
}

pub fn plan(snapshot: RecoverySnapshot, now: DateTime<Utc>, policy: RecoveryPolicy) -> RecoveryPlan {
    if now < snapshot.last_persisted_at || now < snapshot.start_time {
        warn!(
            session_id = %snapshot.session_id,
            persisted_at = %snapshot.last_persisted_at,
            now = %now,
            "Wall clock is behind the snapshot; abandoning session"
        );
        let end_time = snapshot.last_persisted_at;
        let actual = snapshot
            .elapsed_at(end_time)
            .min(snapshot.planned_duration_ms);
        let mut session = snapshot.into_session();
        session.finalize(end_time, actual, false);
        return RecoveryPlan::Finalize {
            session,
            reason: EndReason::ClockSkew,
        };
    }

    let natural = snapshot.natural_completion_at(now);
    if now >= natural {
        let planned = snapshot.planned_duration_ms;
        let mut session = snapshot.into_session();
        session.finalize(natural, planned, true);
        return RecoveryPlan::Finalize {
            session,
            reason: EndReason::Recovered,
        };
    }

    let remaining_ms = millis_between(now, natural).max(0) as u64;
    let was_paused = snapshot.was_paused();
    let mut session = snapshot.into_session();
    let state = if was_paused {
        TimerState::Paused
    } else {
        match policy {
            RecoveryPolicy::ContinueRunning => TimerState::Running,
            RecoveryPolicy::Pause => {
                // The gap while the process was dead counts as running time.
                session.interruptions.record_pause(now);
                TimerState::Paused
            }
        }
    };

    RecoveryPlan::Resume {
        session,
        state,
        remaining_ms,
    }
}
