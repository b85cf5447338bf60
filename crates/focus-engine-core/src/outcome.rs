//! Canonical outcome records and at-most-once emission.
//!
//! An outcome is derived once, at the moment a session terminates, and is
//! never mutated afterwards. The emitter remembers every session id it has
//! finalized; a retried emission returns the cached record without
//! publishing again. With a durable [`OutcomeLedger`] attached the guarantee
//! also holds across process restarts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, PersistenceError};
use crate::events::{Event, EventBus};
use crate::timer::{SessionType, TimerSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    Interrupted,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Interrupted => "interrupted",
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Caller marked the session done.
    Completed,
    /// Elapsed running time reached the planned duration.
    Natural,
    /// Caller stopped or cancelled.
    Stopped,
    /// Caller skipped; not to be read as interrupted-but-worked.
    Skipped,
    /// Deadline passed while the process was not running.
    Recovered,
    /// Recovery found untrustworthy time and gave up.
    ClockSkew,
}

impl EndReason {
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            EndReason::Completed | EndReason::Natural | EndReason::Recovered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::Natural => "natural",
            EndReason::Stopped => "stopped",
            EndReason::Skipped => "skipped",
            EndReason::Recovered => "recovered",
            EndReason::ClockSkew => "clock_skew",
        }
    }
}

/// Immutable record handed to analytics, achievements and leaderboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub session_type: SessionType,
    pub planned_minutes: u64,
    pub actual_minutes: u64,
    pub status: OutcomeStatus,
    pub interruption_count: u32,
    pub perfect: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub end_reason: EndReason,
    #[serde(default)]
    pub task_id: Option<String>,
    pub planned_ms: u64,
    pub actual_ms: u64,
}

impl SessionOutcome {
    /// Derive the outcome of a finalized session.
    pub fn from_session(session: &TimerSession, reason: EndReason) -> Result<Self, EngineError> {
        let (end_time, actual_ms) = match (session.end_time, session.actual_duration_ms) {
            (Some(end), Some(actual)) => (end, actual),
            _ => return Err(EngineError::SessionNotFinalized(session.id.clone())),
        };

        let status = if session.completed {
            OutcomeStatus::Completed
        } else {
            OutcomeStatus::Interrupted
        };

        // A skip taken from inside an open pause is not itself an interruption.
        let interruption_count = match reason {
            EndReason::Skipped => session.interruptions().closed_count(),
            _ => session.interruption_count(),
        };

        Ok(Self {
            session_id: session.id.clone(),
            session_type: session.session_type,
            planned_minutes: ms_to_minutes(session.planned_duration_ms),
            actual_minutes: ms_to_minutes(actual_ms),
            status,
            interruption_count,
            perfect: status == OutcomeStatus::Completed && interruption_count == 0,
            start_time: session.start_time,
            end_time,
            end_reason: reason,
            task_id: session.task_id.clone(),
            planned_ms: session.planned_duration_ms,
            actual_ms,
        })
    }
}

/// Round milliseconds to the nearest whole minute.
pub fn ms_to_minutes(ms: u64) -> u64 {
    ms.saturating_add(30_000) / 60_000
}

/// Durable memory of emitted outcomes.
pub trait OutcomeLedger: Send + Sync {
    fn lookup(&self, session_id: &str) -> Result<Option<SessionOutcome>, PersistenceError>;
    fn record(&self, outcome: &SessionOutcome) -> Result<(), PersistenceError>;
}

/// Converts terminal sessions into outcomes and publishes each one once.
pub struct OutcomeEmitter {
    bus: EventBus,
    ledger: Option<Arc<dyn OutcomeLedger>>,
    finalized: HashMap<String, SessionOutcome>,
}

impl OutcomeEmitter {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            ledger: None,
            finalized: HashMap::new(),
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn OutcomeLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Outcome already settled for `session_id`, in this process or, via
    /// the ledger, in an earlier one. Ledger hits are cached.
    pub fn recorded(&mut self, session_id: &str) -> Option<SessionOutcome> {
        if let Some(existing) = self.finalized.get(session_id) {
            return Some(existing.clone());
        }

        let ledger = self.ledger.as_ref()?;
        match ledger.lookup(session_id) {
            Ok(Some(recorded)) => {
                debug!(session_id, "Outcome found in ledger");
                self.finalized
                    .insert(session_id.to_string(), recorded.clone());
                Some(recorded)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(session_id, error = %err, "Outcome ledger lookup failed");
                None
            }
        }
    }

    /// Emit the outcome for a finalized session.
    ///
    /// Publishes at most once per session id; later calls return the cached
    /// record. A ledger write failure is logged and does not stop the
    /// publish, since subscribers must still hear about the session.
    pub fn emit(
        &mut self,
        session: &TimerSession,
        reason: EndReason,
    ) -> Result<SessionOutcome, EngineError> {
        if let Some(existing) = self.recorded(&session.id) {
            debug!(session_id = %session.id, "Outcome already emitted; returning recorded outcome");
            return Ok(existing);
        }

        let outcome = SessionOutcome::from_session(session, reason)?;

        if let Some(ledger) = &self.ledger {
            if let Err(err) = ledger.record(&outcome) {
                warn!(session_id = %session.id, error = %err, "Failed to record outcome in ledger");
            }
        }

        info!(
            session_id = %outcome.session_id,
            status = outcome.status.as_str(),
            reason = outcome.end_reason.as_str(),
            actual_minutes = outcome.actual_minutes,
            interruptions = outcome.interruption_count,
            perfect = outcome.perfect,
            "Session outcome emitted"
        );

        self.finalized.insert(outcome.session_id.clone(), outcome.clone());
        self.bus.publish(Event::SessionFinished {
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn finished(completed: bool, actual_ms: u64) -> TimerSession {
        let mut session = TimerSession::new(SessionType::Focus, 25 * 60_000, t0(), None);
        session.finalize(t0() + Duration::milliseconds(actual_ms as i64), actual_ms, completed);
        session
    }

    #[derive(Default)]
    struct VecLedger(Mutex<Vec<SessionOutcome>>);

    impl OutcomeLedger for VecLedger {
        fn lookup(&self, session_id: &str) -> Result<Option<SessionOutcome>, PersistenceError> {
            let rows = self.0.lock().unwrap();
            Ok(rows.iter().find(|o| o.session_id == session_id).cloned())
        }

        fn record(&self, outcome: &SessionOutcome) -> Result<(), PersistenceError> {
            self.0.lock().unwrap().push(outcome.clone());
            Ok(())
        }
    }

    #[test]
    fn perfect_requires_completion_and_no_interruptions() {
        let outcome = SessionOutcome::from_session(&finished(true, 25 * 60_000), EndReason::Natural).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert!(outcome.perfect);

        let outcome = SessionOutcome::from_session(&finished(false, 10 * 60_000), EndReason::Stopped).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Interrupted);
        assert!(!outcome.perfect);
    }

    #[test]
    fn completed_with_pause_is_not_perfect() {
        let mut session = TimerSession::new(SessionType::Focus, 25 * 60_000, t0(), None);
        session.interruptions.record_pause(t0() + Duration::minutes(1));
        session.interruptions.record_resume(t0() + Duration::minutes(2));
        session.finalize(t0() + Duration::minutes(26), 25 * 60_000, true);
        let outcome = SessionOutcome::from_session(&session, EndReason::Natural).unwrap();
        assert_eq!(outcome.interruption_count, 1);
        assert!(!outcome.perfect);
    }

    #[test]
    fn unfinalized_session_is_rejected() {
        let session = TimerSession::new(SessionType::Focus, 60_000, t0(), None);
        assert!(matches!(
            SessionOutcome::from_session(&session, EndReason::Stopped),
            Err(EngineError::SessionNotFinalized(_))
        ));
    }

    #[test]
    fn skip_from_open_pause_does_not_count_it() {
        let mut session = TimerSession::new(SessionType::ShortBreak, 5 * 60_000, t0(), None);
        session.interruptions.record_pause(t0() + Duration::minutes(1));
        session.finalize(t0() + Duration::minutes(2), 60_000, false);
        let outcome = SessionOutcome::from_session(&session, EndReason::Skipped).unwrap();
        assert_eq!(outcome.interruption_count, 0);
        assert_eq!(outcome.end_reason, EndReason::Skipped);
    }

    #[test]
    fn minutes_round_to_nearest() {
        assert_eq!(ms_to_minutes(0), 0);
        assert_eq!(ms_to_minutes(29_999), 0);
        assert_eq!(ms_to_minutes(30_000), 1);
        assert_eq!(ms_to_minutes(12 * 60_000), 12);
    }

    #[test]
    fn emit_publishes_once() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut emitter = OutcomeEmitter::new(bus);
        let session = finished(true, 25 * 60_000);

        let first = emitter.emit(&session, EndReason::Natural).unwrap();
        let second = emitter.emit(&session, EndReason::Stopped).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.end_reason, EndReason::Natural);

        assert!(matches!(rx.try_recv(), Ok(Event::SessionFinished { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ledger_suppresses_republish_after_restart() {
        let ledger = Arc::new(VecLedger::default());
        let session = finished(true, 25 * 60_000);

        let mut before_crash = OutcomeEmitter::new(EventBus::default()).with_ledger(ledger.clone());
        before_crash.emit(&session, EndReason::Natural).unwrap();

        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut after_restart = OutcomeEmitter::new(bus).with_ledger(ledger.clone());
        let outcome = after_restart.emit(&session, EndReason::Recovered).unwrap();

        assert_eq!(outcome.end_reason, EndReason::Natural);
        assert!(rx.try_recv().is_err());
        assert_eq!(ledger.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn recorded_reads_through_to_ledger() {
        let ledger = Arc::new(VecLedger::default());
        let session = finished(false, 10 * 60_000);
        OutcomeEmitter::new(EventBus::default())
            .with_ledger(ledger.clone())
            .emit(&session, EndReason::Stopped)
            .unwrap();

        let mut restarted = OutcomeEmitter::new(EventBus::default()).with_ledger(ledger);
        let recorded = restarted.recorded(&session.id).unwrap();
        assert_eq!(recorded.status, OutcomeStatus::Interrupted);
        assert_eq!(recorded.end_reason, EndReason::Stopped);
        assert!(restarted.recorded("other-session").is_none());
    }
}
