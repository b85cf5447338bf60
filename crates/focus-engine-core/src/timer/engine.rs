//! Session state machine.
//!
//! Wall-clock based and single-threaded. Elapsed time is recomputed from
//! `start_time` on every observation, so a missed tick only delays when
//! natural completion is noticed. The caller drives `tick()`; fired
//! background wakes arrive through `on_wake()`.
//!
//! ## State Transitions
//!
//! ```text
//! Idle -> Running <-> Paused
//! Running | Paused -> Completed | Cancelled
//! Completed | Cancelled -> Running (next start)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let mut machine = SessionStateMachine::new(config, parts);
//! machine.recover()?;
//! machine.start(StartRequest::minutes(SessionType::Focus, 25))?;
//! // In a loop:
//! machine.tick(); // TickOutcome::Finished once the plan is reached
//! ```

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::clock::millis_between;
use super::{SessionClock, SessionType, TimerSession, TimerState};
use crate::error::{CoreError, EngineError, PersistenceError};
use crate::events::{Event, EventBus};
use crate::outcome::{EndReason, OutcomeEmitter, OutcomeLedger, OutcomeStatus, SessionOutcome};
use crate::recovery::planner::{self, RecoveryPlan};
use crate::recovery::{RecoveryReport, RecoverySnapshot, RecoveryStore, ResumableSession};
use crate::scheduler::{BackgroundScheduler, Registration, WakePayload};
use crate::storage::EngineConfig;

/// Forward wall-clock jumps larger than this (relative to monotonic time)
/// are logged; usually the machine slept.
const CLOCK_JUMP_LOG_MS: i64 = 2_000;

/// Collaborators the state machine drives.
#[derive(Clone)]
pub struct EngineParts {
    pub clock: Arc<dyn SessionClock>,
    pub store: Arc<dyn RecoveryStore>,
    pub scheduler: Arc<dyn BackgroundScheduler>,
    pub bus: EventBus,
    pub ledger: Option<Arc<dyn OutcomeLedger>>,
}

/// Parameters for a new session.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub session_type: SessionType,
    pub planned_ms: u64,
    pub task_id: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StartRequest {
    pub fn new(session_type: SessionType, planned_ms: u64) -> Self {
        Self {
            session_type,
            planned_ms,
            task_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn minutes(session_type: SessionType, minutes: u32) -> Self {
        Self::new(session_type, u64::from(minutes) * 60_000)
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Result of a pause or resume.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Event),
    /// The session had already ended (or just ended naturally); nothing
    /// else changed.
    Finished(SessionOutcome),
}

/// Result of a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Idle,
    Progress {
        state: TimerState,
        elapsed_ms: u64,
        remaining_ms: u64,
    },
    Finished(SessionOutcome),
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    wall: DateTime<Utc>,
    mono_ms: u64,
}

/// Bookkeeping for snapshot writes that did not land.
#[derive(Debug, Default)]
struct PersistenceState {
    last_saved_at: Option<DateTime<Utc>>,
    /// The live session has changes not yet on disk.
    dirty: bool,
    /// A terminal session whose snapshot could not be deleted.
    pending_clear: Option<String>,
    failures: u32,
    retry_at: Option<DateTime<Utc>>,
}

/// Owns the single live session and every transition on it.
///
/// Not synchronized itself; callers serialize access (see
/// [`SessionService`](crate::SessionService)).
pub struct SessionStateMachine {
    config: EngineConfig,
    clock: Arc<dyn SessionClock>,
    store: Arc<dyn RecoveryStore>,
    scheduler: Arc<dyn BackgroundScheduler>,
    bus: EventBus,
    emitter: OutcomeEmitter,
    state: TimerState,
    session: Option<TimerSession>,
    outcome: Option<SessionOutcome>,
    /// High-water mark so elapsed never decreases under a wall-clock step back.
    /// Queries raise it too, so every reading is monotonic.
    elapsed_floor_ms: Cell<u64>,
    last_observed: Option<Observation>,
    persistence: PersistenceState,
    scheduling_limited: bool,
}

impl SessionStateMachine {
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        let mut emitter = OutcomeEmitter::new(parts.bus.clone());
        if let Some(ledger) = parts.ledger {
            emitter = emitter.with_ledger(ledger);
        }
        Self {
            config,
            clock: parts.clock,
            store: parts.store,
            scheduler: parts.scheduler,
            bus: parts.bus,
            emitter,
            state: TimerState::Idle,
            session: None,
            outcome: None,
            elapsed_floor_ms: Cell::new(0),
            last_observed: None,
            persistence: PersistenceState::default(),
            scheduling_limited: false,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn session(&self) -> Option<&TimerSession> {
        self.session.as_ref()
    }

    /// Outcome of the most recent session, once it has ended.
    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_scheduling_limited(&self) -> bool {
        self.scheduling_limited
    }

    /// A snapshot write or delete is waiting for retry.
    pub fn has_pending_write(&self) -> bool {
        self.persistence.dirty || self.persistence.pending_clear.is_some()
    }

    pub fn elapsed_ms(&self) -> u64 {
        match &self.session {
            Some(session) if self.state.is_active() => {
                let elapsed = session
                    .elapsed_at(self.clock.now())
                    .max(self.elapsed_floor_ms.get());
                self.elapsed_floor_ms.set(elapsed);
                elapsed
            }
            Some(session) => session.actual_duration_ms.unwrap_or(0),
            None => 0,
        }
    }

    pub fn remaining_ms(&self) -> u64 {
        match &self.session {
            Some(session) if self.state.is_active() => {
                session.planned_duration_ms.saturating_sub(self.elapsed_ms())
            }
            _ => 0,
        }
    }

    /// Point-in-time view for UIs and the CLI.
    pub fn snapshot_event(&self) -> Event {
        let session = self.session.as_ref();
        Event::StateSnapshot {
            state: self.state,
            session_id: session.map(|s| s.id.clone()),
            session_type: session.map(|s| s.session_type),
            task_id: session.and_then(|s| s.task_id.clone()),
            planned_ms: session.map_or(0, |s| s.planned_duration_ms),
            elapsed_ms: self.elapsed_ms(),
            remaining_ms: self.remaining_ms(),
            interruption_count: session.map_or(0, |s| s.interruption_count()),
            scheduling_limited: self.scheduling_limited,
            at: self.clock.now(),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Begin a new session. Allowed from Idle and from a finished session.
    pub fn start(&mut self, request: StartRequest) -> Result<Event, EngineError> {
        if self.state.is_active() {
            return Err(EngineError::InvalidStateTransition {
                operation: "start",
                state: self.state,
            });
        }
        if request.planned_ms == 0 {
            return Err(EngineError::InvalidDuration);
        }

        let now = self.clock.now();
        let mut session =
            TimerSession::new(request.session_type, request.planned_ms, now, request.task_id);
        session.metadata = request.metadata;

        let event = Event::SessionStarted {
            session_id: session.id.clone(),
            session_type: session.session_type,
            planned_ms: session.planned_duration_ms,
            task_id: session.task_id.clone(),
            at: now,
        };
        info!(
            session_id = %session.id,
            session_type = %session.session_type,
            planned_ms = session.planned_duration_ms,
            "Session started"
        );

        self.install(session, TimerState::Running, now);
        self.bus.publish(event.clone());
        Ok(event)
    }

    pub fn pause(&mut self) -> Result<Transition, EngineError> {
        match self.state {
            TimerState::Running => {}
            TimerState::Completed | TimerState::Cancelled => return self.already_finished("pause"),
            state => {
                return Err(EngineError::InvalidStateTransition {
                    operation: "pause",
                    state,
                })
            }
        }

        let now = self.clock.now();
        let elapsed = self.observe(now);
        if self.natural_due(elapsed) {
            return self.finish_natural(now).map(Transition::Finished);
        }

        let session = self.live_mut("pause")?;
        session.interruptions.record_pause(now);
        let session_id = session.id.clone();
        let interruption_count = session.interruption_count();
        let remaining_ms = session.planned_duration_ms.saturating_sub(elapsed);

        self.scheduler.cancel(&session_id);
        self.state = TimerState::Paused;
        self.persist(now);

        info!(session_id = %session_id, remaining_ms, interruption_count, "Session paused");
        let event = Event::SessionPaused {
            session_id,
            remaining_ms,
            interruption_count,
            at: now,
        };
        self.bus.publish(event.clone());
        Ok(Transition::Applied(event))
    }

    pub fn resume(&mut self) -> Result<Transition, EngineError> {
        match self.state {
            TimerState::Paused => {}
            TimerState::Completed | TimerState::Cancelled => return self.already_finished("resume"),
            state => {
                return Err(EngineError::InvalidStateTransition {
                    operation: "resume",
                    state,
                })
            }
        }

        let now = self.clock.now();
        let session = self.live_mut("resume")?;
        if let Some(closed_ms) = session.interruptions.record_resume(now) {
            session.paused_duration_ms = session.paused_duration_ms.saturating_add(closed_ms);
        }
        let session_id = session.id.clone();

        self.state = TimerState::Running;
        let elapsed = self.observe(now);
        let remaining_ms = self.planned_ms().saturating_sub(elapsed);
        self.arm(now);
        self.persist(now);

        info!(session_id = %session_id, remaining_ms, "Session resumed");
        let event = Event::SessionResumed {
            session_id,
            remaining_ms,
            at: now,
        };
        self.bus.publish(event.clone());
        Ok(Transition::Applied(event))
    }

    /// Observe the clock. Completes the session once elapsed time is within
    /// tolerance of the plan, and drives periodic and retried snapshot writes.
    pub fn tick(&mut self) -> TickOutcome {
        let now = self.clock.now();
        match self.state {
            TimerState::Idle => {
                self.retry_clear(now);
                TickOutcome::Idle
            }
            TimerState::Completed | TimerState::Cancelled => {
                self.retry_clear(now);
                match &self.outcome {
                    Some(outcome) => TickOutcome::Finished(outcome.clone()),
                    None => TickOutcome::Idle,
                }
            }
            TimerState::Paused => {
                self.maintain_snapshot(now);
                TickOutcome::Progress {
                    state: self.state,
                    elapsed_ms: self.elapsed_floor_ms.get(),
                    remaining_ms: self.planned_ms().saturating_sub(self.elapsed_floor_ms.get()),
                }
            }
            TimerState::Running => {
                let elapsed = self.observe(now);
                if self.natural_due(elapsed) {
                    match self.finish_natural(now) {
                        Ok(outcome) => return TickOutcome::Finished(outcome),
                        Err(err) => warn!(error = %err, "Natural completion failed"),
                    }
                }
                self.maintain_snapshot(now);
                debug!(elapsed_ms = elapsed, "Tick");
                TickOutcome::Progress {
                    state: self.state,
                    elapsed_ms: elapsed,
                    remaining_ms: self.planned_ms().saturating_sub(elapsed),
                }
            }
        }
    }

    /// Mark the live session done. `actual = min(elapsed, planned)`.
    pub fn complete(&mut self) -> Result<SessionOutcome, EngineError> {
        if let Some(outcome) = self.finished_outcome() {
            return Ok(outcome);
        }
        self.require_active("complete")?;

        let now = self.clock.now();
        let elapsed = self.observe(now);
        let actual = elapsed.min(self.planned_ms());
        self.finalize(now, actual, true, EndReason::Completed)
    }

    /// End the live session early.
    pub fn stop(&mut self) -> Result<SessionOutcome, EngineError> {
        self.end_early("stop", EndReason::Stopped)
    }

    pub fn cancel(&mut self) -> Result<SessionOutcome, EngineError> {
        self.stop()
    }

    /// Like [`stop`](Self::stop) but tagged so consumers do not read it as
    /// an interrupted work session.
    pub fn skip(&mut self) -> Result<SessionOutcome, EngineError> {
        self.end_early("skip", EndReason::Skipped)
    }

    /// A background wake fired for `session_id`.
    ///
    /// Returns the outcome if the session is (now) finished. Wakes for any
    /// other session, or for a paused one, are ignored.
    pub fn on_wake(&mut self, session_id: &str) -> Option<SessionOutcome> {
        let live = self.session.as_ref().map(|s| s.id.as_str());
        if live != Some(session_id) {
            debug!(session_id, "Ignoring wake for a session that is not live");
            return None;
        }

        match self.state {
            TimerState::Completed | TimerState::Cancelled => self.outcome.clone(),
            TimerState::Idle | TimerState::Paused => {
                debug!(session_id, state = %self.state, "Ignoring stale wake");
                None
            }
            TimerState::Running => {
                let now = self.clock.now();
                let elapsed = self.observe(now);
                if self.natural_due(elapsed) {
                    match self.finish_natural(now) {
                        Ok(outcome) => Some(outcome),
                        Err(err) => {
                            warn!(session_id, error = %err, "Wake completion failed");
                            None
                        }
                    }
                } else {
                    debug!(session_id, elapsed_ms = elapsed, "Wake arrived early; re-arming");
                    self.arm(now);
                    None
                }
            }
        }
    }

    /// Install a session rebuilt by recovery. Only from Idle or a finished
    /// session; `state` must be Running or Paused.
    pub fn adopt(
        &mut self,
        mut session: TimerSession,
        state: TimerState,
    ) -> Result<ResumableSession, EngineError> {
        if self.state.is_active() || !state.is_active() || session.is_finalized() {
            return Err(EngineError::InvalidStateTransition {
                operation: "adopt",
                state: self.state,
            });
        }

        let now = self.clock.now();
        match state {
            TimerState::Paused if !session.is_paused() => {
                session.interruptions.record_pause(now);
            }
            TimerState::Running if session.is_paused() => {
                return Err(EngineError::InvalidStateTransition {
                    operation: "adopt",
                    state: TimerState::Paused,
                });
            }
            _ => {}
        }

        info!(session_id = %session.id, state = %state, "Adopted recovered session");
        self.install(session, state, now);

        let session = self.live_mut("adopt")?;
        let elapsed_ms = session.elapsed_at(now);
        Ok(ResumableSession {
            session_id: session.id.clone(),
            session_type: session.session_type,
            state,
            elapsed_ms,
            remaining_ms: session.planned_duration_ms.saturating_sub(elapsed_ms),
            interruption_count: session.interruption_count(),
            task_id: session.task_id.clone(),
        })
    }

    /// Reconcile the stored snapshot with the current time.
    ///
    /// Run once at start-up, before any other command.
    pub fn recover(&mut self) -> Result<RecoveryReport, CoreError> {
        if self.state.is_active() {
            return Err(EngineError::InvalidStateTransition {
                operation: "recover",
                state: self.state,
            }
            .into());
        }

        let snapshot = match self.store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(RecoveryReport::Nothing),
            Err(err @ (PersistenceError::Corrupt(_) | PersistenceError::UnsupportedVersion { .. })) => {
                warn!(error = %err, "Discarding unreadable recovery snapshot");
                if let Err(purge_err) = self.store.purge() {
                    warn!(error = %purge_err, "Failed to purge recovery snapshot");
                }
                return Ok(RecoveryReport::Discarded {
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let now = self.clock.now();
        info!(
            session_id = %snapshot.session_id,
            persisted_at = %snapshot.last_persisted_at,
            "Recovering session from snapshot"
        );

        // The session ended but the process died before its snapshot was
        // deleted. The recorded outcome is final.
        if let Some(outcome) = self.emitter.recorded(&snapshot.session_id) {
            info!(
                session_id = %outcome.session_id,
                status = outcome.status.as_str(),
                "Snapshot belongs to a finished session; dropping it"
            );
            let mut session = snapshot.into_session();
            session.finalize(
                outcome.end_time,
                outcome.actual_ms,
                outcome.status == OutcomeStatus::Completed,
            );
            self.settle(session, outcome.clone(), now);
            return Ok(RecoveryReport::Finalized { outcome });
        }

        match planner::plan(snapshot, now, self.config.recovery_policy) {
            RecoveryPlan::Finalize { session, reason } => {
                let outcome = self.emitter.emit(&session, reason)?;
                self.settle(session, outcome.clone(), now);
                Ok(RecoveryReport::Finalized { outcome })
            }
            RecoveryPlan::Resume { session, state, .. } => {
                let resumable = self.adopt(session, state)?;
                self.bus.publish(Event::RecoveryAvailable {
                    session_id: resumable.session_id.clone(),
                    session_type: resumable.session_type,
                    remaining_ms: resumable.remaining_ms,
                    at: now,
                });
                Ok(RecoveryReport::Resumable { session: resumable })
            }
        }
    }

    /// Write any pending snapshot change now, ignoring backoff.
    ///
    /// Returns `true` when nothing is left pending.
    pub fn flush(&mut self) -> bool {
        let now = self.clock.now();
        if self.persistence.dirty && self.state.is_active() {
            self.persist(now);
        }
        if let Some(session_id) = self.persistence.pending_clear.clone() {
            self.clear_snapshot(&session_id, now);
        }
        !self.has_pending_write()
    }

    // ── Internals ────────────────────────────────────────────────────

    fn install(&mut self, session: TimerSession, state: TimerState, now: DateTime<Utc>) {
        self.elapsed_floor_ms.set(session.elapsed_at(now));
        self.outcome = None;
        self.scheduling_limited = false;
        self.last_observed = Some(Observation {
            wall: now,
            mono_ms: self.clock.monotonic_ms(),
        });
        self.session = Some(session);
        self.state = state;
        if state == TimerState::Running {
            self.arm(now);
        }
        self.persist(now);
    }

    /// Install a session recovery found already over.
    fn settle(&mut self, session: TimerSession, outcome: SessionOutcome, now: DateTime<Utc>) {
        let session_id = session.id.clone();
        self.state = match outcome.status {
            OutcomeStatus::Completed => TimerState::Completed,
            OutcomeStatus::Interrupted => TimerState::Cancelled,
        };
        self.elapsed_floor_ms.set(outcome.actual_ms);
        self.session = Some(session);
        self.outcome = Some(outcome);
        self.clear_snapshot(&session_id, now);
    }

    fn planned_ms(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.planned_duration_ms)
    }

    fn live_mut(&mut self, operation: &'static str) -> Result<&mut TimerSession, EngineError> {
        let state = self.state;
        self.session
            .as_mut()
            .ok_or(EngineError::InvalidStateTransition { operation, state })
    }

    fn require_active(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(EngineError::InvalidStateTransition {
                operation,
                state: self.state,
            })
        }
    }

    fn finished_outcome(&self) -> Option<SessionOutcome> {
        if self.state.is_terminal() {
            self.outcome.clone()
        } else {
            None
        }
    }

    fn already_finished(&self, operation: &'static str) -> Result<Transition, EngineError> {
        match &self.outcome {
            Some(outcome) => Ok(Transition::Finished(outcome.clone())),
            None => Err(EngineError::InvalidStateTransition {
                operation,
                state: self.state,
            }),
        }
    }

    fn natural_due(&self, elapsed_ms: u64) -> bool {
        elapsed_ms.saturating_add(self.config.tolerance_ms) >= self.planned_ms()
    }

    /// Advance the elapsed high-water mark to `now`.
    fn observe(&mut self, now: DateTime<Utc>) -> u64 {
        let mono_ms = self.clock.monotonic_ms();
        if let Some(prev) = self.last_observed {
            let wall_delta = millis_between(prev.wall, now);
            let mono_delta = mono_ms.saturating_sub(prev.mono_ms) as i64;
            if wall_delta < 0 {
                warn!(
                    stepped_back_ms = -wall_delta,
                    elapsed_ms = self.elapsed_floor_ms.get(),
                    "Wall clock moved backwards; holding elapsed time"
                );
            } else if wall_delta - mono_delta > CLOCK_JUMP_LOG_MS {
                debug!(
                    jumped_ms = wall_delta - mono_delta,
                    "Wall clock ran ahead of monotonic time"
                );
            }
        }
        self.last_observed = Some(Observation { wall: now, mono_ms });

        let raw = self.session.as_ref().map_or(0, |s| s.elapsed_at(now));
        let elapsed = self.elapsed_floor_ms.get().max(raw);
        self.elapsed_floor_ms.set(elapsed);
        elapsed
    }

    fn end_early(
        &mut self,
        operation: &'static str,
        reason: EndReason,
    ) -> Result<SessionOutcome, EngineError> {
        if let Some(outcome) = self.finished_outcome() {
            return Ok(outcome);
        }
        self.require_active(operation)?;

        let now = self.clock.now();
        let elapsed = self.observe(now);
        if self.state == TimerState::Running && elapsed >= self.planned_ms() {
            // The deadline passed before anyone observed it.
            return self.finish_natural(now);
        }
        self.finalize(now, elapsed, false, reason)
    }

    /// Finalize as a natural completion observed at `now`.
    ///
    /// Inside the early tolerance window the session ends at `now` with the
    /// running time actually elapsed. Observed well after the deadline
    /// (process was suspended), the deadline itself is the end time.
    /// Callers observe the clock first.
    fn finish_natural(&mut self, now: DateTime<Utc>) -> Result<SessionOutcome, EngineError> {
        let tolerance_ms = self.config.tolerance_ms as i64;
        let elapsed = self.elapsed_floor_ms.get();
        let session = self.live_mut("complete")?;
        let planned = session.planned_duration_ms;
        let deadline = session.deadline();
        let late_ms = millis_between(deadline, now);
        let (end_time, actual_ms) = if late_ms > tolerance_ms {
            (deadline, planned)
        } else if late_ms >= 0 {
            (now, planned)
        } else {
            (now, elapsed.min(planned))
        };
        self.finalize(end_time, actual_ms, true, EndReason::Natural)
    }

    fn finalize(
        &mut self,
        end_time: DateTime<Utc>,
        actual_ms: u64,
        completed: bool,
        reason: EndReason,
    ) -> Result<SessionOutcome, EngineError> {
        let state = self.state;
        let session = self
            .session
            .as_mut()
            .ok_or(EngineError::InvalidStateTransition {
                operation: "finish",
                state,
            })?;

        session.finalize(end_time, actual_ms, completed);
        self.scheduler.cancel(&session.id);
        let outcome = self.emitter.emit(session, reason)?;

        self.state = if completed {
            TimerState::Completed
        } else {
            TimerState::Cancelled
        };
        self.outcome = Some(outcome.clone());
        self.persistence.dirty = false;
        info!(
            session_id = %outcome.session_id,
            state = %self.state,
            reason = reason.as_str(),
            "Session finished"
        );

        // Emitted before the snapshot goes, so a crash in between re-derives
        // the outcome and the ledger suppresses the duplicate.
        let now = self.clock.now();
        self.clear_snapshot(&outcome.session_id, now);
        Ok(outcome)
    }

    fn arm(&mut self, now: DateTime<Utc>) {
        let Some(session) = &self.session else {
            return;
        };
        let session_id = session.id.clone();
        let remaining = session
            .planned_duration_ms
            .saturating_sub(self.elapsed_floor_ms.get());
        let fire_at = now + Duration::milliseconds(remaining.min(i64::MAX as u64) as i64);
        let payload = serde_json::to_value(WakePayload {
            session_id: session_id.clone(),
            session_type: session.session_type,
            deadline: fire_at,
        })
        .unwrap_or(serde_json::Value::Null);

        let limited_reason = match self.scheduler.schedule(&session_id, fire_at, payload) {
            Ok(Registration::Armed(handle)) => {
                debug!(session_id = %handle.session_id, fire_at = %handle.fire_at, "Background wake armed");
                self.scheduling_limited = false;
                return;
            }
            Ok(Registration::Limited(warning)) => warning.reason,
            Err(err) => err.to_string(),
        };

        if !self.scheduling_limited {
            warn!(
                session_id = %session_id,
                reason = %limited_reason,
                "Background wake unavailable; completion relies on foreground ticks"
            );
            self.bus.publish(Event::SchedulingLimited {
                session_id,
                reason: limited_reason,
                at: now,
            });
        }
        self.scheduling_limited = true;
    }

    fn maintain_snapshot(&mut self, now: DateTime<Utc>) {
        if self.persistence.dirty {
            if self.persistence.retry_at.map_or(true, |at| now >= at) {
                self.persist(now);
            }
            return;
        }
        if self.state != TimerState::Running {
            return;
        }
        let due = self.persistence.last_saved_at.map_or(true, |at| {
            millis_between(at, now) >= self.config.persist_interval_ms as i64
        });
        if due {
            self.persist(now);
        }
    }

    fn persist(&mut self, now: DateTime<Utc>) {
        let Some(session) = &self.session else {
            return;
        };
        let snapshot = RecoverySnapshot::capture(session, now);
        match self.store.save(&snapshot) {
            Ok(()) => {
                if self.persistence.failures > 0 {
                    info!(
                        session_id = %snapshot.session_id,
                        attempts = self.persistence.failures + 1,
                        "Snapshot write succeeded after retry"
                    );
                }
                self.persistence = PersistenceState {
                    last_saved_at: Some(now),
                    ..PersistenceState::default()
                };
                debug!(session_id = %snapshot.session_id, "Snapshot persisted");
            }
            Err(err) => {
                self.persistence.dirty = true;
                let backoff_ms = self.schedule_retry(now);
                warn!(
                    session_id = %snapshot.session_id,
                    error = %err,
                    attempt = self.persistence.failures,
                    retry_in_ms = backoff_ms,
                    "Snapshot write failed; will retry"
                );
            }
        }
    }

    fn clear_snapshot(&mut self, session_id: &str, now: DateTime<Utc>) {
        match self.store.clear(session_id) {
            Ok(()) => {
                self.persistence = PersistenceState::default();
                debug!(session_id, "Snapshot cleared");
            }
            Err(err) => {
                self.persistence.pending_clear = Some(session_id.to_string());
                let backoff_ms = self.schedule_retry(now);
                warn!(
                    session_id,
                    error = %err,
                    retry_in_ms = backoff_ms,
                    "Failed to clear snapshot; will retry"
                );
            }
        }
    }

    fn retry_clear(&mut self, now: DateTime<Utc>) {
        let Some(session_id) = self.persistence.pending_clear.clone() else {
            return;
        };
        if self.persistence.retry_at.is_some_and(|at| now < at) {
            return;
        }
        self.clear_snapshot(&session_id, now);
    }

    fn schedule_retry(&mut self, now: DateTime<Utc>) -> u64 {
        self.persistence.failures = self.persistence.failures.saturating_add(1);
        let backoff_ms = self.config.retry.backoff_ms(self.persistence.failures);
        self.persistence.retry_at = Some(now + Duration::milliseconds(backoff_ms as i64));
        backoff_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::recovery::MemoryRecoveryStore;
    use crate::scheduler::{ForegroundOnlyScheduler, RegistrationHandle};
    use crate::timer::ManualClock;
    use chrono::TimeZone;
    use std::sync::Mutex;

    const MIN: i64 = 60_000;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct RecordingScheduler {
        armed: Mutex<Vec<(String, DateTime<Utc>)>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl BackgroundScheduler for RecordingScheduler {
        fn schedule(
            &self,
            session_id: &str,
            fire_at: DateTime<Utc>,
            _payload: serde_json::Value,
        ) -> Result<Registration, SchedulerError> {
            self.armed
                .lock()
                .unwrap()
                .push((session_id.to_string(), fire_at));
            Ok(Registration::Armed(RegistrationHandle {
                session_id: session_id.to_string(),
                fire_at,
            }))
        }

        fn cancel(&self, session_id: &str) {
            self.cancelled.lock().unwrap().push(session_id.to_string());
        }
    }

    struct Harness {
        clock: ManualClock,
        store: Arc<MemoryRecoveryStore>,
        scheduler: Arc<RecordingScheduler>,
        bus: EventBus,
        machine: SessionStateMachine,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryRecoveryStore::new()))
    }

    fn harness_with(store: Arc<MemoryRecoveryStore>) -> Harness {
        let clock = ManualClock::new(t0());
        let scheduler = Arc::new(RecordingScheduler::default());
        let bus = EventBus::default();
        let machine = SessionStateMachine::new(
            EngineConfig::default(),
            EngineParts {
                clock: Arc::new(clock.clone()),
                store: store.clone(),
                scheduler: scheduler.clone(),
                bus: bus.clone(),
                ledger: None,
            },
        );
        Harness {
            clock,
            store,
            scheduler,
            bus,
            machine,
        }
    }

    fn focus(minutes: u32) -> StartRequest {
        StartRequest::minutes(SessionType::Focus, minutes)
    }

    #[test]
    fn start_runs_arms_and_persists() {
        let mut h = harness();
        let event = h.machine.start(focus(25).with_task("task-1")).unwrap();
        assert!(matches!(event, Event::SessionStarted { planned_ms, .. } if planned_ms == 25 * MIN as u64));
        assert_eq!(h.machine.state(), TimerState::Running);

        let armed = h.scheduler.armed.lock().unwrap().clone();
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].1, t0() + Duration::minutes(25));

        let snap = h.store.peek().unwrap();
        assert_eq!(snap.task_id.as_deref(), Some("task-1"));
        assert_eq!(snap.last_persisted_at, t0());
    }

    #[test]
    fn start_rejects_zero_duration_and_double_start() {
        let mut h = harness();
        assert_eq!(
            h.machine.start(StartRequest::new(SessionType::Focus, 0)),
            Err(EngineError::InvalidDuration)
        );
        h.machine.start(focus(25)).unwrap();
        assert_eq!(
            h.machine.start(focus(25)),
            Err(EngineError::InvalidStateTransition {
                operation: "start",
                state: TimerState::Running
            })
        );
    }

    #[test]
    fn commands_from_idle_are_rejected() {
        let mut h = harness();
        assert!(h.machine.pause().is_err());
        assert!(h.machine.resume().is_err());
        assert!(h.machine.complete().is_err());
        assert!(h.machine.stop().is_err());
        assert_eq!(h.machine.tick(), TickOutcome::Idle);
    }

    #[test]
    fn pause_resume_shifts_deadline() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        h.clock.advance(Duration::minutes(5));
        h.machine.pause().unwrap();
        assert_eq!(h.machine.state(), TimerState::Paused);
        assert_eq!(h.scheduler.cancelled.lock().unwrap().len(), 1);

        h.clock.advance(Duration::minutes(2));
        assert_eq!(h.machine.elapsed_ms(), 5 * MIN as u64);
        h.machine.resume().unwrap();

        let armed = h.scheduler.armed.lock().unwrap().clone();
        assert_eq!(armed.last().unwrap().1, t0() + Duration::minutes(27));
        assert_eq!(h.machine.session().unwrap().paused_duration_ms, 2 * MIN as u64);
        assert_eq!(h.machine.remaining_ms(), 20 * MIN as u64);
    }

    #[test]
    fn tick_completes_within_tolerance() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        h.clock.advance_ms(25 * MIN - 500);
        match h.machine.tick() {
            TickOutcome::Finished(outcome) => {
                assert_eq!(outcome.end_reason, EndReason::Natural);
                assert_eq!(outcome.actual_ms, (25 * MIN - 500) as u64);
                assert_eq!(outcome.end_time, t0() + Duration::milliseconds(25 * MIN - 500));
                assert_eq!(outcome.actual_minutes, 25);
                assert!(outcome.perfect);
            }
            other => panic!("unexpected tick: {other:?}"),
        }
        assert_eq!(h.machine.state(), TimerState::Completed);
        assert!(h.store.peek().is_none());
    }

    #[test]
    fn late_observation_ends_at_deadline() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        h.clock.advance(Duration::minutes(90));
        let TickOutcome::Finished(outcome) = h.machine.tick() else {
            panic!("expected completion");
        };
        assert_eq!(outcome.end_time, t0() + Duration::minutes(25));
        assert_eq!(outcome.actual_ms, 25 * MIN as u64);
    }

    #[test]
    fn terminal_calls_return_existing_outcome_once() {
        let mut h = harness();
        let mut rx = h.bus.subscribe();
        h.machine.start(focus(25)).unwrap();
        h.clock.advance(Duration::minutes(10));
        let first = h.machine.stop().unwrap();
        let again = h.machine.complete().unwrap();
        let skipped = h.machine.skip().unwrap();
        assert_eq!(first, again);
        assert_eq!(first, skipped);
        assert_eq!(h.machine.pause(), Ok(Transition::Finished(first.clone())));
        assert_eq!(h.machine.tick(), TickOutcome::Finished(first.clone()));

        let finished = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, Event::SessionFinished { .. }))
            .count();
        assert_eq!(finished, 1);
    }

    #[test]
    fn stop_after_unobserved_deadline_is_completion() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        h.clock.advance(Duration::minutes(26));
        let outcome = h.machine.stop().unwrap();
        assert_eq!(outcome.end_reason, EndReason::Natural);
        assert_eq!(h.machine.state(), TimerState::Completed);
    }

    #[test]
    fn complete_caps_actual_at_plan() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        h.clock.advance(Duration::minutes(20));
        let outcome = h.machine.complete().unwrap();
        assert_eq!(outcome.actual_minutes, 20);
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.end_reason, EndReason::Completed);
    }

    #[test]
    fn skip_from_open_pause_has_no_interruptions() {
        let mut h = harness();
        h.machine
            .start(StartRequest::minutes(SessionType::ShortBreak, 5))
            .unwrap();
        h.clock.advance(Duration::minutes(1));
        h.machine.pause().unwrap();
        let outcome = h.machine.skip().unwrap();
        assert_eq!(outcome.end_reason, EndReason::Skipped);
        assert_eq!(outcome.interruption_count, 0);
        assert_eq!(outcome.status, OutcomeStatus::Interrupted);
    }

    #[test]
    fn start_after_finish_begins_fresh_session() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        let first = h.machine.stop().unwrap();
        h.machine
            .start(StartRequest::minutes(SessionType::ShortBreak, 5))
            .unwrap();
        assert_eq!(h.machine.state(), TimerState::Running);
        assert!(h.machine.outcome().is_none());
        assert_ne!(h.machine.session().unwrap().id, first.session_id);
    }

    #[test]
    fn failed_write_is_retried_with_backoff() {
        let mut h = harness();
        h.store.set_fail_writes(true);
        h.machine.start(focus(25)).unwrap();
        assert!(h.machine.has_pending_write());

        h.clock.advance_ms(200);
        h.machine.tick();
        assert!(h.store.peek().is_none());

        h.store.set_fail_writes(false);
        h.machine.tick();
        assert!(h.store.peek().is_none(), "still inside backoff window");

        h.clock.advance_ms(400);
        h.machine.tick();
        assert!(!h.machine.has_pending_write());
        assert_eq!(h.store.peek().unwrap().last_persisted_at, t0() + Duration::milliseconds(600));
    }

    #[test]
    fn periodic_snapshot_follows_interval() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        h.clock.advance_ms(5_000);
        h.machine.tick();
        assert_eq!(h.store.write_count(), 1);
        h.clock.advance_ms(10_000);
        h.machine.tick();
        assert_eq!(h.store.write_count(), 2);
    }

    #[test]
    fn wake_for_other_session_is_ignored() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        h.clock.advance(Duration::minutes(30));
        assert!(h.machine.on_wake("someone-else").is_none());
        assert_eq!(h.machine.state(), TimerState::Running);
    }

    #[test]
    fn early_wake_rearms() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        let id = h.machine.session().unwrap().id.clone();
        h.clock.advance(Duration::minutes(20));
        assert!(h.machine.on_wake(&id).is_none());
        let armed = h.scheduler.armed.lock().unwrap().clone();
        assert_eq!(armed.len(), 2);
        assert_eq!(armed[1].1, t0() + Duration::minutes(25));
    }

    #[test]
    fn wall_clock_step_back_holds_elapsed() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        h.clock.advance(Duration::minutes(10));
        h.machine.tick();
        h.clock.set_wall(t0() + Duration::minutes(4));
        match h.machine.tick() {
            TickOutcome::Progress { elapsed_ms, .. } => assert_eq!(elapsed_ms, 10 * MIN as u64),
            other => panic!("unexpected tick: {other:?}"),
        }
    }

    #[test]
    fn limited_scheduler_warns_once_per_session() {
        let clock = ManualClock::new(t0());
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut machine = SessionStateMachine::new(
            EngineConfig::default(),
            EngineParts {
                clock: Arc::new(clock.clone()),
                store: Arc::new(MemoryRecoveryStore::new()),
                scheduler: Arc::new(ForegroundOnlyScheduler::new("denied")),
                bus,
                ledger: None,
            },
        );
        machine.start(focus(25)).unwrap();
        clock.advance(Duration::minutes(1));
        machine.pause().unwrap();
        machine.resume().unwrap();
        assert!(machine.is_scheduling_limited());

        let limited: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                Event::SchedulingLimited { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(limited, vec!["denied".to_string()]);
    }

    #[test]
    fn adopt_paused_requires_idle() {
        let mut h = harness();
        h.machine.start(focus(25)).unwrap();
        let session = h.machine.session().unwrap().clone();
        assert!(h.machine.adopt(session, TimerState::Paused).is_err());
    }
}
