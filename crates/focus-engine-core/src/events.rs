use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::outcome::SessionOutcome;
use crate::timer::{SessionType, TimerState};

const DEFAULT_CAPACITY: usize = 64;

/// Every state change of the engine produces an Event.
/// Audio, notification and analytics collaborators subscribe to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SessionStarted {
        session_id: String,
        session_type: SessionType,
        planned_ms: u64,
        task_id: Option<String>,
        at: DateTime<Utc>,
    },
    SessionPaused {
        session_id: String,
        remaining_ms: u64,
        interruption_count: u32,
        at: DateTime<Utc>,
    },
    SessionResumed {
        session_id: String,
        remaining_ms: u64,
        at: DateTime<Utc>,
    },
    /// Terminal transition; published exactly once per session.
    SessionFinished { outcome: SessionOutcome },
    /// The platform refused a background wake; completion is foreground-only.
    SchedulingLimited {
        session_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Recovery found an in-flight session the caller may resume.
    RecoveryAvailable {
        session_id: String,
        session_type: SessionType,
        remaining_ms: u64,
        at: DateTime<Utc>,
    },
    StateSnapshot {
        state: TimerState,
        session_id: Option<String>,
        session_type: Option<SessionType>,
        task_id: Option<String>,
        planned_ms: u64,
        elapsed_ms: u64,
        remaining_ms: u64,
        interruption_count: u32,
        scheduling_limited: bool,
        at: DateTime<Utc>,
    },
}

/// Broadcast channel the engine publishes to.
///
/// Publishing never blocks and never fails; with no subscribers the event is
/// dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Forward events to a sink on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach_sink(&self, sink: Arc<dyn SessionSink>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => dispatch(sink.as_ref(), &event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session sink lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Fire-and-forget side-effect signals (audio cues, notifications).
///
/// All methods default to no-ops so a sink implements only what it needs.
pub trait SessionSink: Send + Sync {
    fn on_session_start(&self, _session_type: SessionType) {}
    fn on_session_pause(&self) {}
    fn on_session_resume(&self) {}
    fn on_session_complete(&self, _outcome: &SessionOutcome) {}
}

/// Route one event to the matching sink method.
pub fn dispatch(sink: &dyn SessionSink, event: &Event) {
    match event {
        Event::SessionStarted { session_type, .. } => sink.on_session_start(*session_type),
        Event::SessionPaused { .. } => sink.on_session_pause(),
        Event::SessionResumed { .. } => sink.on_session_resume(),
        Event::SessionFinished { outcome } => sink.on_session_complete(outcome),
        _ => {}
    }
}
