//! Background wake scheduling.
//!
//! A scheduler arms a platform-level wake so a session's natural completion
//! is noticed while the process is suspended. When the wake fires it never
//! touches session state: it posts a [`WakeRequest`] to the service mailbox,
//! which funnels it through the same lock as every foreground call.

mod tokio_scheduler;

pub use tokio_scheduler::TokioScheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SchedulerError;
use crate::timer::SessionType;

/// Sending half of the service wake mailbox.
pub type WakeSender = mpsc::UnboundedSender<WakeRequest>;
/// Receiving half of the service wake mailbox.
pub type WakeReceiver = mpsc::UnboundedReceiver<WakeRequest>;

pub fn wake_mailbox() -> (WakeSender, WakeReceiver) {
    mpsc::unbounded_channel()
}

/// Completion request posted by a fired wake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeRequest {
    pub session_id: String,
    pub payload: serde_json::Value,
}

/// Payload the engine attaches to every registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakePayload {
    pub session_id: String,
    pub session_type: SessionType,
    pub deadline: DateTime<Utc>,
}

/// Proof that a wake was armed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationHandle {
    pub session_id: String,
    pub fire_at: DateTime<Utc>,
}

/// The platform declined to arm a wake. Non-fatal: the session continues
/// on foreground ticks and recovery still works at next launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityWarning {
    pub session_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Armed(RegistrationHandle),
    Limited(CapabilityWarning),
}

pub trait BackgroundScheduler: Send + Sync {
    /// Arm a wake for `session_id` at `fire_at`. Replaces any prior
    /// registration for the same id.
    fn schedule(
        &self,
        session_id: &str,
        fire_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<Registration, SchedulerError>;

    /// Drop the registration for `session_id`; no-op if none.
    fn cancel(&self, session_id: &str);
}

/// Scheduler for platforms without background wake permission.
#[derive(Debug, Clone)]
pub struct ForegroundOnlyScheduler {
    reason: String,
}

impl ForegroundOnlyScheduler {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for ForegroundOnlyScheduler {
    fn default() -> Self {
        Self::new("background wake not permitted on this platform")
    }
}

impl BackgroundScheduler for ForegroundOnlyScheduler {
    fn schedule(
        &self,
        session_id: &str,
        _fire_at: DateTime<Utc>,
        _payload: serde_json::Value,
    ) -> Result<Registration, SchedulerError> {
        Ok(Registration::Limited(CapabilityWarning {
            session_id: session_id.to_string(),
            reason: self.reason.clone(),
        }))
    }

    fn cancel(&self, _session_id: &str) {}
}
