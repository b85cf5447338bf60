use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{BackgroundScheduler, Registration, RegistrationHandle, WakeRequest, WakeSender};
use crate::error::SchedulerError;
use crate::timer::SessionClock;

/// In-process scheduler: one sleeping tokio task per session id.
///
/// Covers an app that is backgrounded but alive. A killed process loses
/// these timers; the recovery snapshot covers that case.
pub struct TokioScheduler {
    runtime: Handle,
    clock: Arc<dyn SessionClock>,
    mailbox: WakeSender,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(clock: Arc<dyn SessionClock>, mailbox: WakeSender) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|e| SchedulerError::Unavailable(e.to_string()))?;
        Ok(Self {
            runtime,
            clock,
            mailbox,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Number of armed registrations.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

impl BackgroundScheduler for TokioScheduler {
    fn schedule(
        &self,
        session_id: &str,
        fire_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<Registration, SchedulerError> {
        let delay = (fire_at - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let mailbox = self.mailbox.clone();
        let id = session_id.to_string();

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if mailbox
                .send(WakeRequest {
                    session_id: id.clone(),
                    payload,
                })
                .is_err()
            {
                debug!(session_id = %id, "Wake mailbox closed; dropping wake");
            }
        });

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| SchedulerError::Unavailable("Failed to lock registrations".into()))?;
        if let Some(previous) = pending.insert(session_id.to_string(), task) {
            previous.abort();
        }
        debug!(session_id, delay_ms = delay.as_millis() as u64, "Wake armed");

        Ok(Registration::Armed(RegistrationHandle {
            session_id: session_id.to_string(),
            fire_at,
        }))
    }

    fn cancel(&self, session_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(task) = pending.remove(session_id) {
                task.abort();
                debug!(session_id, "Wake cancelled");
            }
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            for (_, task) in pending.drain() {
                task.abort();
            }
        }
    }
}
