//! Time sources for the session engine.
//!
//! The engine never reads the platform clock directly. Wall-clock time drives
//! all elapsed/remaining arithmetic (deltas against `start_time`); the
//! monotonic reading is only used to notice when the wall clock steps
//! backwards underneath a running session.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Supplies "now" to the engine.
pub trait SessionClock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds on a clock that never goes backwards.
    fn monotonic_ms(&self) -> u64;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn SessionClock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests and simulations.
///
/// Cloning shares the underlying time, so a test can keep one handle and
/// give another to the engine.
#[derive(Debug, Clone)]
pub struct ManualClock {
    wall_ms: Arc<AtomicI64>,
    mono_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            wall_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
            mono_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move both clocks forward.
    pub fn advance(&self, by: Duration) {
        let ms = by.num_milliseconds();
        self.wall_ms.fetch_add(ms, Ordering::SeqCst);
        if ms > 0 {
            self.mono_ms.fetch_add(ms as u64, Ordering::SeqCst);
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance(Duration::milliseconds(ms));
    }

    /// Jump the wall clock only (user changed system time, NTP step).
    pub fn set_wall(&self, at: DateTime<Utc>) {
        self.wall_ms.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl SessionClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.wall_ms.load(Ordering::SeqCst))
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn monotonic_ms(&self) -> u64 {
        self.mono_ms.load(Ordering::SeqCst)
    }
}

/// Signed milliseconds from `from` to `to`.
pub(crate) fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds()
}
