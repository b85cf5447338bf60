//! Tick cadence strategies.
//!
//! A tick is an observation point, not a time source, so the cadence only
//! affects how promptly natural completion is noticed in the foreground.
//! The strategy is chosen once when the service is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::TimerState;

/// Configured precision mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    /// One tick per second.
    #[default]
    Standard,
    /// Ten ticks per second.
    Fine,
    /// Coarse while far from the deadline, fine close to it.
    Adaptive,
}

impl PrecisionMode {
    pub fn strategy(self) -> Box<dyn TickStrategy> {
        match self {
            PrecisionMode::Standard => Box::new(FixedTick::new(Duration::from_secs(1))),
            PrecisionMode::Fine => Box::new(FixedTick::new(Duration::from_millis(100))),
            PrecisionMode::Adaptive => Box::new(AdaptiveTick::default()),
        }
    }
}

/// Decides how long to wait before the next tick.
pub trait TickStrategy: Send + Sync {
    fn next_interval(&self, state: TimerState, remaining_ms: u64) -> Duration;
}

/// Constant cadence.
#[derive(Debug, Clone, Copy)]
pub struct FixedTick {
    interval: Duration,
}

impl FixedTick {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl TickStrategy for FixedTick {
    fn next_interval(&self, state: TimerState, remaining_ms: u64) -> Duration {
        if state == TimerState::Running && remaining_ms > 0 {
            self.interval.min(Duration::from_millis(remaining_ms))
        } else {
            self.interval
        }
    }
}

/// Cadence that tightens as the deadline approaches.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveTick {
    pub coarse: Duration,
    pub normal: Duration,
    pub fine: Duration,
    /// Remaining time above which the coarse cadence applies.
    pub coarse_above_ms: u64,
    /// Remaining time below which the fine cadence applies.
    pub fine_below_ms: u64,
}

impl Default for AdaptiveTick {
    fn default() -> Self {
        Self {
            coarse: Duration::from_secs(5),
            normal: Duration::from_secs(1),
            fine: Duration::from_millis(100),
            coarse_above_ms: 60_000,
            fine_below_ms: 2_000,
        }
    }
}

impl TickStrategy for AdaptiveTick {
    fn next_interval(&self, state: TimerState, remaining_ms: u64) -> Duration {
        if state != TimerState::Running {
            return self.coarse;
        }
        let interval = if remaining_ms > self.coarse_above_ms {
            self.coarse
        } else if remaining_ms > self.fine_below_ms {
            self.normal
        } else {
            self.fine
        };
        if remaining_ms > 0 {
            interval.min(Duration::from_millis(remaining_ms))
        } else {
            interval
        }
    }
}
