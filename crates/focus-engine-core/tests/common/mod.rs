//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use focus_engine_core::{
    EngineConfig, EngineParts, EventBus, ForegroundOnlyScheduler, ManualClock, OutcomeLedger,
    RecoveryStore, SessionStateMachine,
};

pub const MIN: i64 = 60_000;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub fn machine(
    clock: &ManualClock,
    store: Arc<dyn RecoveryStore>,
    ledger: Option<Arc<dyn OutcomeLedger>>,
    config: EngineConfig,
) -> (SessionStateMachine, EventBus) {
    let bus = EventBus::default();
    let machine = SessionStateMachine::new(
        config,
        EngineParts {
            clock: Arc::new(clock.clone()),
            store,
            scheduler: Arc::new(ForegroundOnlyScheduler::new("integration test")),
            bus: bus.clone(),
            ledger,
        },
    );
    (machine, bus)
}
