//! Integration tests for the session lifecycle.
//!
//! Drives the state machine through full sessions with a hand-driven clock
//! and checks the outcome records consumers receive.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{machine, t0, MIN};
use focus_engine_core::{
    EndReason, EngineConfig, Event, ManualClock, MemoryRecoveryStore, OutcomeStatus, SessionType,
    StartRequest, TickOutcome, TimerState, Transition,
};

fn finished_events(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> usize {
    std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|e| matches!(e, Event::SessionFinished { .. }))
        .count()
}

#[test]
fn test_manual_stop_after_one_interruption() {
    let clock = ManualClock::new(t0());
    let (mut engine, _bus) = machine(
        &clock,
        Arc::new(MemoryRecoveryStore::new()),
        None,
        EngineConfig::default(),
    );

    engine
        .start(StartRequest::minutes(SessionType::Focus, 25))
        .unwrap();
    clock.advance(Duration::minutes(5));
    engine.pause().unwrap();
    clock.advance(Duration::minutes(2));
    engine.resume().unwrap();
    clock.advance(Duration::minutes(7));

    let outcome = engine.stop().unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Interrupted);
    assert_eq!(outcome.actual_minutes, 12);
    assert_eq!(outcome.interruption_count, 1);
    assert!(!outcome.perfect);
    assert_eq!(outcome.end_reason, EndReason::Stopped);
    assert_eq!(outcome.end_time, t0() + Duration::minutes(14));
}

#[test]
fn test_perfect_session_completes_naturally() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryRecoveryStore::new());
    let (mut engine, bus) = machine(&clock, store.clone(), None, EngineConfig::default());
    let mut rx = bus.subscribe();

    engine
        .start(StartRequest::minutes(SessionType::Focus, 25).with_task("task-42"))
        .unwrap();
    for _ in 0..25 {
        clock.advance(Duration::minutes(1));
        engine.tick();
    }

    let outcome = engine.outcome().cloned().unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert!(outcome.perfect);
    assert_eq!(outcome.actual_minutes, 25);
    assert_eq!(outcome.task_id.as_deref(), Some("task-42"));
    assert!(store.peek().is_none());
    assert_eq!(finished_events(&mut rx), 1);
}

#[test]
fn test_double_termination_yields_one_outcome() {
    let clock = ManualClock::new(t0());
    let (mut engine, bus) = machine(
        &clock,
        Arc::new(MemoryRecoveryStore::new()),
        None,
        EngineConfig::default(),
    );
    let mut rx = bus.subscribe();

    engine
        .start(StartRequest::minutes(SessionType::Focus, 25))
        .unwrap();
    clock.advance(Duration::minutes(10));
    let first = engine.complete().unwrap();
    clock.advance(Duration::minutes(1));
    let second = engine.complete().unwrap();
    let third = engine.stop().unwrap();

    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(engine.resume().unwrap(), Transition::Finished(first));
    assert_eq!(finished_events(&mut rx), 1);
}

#[test]
fn test_wake_three_seconds_late_still_completes() {
    let clock = ManualClock::new(t0());
    let (mut engine, _bus) = machine(
        &clock,
        Arc::new(MemoryRecoveryStore::new()),
        None,
        EngineConfig::default(),
    );

    engine
        .start(StartRequest::minutes(SessionType::Focus, 25))
        .unwrap();
    let id = engine.session().unwrap().id.clone();
    clock.advance_ms(25 * MIN + 3_000);

    let outcome = engine.on_wake(&id).unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(outcome.end_reason, EndReason::Natural);
    assert_eq!(outcome.end_time, t0() + Duration::minutes(25));
    assert_eq!(engine.on_wake(&id), Some(outcome));
}

#[test]
fn test_wake_just_before_deadline_is_within_tolerance() {
    let clock = ManualClock::new(t0());
    let (mut engine, _bus) = machine(
        &clock,
        Arc::new(MemoryRecoveryStore::new()),
        None,
        EngineConfig::default(),
    );

    engine
        .start(StartRequest::minutes(SessionType::Focus, 25))
        .unwrap();
    let id = engine.session().unwrap().id.clone();
    clock.advance_ms(25 * MIN - 800);

    let outcome = engine.on_wake(&id).unwrap();
    assert!(outcome.perfect);
    assert_eq!(outcome.end_time, t0() + Duration::milliseconds(25 * MIN - 800));
    // Recorded running time never exceeds the wall-clock span.
    assert_eq!(outcome.actual_ms, (25 * MIN - 800) as u64);
    assert_eq!(outcome.actual_minutes, 25);
    assert_eq!(
        engine.session().unwrap().actual_duration_ms,
        Some((25 * MIN - 800) as u64)
    );
}

#[test]
fn test_paused_session_ignores_ticks() {
    let clock = ManualClock::new(t0());
    let (mut engine, _bus) = machine(
        &clock,
        Arc::new(MemoryRecoveryStore::new()),
        None,
        EngineConfig::default(),
    );

    engine
        .start(StartRequest::minutes(SessionType::Focus, 25))
        .unwrap();
    clock.advance(Duration::minutes(3));
    engine.pause().unwrap();
    clock.advance(Duration::hours(2));

    match engine.tick() {
        TickOutcome::Progress {
            state,
            elapsed_ms,
            remaining_ms,
        } => {
            assert_eq!(state, TimerState::Paused);
            assert_eq!(elapsed_ms, 3 * MIN as u64);
            assert_eq!(remaining_ms, 22 * MIN as u64);
        }
        other => panic!("unexpected tick: {other:?}"),
    }
}

#[test]
fn test_metadata_passes_through_to_snapshot() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryRecoveryStore::new());
    let (mut engine, _bus) = machine(&clock, store.clone(), None, EngineConfig::default());

    engine
        .start(
            StartRequest::minutes(SessionType::Custom, 50)
                .with_metadata("category", serde_json::json!({"label": "writing"})),
        )
        .unwrap();

    let snap = store.peek().unwrap();
    assert_eq!(snap.metadata["category"]["label"], "writing");
    assert_eq!(snap.session_type, SessionType::Custom);
}
