//! # Focus Engine Core Library
//!
//! The timer session engine of a Pomodoro-style focus application: a
//! deterministic state machine that runs one focus or break session at a
//! time, survives an abrupt process kill, and hands each finished session to
//! downstream consumers exactly once.
//!
//! ## Architecture
//!
//! - **Timer**: wall-clock-based state machine. Elapsed time is always
//!   recomputed from `start_time`, never accumulated per tick
//! - **Recovery**: every transition leaves a snapshot; start-up reconciles it
//!   against the current time
//! - **Scheduler**: background wakes that post into the service mailbox
//! - **Storage**: SQLite snapshot store and outcome ledger, TOML configuration
//!
//! ## Key Components
//!
//! - [`SessionStateMachine`]: transitions, elapsed/remaining, recovery
//! - [`SessionService`]: async serialization point with tick loop and wake mailbox
//! - [`OutcomeEmitter`]: at-most-once [`SessionOutcome`] publication
//! - [`Database`]: durable [`RecoveryStore`] and [`OutcomeLedger`]
//! - [`Config`]: engine configuration

pub mod error;
pub mod events;
pub mod outcome;
pub mod recovery;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod timer;

pub use error::{
    ConfigError, CoreError, DatabaseError, EngineError, PersistenceError, SchedulerError,
};
pub use events::{Event, EventBus, SessionSink};
pub use outcome::{EndReason, OutcomeEmitter, OutcomeLedger, OutcomeStatus, SessionOutcome};
pub use recovery::{
    MemoryRecoveryStore, RecoveryPolicy, RecoveryReport, RecoverySnapshot, RecoveryStore,
    ResumableSession,
};
pub use scheduler::{
    BackgroundScheduler, CapabilityWarning, ForegroundOnlyScheduler, Registration, TokioScheduler,
    WakeRequest,
};
pub use service::{SessionService, SessionServiceBuilder};
pub use storage::{Config, Database, EngineConfig, Stats};
pub use timer::{
    EngineParts, InterruptionTracker, ManualClock, PrecisionMode, SessionClock,
    SessionStateMachine, SessionType, StartRequest, SystemClock, TickOutcome, TimerSession,
    TimerState, Transition,
};
