//! Session timing: clock, interruption accounting, and the state machine.

pub(crate) mod clock;
mod engine;
mod interruption;
mod precision;
mod session;

pub use clock::{ManualClock, SessionClock, SystemClock};
pub use engine::{EngineParts, SessionStateMachine, StartRequest, TickOutcome, Transition};
pub use interruption::InterruptionTracker;
pub use precision::{AdaptiveTick, FixedTick, PrecisionMode, TickStrategy};
pub use session::{SessionType, TimerSession, TimerState};
