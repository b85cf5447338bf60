use clap::Subcommand;
use focus_engine_core::{SessionType, StartRequest, TickOutcome, Transition};
use serde_json::json;

use super::print_json;
use crate::engine::CliEngine;

#[derive(Subcommand)]
pub enum TimerAction {
    /// Start a new session
    Start {
        /// Session type: focus, short_break, long_break, custom
        #[arg(long = "type", default_value = "focus")]
        session_type: SessionType,
        /// Planned minutes (defaults to the configured duration for the type)
        #[arg(long)]
        minutes: Option<u32>,
        /// Task to attribute the session to
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Pause the running session
    Pause,
    /// Resume the paused session
    Resume,
    /// Mark the session done
    Complete,
    /// Stop the session early
    Stop,
    /// Skip the session
    Skip,
    /// Print current timer state as JSON
    Status,
}

fn print_transition(transition: &Transition) -> Result<(), Box<dyn std::error::Error>> {
    match transition {
        Transition::Applied(event) => print_json(event),
        Transition::Finished(outcome) => print_json(&json!({
            "type": "SessionFinished",
            "outcome": outcome,
        })),
    }
}

pub fn run(action: TimerAction) -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = CliEngine::open()?;
    let machine = &mut engine.machine;

    match action {
        TimerAction::Start {
            session_type,
            minutes,
            task_id,
        } => {
            let minutes = minutes.unwrap_or_else(|| engine.config.durations.minutes_for(session_type));
            let mut request = StartRequest::minutes(session_type, minutes);
            request.task_id = task_id;
            let event = machine.start(request)?;
            print_json(&event)?;
        }
        TimerAction::Pause => print_transition(&machine.pause()?)?,
        TimerAction::Resume => print_transition(&machine.resume()?)?,
        TimerAction::Complete => print_json(&machine.complete()?)?,
        TimerAction::Stop => print_json(&machine.stop()?)?,
        TimerAction::Skip => print_json(&machine.skip()?)?,
        TimerAction::Status => {
            let ticked = machine.tick();
            print_json(&machine.snapshot_event())?;
            if let TickOutcome::Finished(outcome) = ticked {
                tracing::debug!(session_id = %outcome.session_id, "Session finished");
            }
        }
    }

    engine.close();
    Ok(())
}
