//! Per-process engine setup.
//!
//! Every invocation is a short-lived process: it opens the database, runs
//! recovery on whatever the previous invocation left behind, executes one
//! command, and exits.

use std::sync::Arc;

use focus_engine_core::{
    Config, Database, EngineParts, EventBus, ForegroundOnlyScheduler, OutcomeLedger,
    RecoveryPolicy, RecoveryReport, RecoveryStore, SessionStateMachine, SystemClock,
};

pub struct CliEngine {
    pub machine: SessionStateMachine,
    pub config: Config,
    pub db: Arc<Database>,
    pub report: RecoveryReport,
}

impl CliEngine {
    pub fn open() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Config::load()?;
        let db = Arc::new(Database::open_default()?);

        let mut engine_config = config.engine;
        // The process exits between commands; pausing on every relaunch
        // would pause every running session.
        engine_config.recovery_policy = RecoveryPolicy::ContinueRunning;

        let store: Arc<dyn RecoveryStore> = db.clone();
        let ledger: Arc<dyn OutcomeLedger> = db.clone();
        let mut machine = SessionStateMachine::new(
            engine_config,
            EngineParts {
                clock: SystemClock::shared(),
                store,
                scheduler: Arc::new(ForegroundOnlyScheduler::new(
                    "cli process exits between commands",
                )),
                bus: EventBus::default(),
                ledger: Some(ledger),
            },
        );
        let report = machine.recover()?;
        tracing::debug!(?report, "Recovery finished");

        Ok(Self {
            machine,
            config,
            db,
            report,
        })
    }

    /// Push out any snapshot change that failed earlier in this process.
    pub fn close(mut self) {
        if !self.machine.flush() {
            tracing::warn!("Exiting with an unwritten snapshot change");
        }
    }
}
