//! Async front door to the state machine.
//!
//! `SessionService` is the single serialization point: foreground calls,
//! the tick loop and fired background wakes all take the same
//! `tokio::sync::Mutex`, so the first terminal transition through it wins and
//! every later one sees the finished session.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, EngineError};
use crate::events::{Event, EventBus, SessionSink};
use crate::outcome::{OutcomeLedger, SessionOutcome};
use crate::recovery::{RecoveryReport, RecoveryStore};
use crate::scheduler::{
    wake_mailbox, BackgroundScheduler, ForegroundOnlyScheduler, TokioScheduler, WakeReceiver,
    WakeSender,
};
use crate::storage::EngineConfig;
use crate::timer::{
    EngineParts, SessionClock, SessionStateMachine, StartRequest, SystemClock, TickOutcome,
    TickStrategy, TimerState, Transition,
};

pub struct SessionServiceBuilder {
    config: EngineConfig,
    clock: Arc<dyn SessionClock>,
    store: Arc<dyn RecoveryStore>,
    ledger: Option<Arc<dyn OutcomeLedger>>,
    scheduler: Option<Arc<dyn BackgroundScheduler>>,
    foreground_only: Option<String>,
    bus: EventBus,
    tick_loop: bool,
    wake_tx: WakeSender,
    wake_rx: WakeReceiver,
}

impl SessionServiceBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn SessionClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn OutcomeLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Use a platform scheduler. It should post fired wakes to
    /// [`wake_sender`](Self::wake_sender).
    pub fn scheduler(mut self, scheduler: Arc<dyn BackgroundScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Run without background wakes.
    pub fn foreground_only(mut self, reason: impl Into<String>) -> Self {
        self.foreground_only = Some(reason.into());
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Do not spawn the tick loop; the caller ticks manually.
    pub fn without_tick_loop(mut self) -> Self {
        self.tick_loop = false;
        self
    }

    /// Mailbox that fired wakes are posted to.
    pub fn wake_sender(&self) -> WakeSender {
        self.wake_tx.clone()
    }

    /// Run recovery and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<(SessionService, RecoveryReport), CoreError> {
        let scheduler: Arc<dyn BackgroundScheduler> = match (self.scheduler, self.foreground_only) {
            (Some(scheduler), _) => scheduler,
            (None, Some(reason)) => Arc::new(ForegroundOnlyScheduler::new(reason)),
            (None, None) => match TokioScheduler::new(self.clock.clone(), self.wake_tx.clone()) {
                Ok(scheduler) => Arc::new(scheduler),
                Err(err) => {
                    warn!(error = %err, "Falling back to foreground-only scheduling");
                    Arc::new(ForegroundOnlyScheduler::new(err.to_string()))
                }
            },
        };

        let mut machine = SessionStateMachine::new(
            self.config,
            EngineParts {
                clock: self.clock,
                store: self.store,
                scheduler,
                bus: self.bus.clone(),
                ledger: self.ledger,
            },
        );
        let report = machine.recover()?;

        let inner = Arc::new(Mutex::new(machine));
        let mut tasks = vec![tokio::spawn(run_mailbox(inner.clone(), self.wake_rx))];
        if self.tick_loop {
            tasks.push(tokio::spawn(run_ticks(
                inner.clone(),
                self.config.precision.strategy(),
            )));
        }
        info!(precision = ?self.config.precision, tick_loop = self.tick_loop, "Session service started");

        let service = SessionService {
            inner,
            bus: self.bus,
            wake_tx: self.wake_tx,
            tasks: Arc::new(std::sync::Mutex::new(tasks)),
        };
        Ok((service, report))
    }
}

async fn run_mailbox(machine: Arc<Mutex<SessionStateMachine>>, mut rx: WakeReceiver) {
    while let Some(wake) = rx.recv().await {
        let mut machine = machine.lock().await;
        if let Some(outcome) = machine.on_wake(&wake.session_id) {
            debug!(session_id = %outcome.session_id, "Wake handled");
        }
    }
}

async fn run_ticks(machine: Arc<Mutex<SessionStateMachine>>, strategy: Box<dyn TickStrategy>) {
    loop {
        let interval = {
            let mut machine = machine.lock().await;
            machine.tick();
            strategy.next_interval(machine.state(), machine.remaining_ms())
        };
        tokio::time::sleep(interval).await;
    }
}

/// Handle to a running engine. Clones share the same engine.
#[derive(Clone)]
pub struct SessionService {
    inner: Arc<Mutex<SessionStateMachine>>,
    bus: EventBus,
    wake_tx: WakeSender,
    tasks: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl SessionService {
    /// Builder with a system clock, default config and a tokio scheduler.
    pub fn builder(store: Arc<dyn RecoveryStore>) -> SessionServiceBuilder {
        let (wake_tx, wake_rx) = wake_mailbox();
        SessionServiceBuilder {
            config: EngineConfig::default(),
            clock: SystemClock::shared(),
            store,
            ledger: None,
            scheduler: None,
            foreground_only: None,
            bus: EventBus::default(),
            tick_loop: true,
            wake_tx,
            wake_rx,
        }
    }

    pub async fn start(&self, request: StartRequest) -> Result<Event, EngineError> {
        self.inner.lock().await.start(request)
    }

    pub async fn pause(&self) -> Result<Transition, EngineError> {
        self.inner.lock().await.pause()
    }

    pub async fn resume(&self) -> Result<Transition, EngineError> {
        self.inner.lock().await.resume()
    }

    pub async fn tick(&self) -> TickOutcome {
        self.inner.lock().await.tick()
    }

    pub async fn complete(&self) -> Result<SessionOutcome, EngineError> {
        self.inner.lock().await.complete()
    }

    pub async fn stop(&self) -> Result<SessionOutcome, EngineError> {
        self.inner.lock().await.stop()
    }

    pub async fn skip(&self) -> Result<SessionOutcome, EngineError> {
        self.inner.lock().await.skip()
    }

    pub async fn state(&self) -> TimerState {
        self.inner.lock().await.state()
    }

    /// Current state as a [`Event::StateSnapshot`].
    pub async fn status(&self) -> Event {
        self.inner.lock().await.snapshot_event()
    }

    /// Exclusive access to the state machine.
    pub async fn machine(&self) -> MutexGuard<'_, SessionStateMachine> {
        self.inner.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn attach_sink(&self, sink: Arc<dyn SessionSink>) -> JoinHandle<()> {
        self.bus.attach_sink(sink)
    }

    pub fn wake_sender(&self) -> WakeSender {
        self.wake_tx.clone()
    }

    /// Flush pending snapshot writes and stop the background tasks.
    ///
    /// Returns `false` if a snapshot change could still not be written.
    pub async fn dispose(self) -> bool {
        let clean = self.inner.lock().await.flush();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if !clean {
            warn!("Session service disposed with unwritten snapshot changes");
        }
        info!("Session service stopped");
        clean
    }
}
