//! Scheduling loop: the only code that ever touches the engine.
//!
//! Runs on a dedicated OS thread with its own current-thread runtime. Each
//! iteration handles either one inbound command, a session change or one
//! engine tick, so engine calls are strictly sequential and the engine is
//! polled even when idle.

use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineEvent, EngineFactory};
use crate::error::EngineError;
use crate::protocol::{SessionCommand, SessionFrame, SessionId, TaskCommand};
use crate::task::TaskRegistry;

pub struct SchedulingLoop {
    engine: Box<dyn Engine>,
    registry: TaskRegistry,
    inbound: mpsc::Receiver<SessionCommand>,
    session: watch::Receiver<SessionId>,
    tick_interval: Duration,
}

impl SchedulingLoop {
    pub fn new(
        engine: Box<dyn Engine>,
        inbound: mpsc::Receiver<SessionCommand>,
        session: watch::Receiver<SessionId>,
        outbound: mpsc::Sender<SessionFrame>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            engine,
            registry: TaskRegistry::new(outbound),
            inbound,
            session,
            tick_interval,
        }
    }

    /// Run until every inbound sender is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let initial = *self.session.borrow_and_update();
        self.registry.begin_session(self.engine.as_mut(), initial);

        loop {
            tokio::select! {
                event = self.inbound.recv() => match event {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Ok(()) = self.session.changed() => {
                    let session = *self.session.borrow_and_update();
                    debug!(session, "Coordinator session changed");
                    self.registry.begin_session(self.engine.as_mut(), session);
                }
                _ = ticker.tick() => self.drive().await,
            }
        }

        info!(live_tasks = self.registry.len(), "Scheduling loop stopped");
    }

    async fn handle(&mut self, SessionCommand { session, command }: SessionCommand) {
        if session < self.registry.session() {
            debug!(
                task_id = command.task_id(),
                session,
                "Dropping command from previous session"
            );
            return;
        }
        // The command may arrive before the session change is observed.
        self.registry.begin_session(self.engine.as_mut(), session);

        match command {
            TaskCommand::Submit(task) => {
                let id = task.id;
                if let Err(e) = self.registry.submit(self.engine.as_mut(), task).await {
                    warn!(task_id = id, error = %e, "Task discarded");
                }
            }
            TaskCommand::Stop(id) => {
                info!(task_id = id, "Stop requested");
                self.registry.stop(self.engine.as_mut(), id).await;
            }
        }
    }

    async fn drive(&mut self) {
        for event in self.engine.drive_once() {
            match event {
                EngineEvent::Delta { id, bytes } => self.registry.on_bytes(id, &bytes).await,
                EngineEvent::Finished { id } => {
                    debug!(task_id = id, "Engine finished task");
                    self.registry.finish(id).await;
                }
            }
        }
    }
}

/// Spawn the engine thread: build the engine with `factory` on that thread,
/// then run the scheduling loop on it. Resolves once the engine is
/// initialized; an init failure is returned here.
pub async fn spawn_engine_thread(
    factory: EngineFactory,
    inbound: mpsc::Receiver<SessionCommand>,
    session: watch::Receiver<SessionId>,
    outbound: mpsc::Sender<SessionFrame>,
    tick_interval: Duration,
) -> Result<JoinHandle<()>, EngineError> {
    let (ready_tx, ready_rx) = oneshot::channel();

    let handle = std::thread::Builder::new()
        .name("engine".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(EngineError::Runtime(e)));
                    return;
                }
            };

            let engine = match factory() {
                Ok(engine) => engine,
                Err(e) => {
                    error!(error = %e, "Engine initialization failed");
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let scheduler = SchedulingLoop::new(engine, inbound, session, outbound, tick_interval);
            runtime.block_on(scheduler.run());
        })?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(EngineError::ThreadExited),
    }
}
