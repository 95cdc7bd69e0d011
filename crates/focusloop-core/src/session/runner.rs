//! Async driver that owns a [`Scheduler`] on a tokio task.
//!
//! One `select!` loop turns wall-clock seconds into `tick()` calls and
//! channel messages into scheduler operations, so the state machine has a
//! single timeline. Events are forwarded on an unbounded channel; a dropped
//! receiver only means nobody is rendering.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{Outcome, Plan, Scheduler, SchedulerSnapshot};
use crate::error::{CoreError, StateError};
use crate::events::Event;

type Reply = oneshot::Sender<Result<(), CoreError>>;

/// What the run loop does after a command.
enum Flow {
    Continue,
    /// A new countdown replaced the running one.
    Restart,
    Shutdown,
}

/// Caller request handled on the runner task.
#[derive(Debug)]
pub enum Command {
    Start(Plan, Reply),
    Outcome(Outcome, Reply),
    SwitchTask(String, Reply),
    Cancel(Reply),
    Restore(Box<SchedulerSnapshot>, Reply),
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
    Shutdown,
}

/// Cloneable sender side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| StateError::RunnerStopped)?;
        rx.await.map_err(|_| StateError::RunnerStopped)?
    }

    pub async fn start(&self, plan: Plan) -> Result<(), CoreError> {
        self.request(|r| Command::Start(plan, r)).await
    }

    pub async fn supply_outcome(&self, outcome: Outcome) -> Result<(), CoreError> {
        self.request(|r| Command::Outcome(outcome, r)).await
    }

    pub async fn switch_task(&self, task_id: impl Into<String>) -> Result<(), CoreError> {
        let task_id = task_id.into();
        self.request(|r| Command::SwitchTask(task_id, r)).await
    }

    pub async fn cancel(&self) -> Result<(), CoreError> {
        self.request(Command::Cancel).await
    }

    pub async fn restore(&self, snapshot: SchedulerSnapshot) -> Result<(), CoreError> {
        self.request(|r| Command::Restore(Box::new(snapshot), r)).await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(reply))
            .await
            .map_err(|_| StateError::RunnerStopped)?;
        Ok(rx.await.map_err(|_| StateError::RunnerStopped)?)
    }

    /// Ask the runner to exit. Sampling is stopped; state is kept.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

pub struct SessionRunner {
    scheduler: Scheduler,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    tick_period: Duration,
}

impl SessionRunner {
    /// Spawn the runner with a one-second tick.
    pub fn spawn(
        scheduler: Scheduler,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Event>, JoinHandle<Scheduler>) {
        Self::spawn_with_period(scheduler, Duration::from_secs(1))
    }

    /// Spawn with a custom tick period (tests, demos).
    pub fn spawn_with_period(
        scheduler: Scheduler,
        tick_period: Duration,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Event>, JoinHandle<Scheduler>) {
        let (tx, commands) = mpsc::channel(32);
        let (events, events_rx) = mpsc::unbounded_channel();
        let runner = SessionRunner {
            scheduler,
            commands,
            events,
            tick_period,
        };
        let handle = tokio::spawn(runner.run());
        (SessionHandle { tx }, events_rx, handle)
    }

    async fn run(mut self) -> Scheduler {
        let period = self.tick_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let counting = self.scheduler.state().is_counting();
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    let was_counting = self.scheduler.state().is_counting();
                    let flow = self.handle(cmd);
                    let started = !was_counting && self.scheduler.state().is_counting();
                    match flow {
                        Flow::Shutdown => break,
                        // a fresh countdown gets a full first second
                        Flow::Restart => ticker.reset(),
                        Flow::Continue if started => ticker.reset(),
                        Flow::Continue => {}
                    }
                }
                _ = ticker.tick(), if counting => {
                    let events = self.scheduler.tick();
                    self.emit(events);
                }
            }
        }

        self.scheduler.suspend();
        tracing::debug!(state = ?self.scheduler.state(), "session runner stopped");
        self.scheduler
    }

    fn handle(&mut self, cmd: Command) -> Flow {
        let (result, reply) = match cmd {
            Command::Start(plan, reply) => (self.scheduler.start(plan), reply),
            Command::Outcome(outcome, reply) => (self.scheduler.supply_outcome(outcome), reply),
            Command::SwitchTask(id, reply) => (self.scheduler.switch_task(&id), reply),
            Command::Cancel(reply) => (self.scheduler.cancel(), reply),
            Command::Restore(snapshot, reply) => (self.scheduler.restore(*snapshot), reply),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.scheduler.snapshot());
                return Flow::Continue;
            }
            Command::Shutdown => return Flow::Shutdown,
        };
        match result {
            Ok(events) => {
                let switched = events.iter().any(|e| matches!(e, Event::TaskSwitched { .. }));
                self.emit(events);
                let _ = reply.send(Ok(()));
                if switched {
                    Flow::Restart
                } else {
                    Flow::Continue
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "command rejected");
                let _ = reply.send(Err(e));
                Flow::Continue
            }
        }
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            tracing::trace!(kind = event.kind(), "event");
            let _ = self.events.send(event);
        }
    }
}
