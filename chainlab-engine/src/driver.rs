//! Async driver that owns one lesson run on a tokio task.
//!
//! The task is the run's only mutator: commands arrive over an mpsc channel,
//! logical time follows the tokio clock, and every change is published on a
//! watch channel so presentation code can render without polling.
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};

use crate::event::RunEvent;
use crate::progression::{Effect, EngineError, LessonRun, Snapshot};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("the lesson driver has stopped")]
    Closed,
}

enum DriverCommand {
    Submit {
        frame: String,
        trigger: String,
        payload: Value,
        reply: oneshot::Sender<Result<Effect, EngineError>>,
    },
    GoBack {
        reply: oneshot::Sender<Result<Effect, EngineError>>,
    },
    Shutdown,
}

/// Handle to a run owned by a driver task.
#[derive(Debug)]
pub struct RunHandle {
    commands: mpsc::Sender<DriverCommand>,
    snapshots: watch::Receiver<Snapshot>,
    task: JoinHandle<Vec<RunEvent>>,
}

/// Move `run` onto a new task. Must be called from within a tokio runtime.
#[must_use]
pub fn spawn(run: LessonRun) -> RunHandle {
    let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
    let (publisher, snapshots) = watch::channel(run.snapshot());
    let clock = WallClock::new(&run);
    let task = tokio::spawn(drive(run, clock, receiver, publisher));
    RunHandle {
        commands,
        snapshots,
        task,
    }
}

impl RunHandle {
    /// # Errors
    ///
    /// Returns the engine's rejection, or [`DriverError::Closed`] if the task is gone.
    pub async fn submit(
        &self,
        frame: impl Into<String>,
        trigger: impl Into<String>,
        payload: Value,
    ) -> Result<Effect, DriverError> {
        let (reply, response) = oneshot::channel();
        self.send(DriverCommand::Submit {
            frame: frame.into(),
            trigger: trigger.into(),
            payload,
            reply,
        })
        .await?;
        Ok(response.await.map_err(|_| DriverError::Closed)??)
    }

    /// # Errors
    ///
    /// Returns the engine's rejection, or [`DriverError::Closed`] if the task is gone.
    pub async fn go_back(&self) -> Result<Effect, DriverError> {
        let (reply, response) = oneshot::channel();
        self.send(DriverCommand::GoBack { reply }).await?;
        Ok(response.await.map_err(|_| DriverError::Closed)??)
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified after every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Stop the run and return its journal.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Closed`] if the task ended abnormally.
    pub async fn shutdown(self) -> Result<Vec<RunEvent>, DriverError> {
        // A closed channel means the task already exited; joining still yields its journal.
        let _ = self.commands.send(DriverCommand::Shutdown).await;
        self.task.await.map_err(|_| DriverError::Closed)
    }

    async fn send(&self, command: DriverCommand) -> Result<(), DriverError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DriverError::Closed)
    }
}

/// Maps the run's logical clock onto tokio time: logical `base_ms` happened at `origin`.
struct WallClock {
    origin: Instant,
    base_ms: u64,
}

impl WallClock {
    fn new(run: &LessonRun) -> Self {
        Self {
            origin: Instant::now(),
            base_ms: run.now_ms(),
        }
    }

    /// Wall instant at which the next scheduled entry falls due. Entries left over from a
    /// bounded advance map to an instant already passed.
    fn deadline(&self, run: &LessonRun) -> Option<Instant> {
        let due = run.now_ms().saturating_add(run.next_due_in()?);
        self.origin
            .checked_add(Duration::from_millis(due.saturating_sub(self.base_ms)))
    }

    /// Advance the run to the logical time matching now. Always advances, even by zero, so
    /// entries due at the current instant are drained.
    fn catch_up(&self, run: &mut LessonRun) {
        let wall = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        let target = self.base_ms.saturating_add(wall);
        run.advance(target.saturating_sub(run.now_ms()));
    }
}

async fn drive(
    mut run: LessonRun,
    clock: WallClock,
    mut commands: mpsc::Receiver<DriverCommand>,
    publisher: watch::Sender<Snapshot>,
) -> Vec<RunEvent> {
    loop {
        let deadline = clock.deadline(&run);
        tokio::select! {
            command = commands.recv() => {
                clock.catch_up(&mut run);
                match command {
                    Some(DriverCommand::Submit { frame, trigger, payload, reply }) => {
                        let _ = reply.send(run.submit(&frame, &trigger, payload));
                    }
                    Some(DriverCommand::GoBack { reply }) => {
                        let _ = reply.send(run.go_back());
                    }
                    Some(DriverCommand::Shutdown) | None => break,
                }
            }
            () = sleep_until(deadline.unwrap_or(clock.origin)), if deadline.is_some() => {
                clock.catch_up(&mut run);
            }
        }
        publisher.send_replace(run.snapshot());
    }
    run.cancel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::scenario::{Frame, FrameKind, Mode, Scenario, TERMINAL, Transition};
    use crate::signal::SignalSpec;
    use std::sync::Arc;

    fn timed() -> Arc<Scenario> {
        let mode = Mode::new(
            "standard",
            "builder",
            vec![
                Frame::new("builder", FrameKind::InputForm)
                    .with_transition("send", Transition::to("pending"))
                    .with_transition("expired", Transition::to("missed")),
                Frame::new("pending", FrameKind::TimedWait)
                    .with_transition("confirm", Transition::to("done"))
                    .with_deferred("confirm", 3_000),
                Frame::new("done", FrameKind::Reward)
                    .with_reward(75)
                    .with_transition("finish", Transition::to(TERMINAL)),
                Frame::new("missed", FrameKind::Informational),
            ],
        )
        .with_signal(SignalSpec::countdown("countdownSeconds", 10, "expired").scoped_to(["builder"]));
        Arc::new(Scenario {
            id: "timed".into(),
            title: "Timed".into(),
            version: 1,
            summary: String::new(),
            modes: vec![mode],
        })
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_expires_on_the_tokio_clock() {
        let started = Instant::now();
        let handle = spawn(LessonRun::start(timed(), "standard").unwrap());
        let mut updates = handle.subscribe();
        updates
            .wait_for(|snap| snap.current_frame == "missed")
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(handle.snapshot().signals["countdownSeconds"], 0);

        let err = handle.submit("builder", "send", Value::Null).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Engine(EngineError::StaleFrame { .. })
        ));
        let journal = handle.shutdown().await.unwrap();
        assert!(!journal.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_transition_fires_after_wall_delay() {
        let handle = spawn(LessonRun::start(timed(), "standard").unwrap());
        handle.submit("builder", "send", Value::Null).await.unwrap();
        assert_eq!(handle.snapshot().current_frame, "pending");

        let mut updates = handle.subscribe();
        let snap = updates
            .wait_for(|snap| snap.current_frame == "done")
            .await
            .unwrap()
            .clone();
        assert_eq!(snap.reward_total, 75);

        handle.go_back().await.unwrap();
        handle.submit("pending", "confirm", Value::Null).await.unwrap();
        let effect = handle.submit("done", "finish", Value::Null).await.unwrap();
        assert_eq!(effect, Effect::Completed { reward_total: 75 });
        assert!(handle.snapshot().complete);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_deferred_transition_fires_immediately() {
        let mode = Mode::new(
            "standard",
            "a",
            vec![
                Frame::new("a", FrameKind::TimedWait)
                    .with_transition("go", Transition::to("b"))
                    .with_deferred("go", 0),
                Frame::new("b", FrameKind::Informational)
                    .with_transition("finish", Transition::to(TERMINAL)),
            ],
        );
        let scenario = Arc::new(Scenario {
            id: "instant".into(),
            title: "Instant".into(),
            version: 1,
            summary: String::new(),
            modes: vec![mode],
        });
        let started = Instant::now();
        let handle = spawn(LessonRun::start(scenario, "standard").unwrap());
        let mut updates = handle.subscribe();
        updates
            .wait_for(|snap| snap.current_frame == "b")
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_beyond_max_pump_drains_without_extra_wall_time() {
        let config = EngineConfig {
            max_pump: 1,
            ..EngineConfig::default()
        };
        let started = Instant::now();
        let run = LessonRun::start_with_config(timed(), "standard", &config).unwrap();
        let handle = spawn(run);
        tokio::time::advance(Duration::from_secs(10)).await;
        let mut updates = handle.subscribe();
        updates
            .wait_for(|snap| snap.current_frame == "missed")
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(11));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_and_returns_the_journal() {
        let handle = spawn(LessonRun::start(timed(), "standard").unwrap());
        handle.submit("builder", "send", Value::Null).await.unwrap();
        let journal = handle.shutdown().await.unwrap();
        assert!(matches!(
            journal.last().map(|event| &event.kind),
            Some(crate::event::RunEventKind::Cancelled)
        ));
    }
}
