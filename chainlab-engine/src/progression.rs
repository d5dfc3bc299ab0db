//! Progression state machine for a single lesson run.
//!
//! A [`LessonRun`] is the sole authority over the current frame. User
//! submits, signal ticks and deferred transitions all pass through one serial
//! queue, so a run never observes two interleaved mutations. The logical
//! clock only moves when the host calls [`LessonRun::advance`].
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{ConfigError, EngineConfig};
use crate::event::{Journal, RunEvent, RunEventKind};
use crate::numbers::{percent, scale_ms};
use crate::outcome::{Evaluation, evaluate};
use crate::scenario::{Frame, FrameKind, Mode, Scenario, Target};
use crate::scheduler::{Action, Command, Origin, RunQueue, Scheduler, Ticket};
use crate::signal::{SignalBank, SignalError};

/// Recoverable errors returned by run operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("scenario `{scenario}` has no playable mode `{mode}`")]
    InvalidMode { scenario: String, mode: String },
    #[error("trigger `{trigger}` is not allowed from frame `{frame}`")]
    InvalidTransition { frame: String, trigger: String },
    #[error("action was aimed at frame `{submitted}` but the run is on `{current}`")]
    StaleFrame { submitted: String, current: String },
    #[error("there is no earlier frame to return to")]
    NoHistory,
    #[error("the lesson run is already complete")]
    LessonComplete,
    #[error("frame `{frame}` rejected `{trigger}`: `{field}` {reason}")]
    GuardRejected {
        frame: String,
        trigger: String,
        field: String,
        reason: String,
    },
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What the run stored when a frame was exited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceRecord {
    pub trigger: String,
    #[serde(default)]
    pub payload: Value,
    /// Signal values captured at the instant of the decision.
    #[serde(default)]
    pub signals: BTreeMap<String, i64>,
}

/// Live, mutable record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressionState {
    pub scenario: String,
    pub mode: String,
    pub seed: u64,
    pub current_frame: String,
    pub history: Vec<String>,
    pub user_choices: BTreeMap<String, ChoiceRecord>,
    pub derived_outcome: Option<Evaluation>,
    pub reward_total: u32,
    /// Highest reward already credited per evaluating frame.
    pub credited: BTreeMap<String, u32>,
    pub complete: bool,
}

/// Immutable view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub scenario: String,
    pub mode: String,
    pub current_frame: String,
    pub frame_kind: FrameKind,
    pub frame_title: String,
    /// Triggers the current frame accepts, in sorted order.
    pub triggers: Vec<String>,
    pub history: Vec<String>,
    pub history_depth: usize,
    pub reward_total: u32,
    pub signals: BTreeMap<String, i64>,
    pub outcome: Option<Evaluation>,
    pub complete: bool,
    pub step: usize,
    pub total_steps: usize,
    pub progress_pct: u8,
    pub clock_ms: u64,
}

/// Successful result of an applied command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    Moved { from: String, to: String },
    Completed { reward_total: u32 },
    WentBack { from: String, to: String },
    Ticked { signal: String, value: i64 },
    TimedOut { signal: String, trigger: String },
    /// The command no longer applies (stale deferred transition, inactive or stopped signal).
    Skipped,
}

/// Result of one command drained from the run queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub ticket: Ticket,
    pub at_ms: u64,
    pub result: Result<Effect, EngineError>,
}

/// One in-progress lesson run.
#[derive(Debug, Clone)]
pub struct LessonRun {
    scenario: Arc<Scenario>,
    mode_index: usize,
    config: EngineConfig,
    state: ProgressionState,
    signals: SignalBank,
    scheduler: Scheduler,
    queue: RunQueue,
    journal: Journal,
    visit: u64,
}

impl LessonRun {
    /// Start a run at the mode's entry frame with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidMode`] when the mode does not exist or has no entry frame.
    pub fn start(scenario: Arc<Scenario>, mode: &str) -> Result<Self, EngineError> {
        Self::start_with_config(scenario, mode, &EngineConfig::default())
    }

    /// Start a run with a fixed signal seed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidMode`] when the mode does not exist or has no entry frame.
    pub fn start_with_seed(
        scenario: Arc<Scenario>,
        mode: &str,
        seed: u64,
    ) -> Result<Self, EngineError> {
        Self::start_with_config(scenario, mode, &EngineConfig::default().with_seed(seed))
    }

    /// Start a run with explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for an invalid configuration, [`EngineError::InvalidMode`]
    /// for an unknown mode and [`EngineError::Signal`] when the mode declares a signal twice.
    pub fn start_with_config(
        scenario: Arc<Scenario>,
        mode: &str,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let invalid_mode = || EngineError::InvalidMode {
            scenario: scenario.id.clone(),
            mode: mode.to_string(),
        };
        let mode_index = scenario
            .modes
            .iter()
            .position(|m| m.id == mode)
            .ok_or_else(invalid_mode)?;
        let entry = {
            let mode = &scenario.modes[mode_index];
            mode.frame(&mode.entry).ok_or_else(invalid_mode)?.id.clone()
        };

        let mut signals = SignalBank::new(config.seed);
        let mut scheduler = Scheduler::new();
        for spec in &scenario.modes[mode_index].signals {
            signals.register(spec.clone())?;
            scheduler.schedule_in(
                scale_ms(spec.interval_ms, config.time_scale),
                Command::Tick {
                    signal: spec.name.clone(),
                },
            );
        }

        let state = ProgressionState {
            scenario: scenario.id.clone(),
            mode: mode.to_string(),
            seed: config.seed,
            current_frame: entry,
            history: Vec::new(),
            user_choices: BTreeMap::new(),
            derived_outcome: None,
            reward_total: 0,
            credited: BTreeMap::new(),
            complete: false,
        };
        let mut run = Self {
            scenario,
            mode_index,
            config: *config,
            state,
            signals,
            scheduler,
            queue: RunQueue::default(),
            journal: Journal::default(),
            visit: 0,
        };
        info!(
            "starting lesson `{}` mode `{}` (seed {:#x})",
            run.state.scenario, run.state.mode, run.state.seed
        );
        run.record(RunEventKind::Started {
            scenario: run.state.scenario.clone(),
            mode: run.state.mode.clone(),
            seed: run.state.seed,
        });
        run.enter_current(None, true);
        Ok(run)
    }

    /// Submit a user action for `frame`.
    ///
    /// Commands already waiting in the queue are applied first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LessonComplete`], [`EngineError::StaleFrame`],
    /// [`EngineError::InvalidTransition`] or [`EngineError::GuardRejected`]; the state is
    /// unchanged in every error case.
    pub fn submit(
        &mut self,
        frame: &str,
        trigger: &str,
        payload: Value,
    ) -> Result<Effect, EngineError> {
        self.pump();
        self.apply(Command::Submit(Action::user(frame, trigger, payload)))
    }

    /// Return to the previously visited frame. Signals keep their current values.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LessonComplete`] on a finished run and
    /// [`EngineError::NoHistory`] when there is nowhere to go back to.
    pub fn go_back(&mut self) -> Result<Effect, EngineError> {
        self.pump();
        if self.state.complete {
            return Err(EngineError::LessonComplete);
        }
        let previous = self.state.history.pop().ok_or(EngineError::NoHistory)?;
        let from = std::mem::replace(&mut self.state.current_frame, previous.clone());
        debug!("going back from `{from}` to `{previous}`");
        self.record(RunEventKind::WentBack {
            from: from.clone(),
            to: previous.clone(),
        });
        let before = self.state.history.last().cloned();
        self.enter_current(before.as_deref(), false);
        Ok(Effect::WentBack { from, to: previous })
    }

    /// Post a command to the back of the run queue without applying it.
    pub fn enqueue(&mut self, command: Command) -> Ticket {
        self.queue.push(command)
    }

    /// Apply every queued command in FIFO order.
    pub fn pump(&mut self) -> Vec<Receipt> {
        let mut receipts = Vec::new();
        while let Some((ticket, command)) = self.queue.pop() {
            let result = self.apply(command);
            receipts.push(Receipt {
                ticket,
                at_ms: self.scheduler.now(),
                result,
            });
        }
        receipts
    }

    /// Advance the logical clock by `ms`, firing every scheduled entry that falls due.
    ///
    /// Entries fire in due-time order (ties in scheduling order) and each one is drained
    /// through the run queue before the next is released. At most `max_pump` entries fire per
    /// call; the clock then stays at the last fired entry so the remainder fires on the next call.
    pub fn advance(&mut self, ms: u64) -> Vec<Receipt> {
        let horizon = self.scheduler.now().saturating_add(ms);
        let mut receipts = self.pump();
        let mut fired: u32 = 0;
        while let Some((_, command)) = self.scheduler.pop_due(horizon) {
            self.queue.push(command);
            receipts.extend(self.pump());
            fired = fired.saturating_add(1);
            if fired >= self.config.max_pump {
                warn!(
                    "lesson `{}` fired {fired} scheduled entries in one advance; deferring the rest",
                    self.state.scenario
                );
                return receipts;
            }
        }
        self.scheduler.advance_to(horizon);
        receipts
    }

    /// Logical milliseconds until the next scheduled entry, if any.
    #[must_use]
    pub fn next_due_in(&self) -> Option<u64> {
        self.scheduler
            .next_due()
            .map(|due| due.saturating_sub(self.scheduler.now()))
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mode = self.mode();
        let frame = self.current();
        let total_steps = mode.frames.len();
        let step = mode.position(&self.state.current_frame).unwrap_or(0);
        let progress_pct = if self.state.complete {
            100
        } else {
            percent(step, total_steps)
        };
        Snapshot {
            scenario: self.state.scenario.clone(),
            mode: self.state.mode.clone(),
            current_frame: self.state.current_frame.clone(),
            frame_kind: frame.map_or(FrameKind::Informational, |f| f.kind),
            frame_title: frame.map(|f| f.title.clone()).unwrap_or_default(),
            triggers: frame
                .map(|f| f.transitions.keys().cloned().collect())
                .unwrap_or_default(),
            history: self.state.history.clone(),
            history_depth: self.state.history.len(),
            reward_total: self.state.reward_total,
            signals: self.signals.values(),
            outcome: self.state.derived_outcome.clone(),
            complete: self.state.complete,
            step,
            total_steps,
            progress_pct,
            clock_ms: self.scheduler.now(),
        }
    }

    /// Throw the run away and start over from the entry frame with the same configuration.
    ///
    /// # Errors
    ///
    /// Propagates the start errors, which cannot occur for a scenario that started before.
    pub fn restart(&mut self) -> Result<(), EngineError> {
        let fresh = Self::start_with_config(
            Arc::clone(&self.scenario),
            &self.state.mode,
            &self.config,
        )?;
        self.shutdown();
        *self = fresh;
        Ok(())
    }

    /// End the run, stopping every signal and pending timer, and hand back its journal.
    #[must_use]
    pub fn cancel(mut self) -> Vec<RunEvent> {
        self.shutdown();
        self.journal.into_events()
    }

    #[must_use]
    pub fn events(&self) -> &[RunEvent] {
        self.journal.events()
    }

    #[must_use]
    pub const fn journal(&self) -> &Journal {
        &self.journal
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.state.complete
    }

    #[must_use]
    pub const fn state(&self) -> &ProgressionState {
        &self.state
    }

    #[must_use]
    pub fn into_state(self) -> ProgressionState {
        self.state
    }

    #[must_use]
    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    #[must_use]
    pub fn mode(&self) -> &Mode {
        &self.scenario.modes[self.mode_index]
    }

    /// The frame the run is currently on.
    #[must_use]
    pub fn current(&self) -> Option<&Frame> {
        self.mode().frame(&self.state.current_frame)
    }

    #[must_use]
    pub const fn signals(&self) -> &SignalBank {
        &self.signals
    }

    #[must_use]
    pub const fn now_ms(&self) -> u64 {
        self.scheduler.now()
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn shutdown(&mut self) {
        if !self.signals.is_cancelled() {
            self.signals.cancel_all();
            self.scheduler.clear();
            self.queue.clear();
            self.record(RunEventKind::Cancelled);
        }
    }

    fn record(&mut self, kind: RunEventKind) {
        self.journal.record(self.scheduler.now(), kind);
    }

    fn apply(&mut self, command: Command) -> Result<Effect, EngineError> {
        match command {
            Command::Submit(action) => self.apply_action(action),
            Command::Tick { signal } => Ok(self.apply_tick(&signal)),
            Command::Deferred {
                frame,
                trigger,
                visit,
            } => {
                if self.state.complete || frame != self.state.current_frame || visit != self.visit {
                    debug!("dropping deferred `{trigger}` armed on `{frame}` (visit {visit})");
                    return Ok(Effect::Skipped);
                }
                let payload = self
                    .current()
                    .and_then(|f| f.transitions.get(&trigger))
                    .and_then(|t| t.autofill.clone())
                    .unwrap_or(Value::Null);
                self.apply_action(Action {
                    frame,
                    trigger,
                    payload,
                    origin: Origin::Deferred,
                })
            }
        }
    }

    fn apply_action(&mut self, action: Action) -> Result<Effect, EngineError> {
        let result = self.try_transition(&action);
        if let Err(err) = &result {
            if action.origin == Origin::User {
                debug!("rejected `{}` on `{}`: {err}", action.trigger, action.frame);
            } else {
                warn!(
                    "rejected {:?} trigger `{}` on `{}`: {err}",
                    action.origin, action.trigger, action.frame
                );
            }
            self.record(RunEventKind::Rejected {
                frame: action.frame,
                trigger: action.trigger,
                origin: action.origin,
                reason: err.to_string(),
            });
        }
        result
    }

    fn try_transition(&mut self, action: &Action) -> Result<Effect, EngineError> {
        if self.state.complete {
            return Err(EngineError::LessonComplete);
        }
        if action.frame != self.state.current_frame {
            return Err(EngineError::StaleFrame {
                submitted: action.frame.clone(),
                current: self.state.current_frame.clone(),
            });
        }
        let transition = self
            .current()
            .and_then(|frame| frame.transitions.get(&action.trigger))
            .cloned()
            .ok_or_else(|| EngineError::InvalidTransition {
                frame: action.frame.clone(),
                trigger: action.trigger.clone(),
            })?;
        if let Some(guard) = &transition.guard
            && let Err(failure) = guard.check(&action.payload)
        {
            return Err(EngineError::GuardRejected {
                frame: action.frame.clone(),
                trigger: action.trigger.clone(),
                field: failure.field,
                reason: failure.reason,
            });
        }

        let from = self.state.current_frame.clone();
        self.state.user_choices.insert(
            from.clone(),
            ChoiceRecord {
                trigger: action.trigger.clone(),
                payload: action.payload.clone(),
                signals: self.signals.values(),
            },
        );

        match transition.target {
            Target::Terminal => {
                self.state.complete = true;
                info!(
                    "lesson `{}` complete via `{}` with reward {}",
                    self.state.scenario, action.trigger, self.state.reward_total
                );
                self.record(RunEventKind::Completed {
                    trigger: action.trigger.clone(),
                    reward_total: self.state.reward_total,
                });
                self.signals.cancel_all();
                self.scheduler.clear();
                Ok(Effect::Completed {
                    reward_total: self.state.reward_total,
                })
            }
            Target::Frame(to) => {
                debug!("`{from}` --{}--> `{to}`", action.trigger);
                self.state.history.push(from.clone());
                self.state.current_frame.clone_from(&to);
                self.record(RunEventKind::Transitioned {
                    from: from.clone(),
                    to: to.clone(),
                    trigger: action.trigger.clone(),
                    origin: action.origin,
                });
                self.enter_current(Some(&from), true);
                Ok(Effect::Moved { from, to })
            }
        }
    }

    /// Bookkeeping on arrival at the current frame: evaluate, credit and arm deferred work.
    fn enter_current(&mut self, previous: Option<&str>, credit: bool) {
        self.visit = self.visit.saturating_add(1);
        let frame_id = self.state.current_frame.clone();
        self.record(RunEventKind::Entered {
            frame: frame_id.clone(),
            visit: self.visit,
        });

        let Some(frame) = self.mode().frame(&frame_id).cloned() else {
            return;
        };
        let evaluation = evaluate(self.mode(), &frame, previous, &self.state.user_choices);
        if let Some(eval) = &evaluation {
            self.record(RunEventKind::Evaluated {
                frame: frame_id.clone(),
                outcome: eval.outcome,
                reward: eval.reward,
            });
            if credit {
                self.credit(&frame_id, eval.reward);
            }
        }
        self.state.derived_outcome = evaluation;

        for deferred in &frame.deferred {
            self.scheduler.schedule_in(
                scale_ms(deferred.after_ms, self.config.time_scale),
                Command::Deferred {
                    frame: frame_id.clone(),
                    trigger: deferred.trigger.clone(),
                    visit: self.visit,
                },
            );
        }
    }

    /// Credit only the part of `reward` this frame has not paid out before.
    fn credit(&mut self, frame: &str, reward: u32) {
        let already = self.state.credited.get(frame).copied().unwrap_or(0);
        let amount = reward.saturating_sub(already);
        if amount == 0 {
            return;
        }
        self.state.credited.insert(frame.to_string(), reward);
        self.state.reward_total = self.state.reward_total.saturating_add(amount);
        self.record(RunEventKind::Rewarded {
            frame: frame.to_string(),
            amount,
            total: self.state.reward_total,
        });
    }

    fn apply_tick(&mut self, name: &str) -> Effect {
        if self.state.complete || !self.signals.is_live(name) {
            return Effect::Skipped;
        }
        let Some(spec) = self.mode().signals.iter().find(|s| s.name == name).cloned() else {
            return Effect::Skipped;
        };
        let interval = scale_ms(spec.interval_ms, self.config.time_scale);
        let reschedule = |scheduler: &mut Scheduler| {
            scheduler.schedule_in(
                interval,
                Command::Tick {
                    signal: name.to_string(),
                },
            );
        };

        if !spec.active_on(&self.state.current_frame) {
            reschedule(&mut self.scheduler);
            return Effect::Skipped;
        }
        let Some(outcome) = self.signals.tick(name) else {
            return Effect::Skipped;
        };
        self.record(RunEventKind::Ticked {
            signal: outcome.signal.clone(),
            value: outcome.value,
        });

        if let Some(trigger) = outcome.timeout {
            info!("signal `{name}` expired; submitting `{trigger}`");
            self.record(RunEventKind::TimedOut {
                signal: outcome.signal.clone(),
                trigger: trigger.clone(),
            });
            let frame = self.state.current_frame.clone();
            self.queue
                .push(Command::Submit(Action::timer(frame, trigger.clone())));
            return Effect::TimedOut {
                signal: outcome.signal,
                trigger,
            };
        }
        reschedule(&mut self.scheduler);
        Effect::Ticked {
            signal: outcome.signal,
            value: outcome.value,
        }
    }
}
