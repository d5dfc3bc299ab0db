//! Declarative lesson schema: scenarios, modes, frames and their transitions.
//!
//! Scenario content is static data. A frame never mutates after load; only the
//! run's current-frame pointer moves. [`Scenario::from_json`] parses and
//! validates in one step so every scenario handed to the engine satisfies the
//! structural invariants checked by [`Scenario::validate`].
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

use crate::guard::Guard;
use crate::outcome::OutcomeRule;
use crate::signal::{SignalSpec, StepFn};

/// Reserved transition target that completes the lesson run.
pub const TERMINAL: &str = "terminal";

/// Inline tag storage for frames and journal events.
pub type TagSet = SmallVec<[String; 4]>;

/// Presentation category of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Informational,
    Choice,
    InputForm,
    TimedWait,
    Outcome,
    Reward,
}

impl FrameKind {
    /// Whether entering a frame of this kind runs the outcome evaluator.
    #[must_use]
    pub const fn evaluates(self) -> bool {
        matches!(self, Self::Outcome | Self::Reward)
    }
}

/// Where a transition leads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    Frame(String),
    Terminal,
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        if value == TERMINAL {
            Self::Terminal
        } else {
            Self::Frame(value)
        }
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        match value {
            Target::Frame(name) => name,
            Target::Terminal => TERMINAL.to_string(),
        }
    }
}

/// A declared transition out of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TransitionRepr")]
pub struct Transition {
    pub target: Target,
    /// Payload validation applied before the transition is taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    /// Example payload that satisfies the guard, used for demos and automated playthroughs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autofill: Option<Value>,
}

impl Transition {
    #[must_use]
    pub fn to(target: impl Into<Target>) -> Self {
        Self {
            target: target.into(),
            guard: None,
            autofill: None,
        }
    }

    #[must_use]
    pub fn guarded(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TransitionRepr {
    Bare(Target),
    Full {
        target: Target,
        #[serde(default)]
        guard: Option<Guard>,
        #[serde(default)]
        autofill: Option<Value>,
    },
}

impl From<TransitionRepr> for Transition {
    fn from(value: TransitionRepr) -> Self {
        match value {
            TransitionRepr::Bare(target) => Self::to(target),
            TransitionRepr::Full {
                target,
                guard,
                autofill,
            } => Self {
                target,
                guard,
                autofill,
            },
        }
    }
}

/// One answer of a comprehension check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerOption {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub correct: bool,
}

/// Automatic transition fired a fixed logical delay after the frame is entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredTransition {
    pub trigger: String,
    pub after_ms: u64,
}

/// One step of a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    pub kind: FrameKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub transitions: BTreeMap<String, Transition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<AnswerOption>,
    #[serde(default)]
    pub reward: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluate: Option<OutcomeRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deferred: Vec<DeferredTransition>,
    #[serde(default)]
    pub tags: TagSet,
    /// Presentation payload; opaque to the engine.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
}

impl Frame {
    /// Minimal frame with no transitions, used by builders and tests.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: FrameKind) -> Self {
        Self {
            id: id.into(),
            kind,
            title: String::new(),
            transitions: BTreeMap::new(),
            options: Vec::new(),
            reward: 0,
            evaluate: None,
            deferred: Vec::new(),
            tags: TagSet::new(),
            content: Value::Null,
        }
    }

    #[must_use]
    pub fn with_transition(mut self, trigger: impl Into<String>, transition: Transition) -> Self {
        self.transitions.insert(trigger.into(), transition);
        self
    }

    #[must_use]
    pub fn with_option(mut self, id: impl Into<String>, correct: bool) -> Self {
        let id = id.into();
        self.options.push(AnswerOption {
            label: id.clone(),
            id,
            correct,
        });
        self
    }

    #[must_use]
    pub const fn with_reward(mut self, reward: u32) -> Self {
        self.reward = reward;
        self
    }

    #[must_use]
    pub fn with_rule(mut self, rule: OutcomeRule) -> Self {
        self.evaluate = Some(rule);
        self
    }

    #[must_use]
    pub fn with_deferred(mut self, trigger: impl Into<String>, after_ms: u64) -> Self {
        self.deferred.push(DeferredTransition {
            trigger: trigger.into(),
            after_ms,
        });
        self
    }

    /// The answer option marked correct, if this frame is a quiz.
    #[must_use]
    pub fn correct_option(&self) -> Option<&AnswerOption> {
        self.options.iter().find(|option| option.correct)
    }

    /// Rule the evaluator applies on entry, falling back to the kind's default.
    #[must_use]
    pub fn effective_rule(&self) -> Option<OutcomeRule> {
        if let Some(rule) = &self.evaluate {
            return Some(rule.clone());
        }
        match self.kind {
            FrameKind::Outcome => Some(OutcomeRule::Quiz { source: None }),
            FrameKind::Reward => Some(OutcomeRule::Fixed {
                outcome: crate::outcome::Outcome::Success,
            }),
            _ => None,
        }
    }
}

/// A difficulty track of a lesson with its own frame sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mode {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub entry: String,
    pub frames: Vec<Frame>,
    #[serde(default)]
    pub signals: Vec<SignalSpec>,
}

impl Mode {
    #[must_use]
    pub fn new(id: impl Into<String>, entry: impl Into<String>, frames: Vec<Frame>) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            entry: entry.into(),
            frames,
            signals: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_signal(mut self, spec: SignalSpec) -> Self {
        self.signals.push(spec);
        self
    }

    #[must_use]
    pub fn frame(&self, id: &str) -> Option<&Frame> {
        self.frames.iter().find(|frame| frame.id == id)
    }

    /// One-based position of a frame in declaration order.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.frames
            .iter()
            .position(|frame| frame.id == id)
            .map(|index| index + 1)
    }

    /// Frames reachable from the entry frame through declared transitions.
    #[must_use]
    pub fn reachable(&self) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([self.entry.clone()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(frame) = self.frame(&id) else {
                continue;
            };
            for transition in frame.transitions.values() {
                if let Target::Frame(next) = &transition.target
                    && !seen.contains(next)
                {
                    queue.push_back(next.clone());
                }
            }
        }
        seen
    }
}

/// Full declarative definition of a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub title: String,
    #[serde(default = "Scenario::default_version")]
    pub version: u32,
    #[serde(default)]
    pub summary: String,
    pub modes: Vec<Mode>,
}

/// Structural problems detected while loading scenario data.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario data is malformed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("scenario `{scenario}` declares no modes")]
    NoModes { scenario: String },
    #[error("scenario `{scenario}` declares mode `{mode}` more than once")]
    DuplicateMode { scenario: String, mode: String },
    #[error("mode `{mode}` declares frame `{frame}` more than once")]
    DuplicateFrame { mode: String, frame: String },
    #[error("mode `{mode}` enters at unknown frame `{frame}`")]
    UnknownEntry { mode: String, frame: String },
    #[error("frame `{frame}` in mode `{mode}` routes `{trigger}` to unknown frame `{target}`")]
    UnknownTarget {
        mode: String,
        frame: String,
        trigger: String,
        target: String,
    },
    #[error("frame `{frame}` in mode `{mode}` defers undeclared trigger `{trigger}`")]
    UnknownDeferredTrigger {
        mode: String,
        frame: String,
        trigger: String,
    },
    #[error("frame `{frame}` in mode `{mode}` evaluates against unknown frame `{source_frame}`")]
    UnknownSource {
        mode: String,
        frame: String,
        source_frame: String,
    },
    #[error("quiz frame `{frame}` in mode `{mode}` marks {count} options correct (expected exactly one)")]
    QuizCorrectness {
        mode: String,
        frame: String,
        count: usize,
    },
    #[error("quiz outcome `{frame}` in mode `{mode}` judges `{source_frame}`, which offers no options")]
    QuizWithoutOptions {
        mode: String,
        frame: String,
        source_frame: String,
    },
    #[error("frame `{frame}` in mode `{mode}` has an invalid guard on `{trigger}`: {reason}")]
    InvalidGuard {
        mode: String,
        frame: String,
        trigger: String,
        reason: String,
    },
    #[error("mode `{mode}` declares signal `{signal}` more than once")]
    DuplicateSignal { mode: String, signal: String },
    #[error("signal `{signal}` in mode `{mode}` is invalid: {reason}")]
    InvalidSignal {
        mode: String,
        signal: String,
        reason: String,
    },
    #[error("frame `{frame}` in mode `{mode}` is unreachable from entry `{entry}`")]
    Orphan {
        mode: String,
        frame: String,
        entry: String,
    },
}

impl Scenario {
    const fn default_version() -> u32 {
        1
    }

    /// Parse scenario JSON and validate its structure.
    ///
    /// # Errors
    ///
    /// Returns a [`ScenarioError`] when the JSON is malformed or violates a structural invariant.
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        let scenario: Self = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    #[must_use]
    pub fn mode(&self, id: &str) -> Option<&Mode> {
        self.modes.iter().find(|mode| mode.id == id)
    }

    #[must_use]
    pub fn mode_ids(&self) -> Vec<&str> {
        self.modes.iter().map(|mode| mode.id.as_str()).collect()
    }

    /// Check every structural invariant of the scenario.
    ///
    /// # Errors
    ///
    /// Returns the first [`ScenarioError`] encountered.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.modes.is_empty() {
            return Err(ScenarioError::NoModes {
                scenario: self.id.clone(),
            });
        }
        let mut mode_ids = BTreeSet::new();
        for mode in &self.modes {
            if !mode_ids.insert(mode.id.as_str()) {
                return Err(ScenarioError::DuplicateMode {
                    scenario: self.id.clone(),
                    mode: mode.id.clone(),
                });
            }
            validate_mode(mode)?;
        }
        Ok(())
    }
}

fn validate_mode(mode: &Mode) -> Result<(), ScenarioError> {
    let mut frame_ids = BTreeSet::new();
    for frame in &mode.frames {
        if !frame_ids.insert(frame.id.as_str()) {
            return Err(ScenarioError::DuplicateFrame {
                mode: mode.id.clone(),
                frame: frame.id.clone(),
            });
        }
    }
    if !frame_ids.contains(mode.entry.as_str()) {
        return Err(ScenarioError::UnknownEntry {
            mode: mode.id.clone(),
            frame: mode.entry.clone(),
        });
    }

    for frame in &mode.frames {
        validate_frame(mode, frame, &frame_ids)?;
    }
    validate_signals(mode, &frame_ids)?;

    let reachable = mode.reachable();
    if let Some(orphan) = mode.frames.iter().find(|f| !reachable.contains(&f.id)) {
        return Err(ScenarioError::Orphan {
            mode: mode.id.clone(),
            frame: orphan.id.clone(),
            entry: mode.entry.clone(),
        });
    }
    Ok(())
}

fn validate_frame(
    mode: &Mode,
    frame: &Frame,
    frame_ids: &BTreeSet<&str>,
) -> Result<(), ScenarioError> {
    for (trigger, transition) in &frame.transitions {
        if let Target::Frame(target) = &transition.target
            && !frame_ids.contains(target.as_str())
        {
            return Err(ScenarioError::UnknownTarget {
                mode: mode.id.clone(),
                frame: frame.id.clone(),
                trigger: trigger.clone(),
                target: target.clone(),
            });
        }
        if let Some(guard) = &transition.guard
            && let Err(reason) = guard.validate()
        {
            return Err(ScenarioError::InvalidGuard {
                mode: mode.id.clone(),
                frame: frame.id.clone(),
                trigger: trigger.clone(),
                reason,
            });
        }
    }

    if let Some(deferred) = frame
        .deferred
        .iter()
        .find(|d| !frame.transitions.contains_key(&d.trigger))
    {
        return Err(ScenarioError::UnknownDeferredTrigger {
            mode: mode.id.clone(),
            frame: frame.id.clone(),
            trigger: deferred.trigger.clone(),
        });
    }

    if !frame.options.is_empty() {
        let count = frame.options.iter().filter(|o| o.correct).count();
        if count != 1 {
            return Err(ScenarioError::QuizCorrectness {
                mode: mode.id.clone(),
                frame: frame.id.clone(),
                count,
            });
        }
    }

    if let Some(source) = frame.evaluate.as_ref().and_then(OutcomeRule::source)
        && !frame_ids.contains(source)
    {
        return Err(ScenarioError::UnknownSource {
            mode: mode.id.clone(),
            frame: frame.id.clone(),
            source_frame: source.to_string(),
        });
    }

    if let Some(OutcomeRule::Quiz { source }) = frame.effective_rule() {
        // Without an explicit source the quiz judges whichever frame led here.
        let judged: Vec<&str> = match &source {
            Some(source) => vec![source.as_str()],
            None if frame.id == mode.entry => vec![frame.id.as_str()],
            None => mode
                .frames
                .iter()
                .filter(|f| {
                    f.transitions
                        .values()
                        .any(|t| matches!(&t.target, Target::Frame(next) if *next == frame.id))
                })
                .map(|f| f.id.as_str())
                .collect(),
        };
        if let Some(bare) = judged
            .into_iter()
            .find(|id| mode.frame(id).is_none_or(|f| f.options.is_empty()))
        {
            return Err(ScenarioError::QuizWithoutOptions {
                mode: mode.id.clone(),
                frame: frame.id.clone(),
                source_frame: bare.to_string(),
            });
        }
    }
    Ok(())
}

fn validate_signals(mode: &Mode, frame_ids: &BTreeSet<&str>) -> Result<(), ScenarioError> {
    let mut names = BTreeSet::new();
    for spec in &mode.signals {
        if !names.insert(spec.name.as_str()) {
            return Err(ScenarioError::DuplicateSignal {
                mode: mode.id.clone(),
                signal: spec.name.clone(),
            });
        }
        let invalid = |reason: String| ScenarioError::InvalidSignal {
            mode: mode.id.clone(),
            signal: spec.name.clone(),
            reason,
        };
        spec.validate().map_err(invalid)?;
        if let Some(frame) = spec.frames.iter().find(|f| !frame_ids.contains(f.as_str())) {
            return Err(invalid(format!("scoped to unknown frame `{frame}`")));
        }
        if spec.timeout_trigger.is_some() && !matches!(spec.step, StepFn::Decrement) {
            return Err(invalid("only countdown signals may declare a timeout trigger".into()));
        }
    }
    Ok(())
}
