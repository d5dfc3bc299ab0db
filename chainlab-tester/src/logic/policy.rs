use std::fmt;

use anyhow::{Result, bail};
use chainlab_engine::{Frame, LessonRun, Target, Transition};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical time an idle player is willing to wait before giving up.
pub const IDLE_HORIZON_MS: u64 = 120_000;

/// Next move chosen by a [`PlaythroughPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Submit {
        trigger: String,
        payload: Value,
        rationale: &'static str,
    },
    Wait {
        ms: u64,
    },
    Back,
    Stop,
}

/// Policy interface for automated lesson playthroughs.
pub trait PlaythroughPolicy {
    /// Name used for logging/debug output.
    fn name(&self) -> &'static str;

    /// Choose the next move for the run's current frame.
    fn decide(&mut self, run: &LessonRun) -> Decision;
}

/// Built-in playthrough strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Answers correctly and always moves forward.
    Guided,
    /// Seeded random walk over declared triggers, with occasional back steps.
    Explorer,
    /// Never acts; only lets logical time pass.
    Idle,
}

impl Strategy {
    pub const ALL: [Self; 3] = [Self::Guided, Self::Explorer, Self::Idle];

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Guided => "guided",
            Self::Explorer => "explorer",
            Self::Idle => "idle",
        }
    }

    /// Parse a CLI policy name.
    ///
    /// # Errors
    ///
    /// Fails for names that are not one of the built-in strategies.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "guided" => Ok(Self::Guided),
            "explorer" | "random" => Ok(Self::Explorer),
            "idle" => Ok(Self::Idle),
            other => bail!("Unknown policy: {other} (expected guided, explorer or idle)"),
        }
    }

    #[must_use]
    pub fn create_policy(self, seed: u64) -> Box<dyn PlaythroughPolicy> {
        match self {
            Self::Guided => Box::new(GuidedPolicy),
            Self::Explorer => Box::new(ExplorerPolicy::new(seed)),
            Self::Idle => Box::new(IdlePolicy::default()),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Transitions a learner can trigger by hand: everything except signal timeout triggers.
fn user_transitions<'a>(run: &LessonRun, frame: &'a Frame) -> Vec<(&'a String, &'a Transition)> {
    let timeouts: Vec<&str> = run
        .mode()
        .signals
        .iter()
        .filter_map(|spec| spec.timeout_trigger.as_deref())
        .collect();
    frame
        .transitions
        .iter()
        .filter(|(trigger, _)| !timeouts.contains(&trigger.as_str()))
        .collect()
}

fn submit(trigger: &str, transition: &Transition, rationale: &'static str) -> Decision {
    Decision::Submit {
        trigger: trigger.to_string(),
        payload: transition.autofill.clone().unwrap_or(Value::Null),
        rationale,
    }
}

fn wait_or_stop(run: &LessonRun) -> Decision {
    run.next_due_in()
        .map_or(Decision::Stop, |ms| Decision::Wait { ms })
}

struct GuidedPolicy;

impl PlaythroughPolicy for GuidedPolicy {
    fn name(&self) -> &'static str {
        "Guided"
    }

    fn decide(&mut self, run: &LessonRun) -> Decision {
        let Some(frame) = run.current() else {
            return Decision::Stop;
        };
        if let Some(option) = frame.correct_option()
            && let Some(transition) = frame.transitions.get(&option.id)
        {
            return submit(&option.id, transition, "correct answer");
        }
        if !frame.deferred.is_empty() {
            return wait_or_stop(run);
        }
        user_transitions(run, frame)
            .into_iter()
            .max_by_key(|(_, transition)| match &transition.target {
                Target::Terminal => usize::MAX,
                Target::Frame(next) => run.mode().position(next).unwrap_or(0),
            })
            .map_or(Decision::Stop, |(trigger, transition)| {
                submit(trigger, transition, "furthest forward")
            })
    }
}

struct ExplorerPolicy {
    rng: ChaCha20Rng,
}

impl ExplorerPolicy {
    fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }
}

impl PlaythroughPolicy for ExplorerPolicy {
    fn name(&self) -> &'static str {
        "Explorer"
    }

    fn decide(&mut self, run: &LessonRun) -> Decision {
        let Some(frame) = run.current() else {
            return Decision::Stop;
        };
        if !frame.deferred.is_empty() && self.rng.gen_bool(0.5) {
            return wait_or_stop(run);
        }
        if !run.state().history.is_empty() && self.rng.gen_bool(0.1) {
            return Decision::Back;
        }
        let choices = user_transitions(run, frame);
        if choices.is_empty() {
            return wait_or_stop(run);
        }
        let (trigger, transition) = choices[self.rng.gen_range(0..choices.len())];
        submit(trigger, transition, "random pick")
    }
}

#[derive(Default)]
struct IdlePolicy {
    waited_ms: u64,
}

impl PlaythroughPolicy for IdlePolicy {
    fn name(&self) -> &'static str {
        "Idle"
    }

    fn decide(&mut self, run: &LessonRun) -> Decision {
        match run.next_due_in() {
            Some(ms) if self.waited_ms < IDLE_HORIZON_MS => {
                let ms = ms.max(1);
                self.waited_ms = self.waited_ms.saturating_add(ms);
                Decision::Wait { ms }
            }
            _ => Decision::Stop,
        }
    }
}
