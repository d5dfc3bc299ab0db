//! Outcome evaluation for outcome and reward frames.
//!
//! Evaluation is a pure function of the scenario, the frame being entered and
//! the recorded choices. Signal readings come from the values captured in a
//! [`ChoiceRecord`] when the choice was made, so replaying the same choices
//! always yields the same verdict.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::progression::ChoiceRecord;
use crate::scenario::{Frame, Mode};

/// Pedagogical classification of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Correct,
    Incorrect,
    Safe,
    Risky,
    Optimal,
    Wasteful,
    Delayed,
    Success,
    Failure,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Correct => "correct",
            Self::Incorrect => "incorrect",
            Self::Safe => "safe",
            Self::Risky => "risky",
            Self::Optimal => "optimal",
            Self::Wasteful => "wasteful",
            Self::Delayed => "delayed",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Whether the outcome frames the learner's decision as a good one.
    #[must_use]
    pub const fn is_favorable(self) -> bool {
        matches!(self, Self::Correct | Self::Safe | Self::Optimal | Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome plus reward granted when no conditional case matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub outcome: Outcome,
    #[serde(default)]
    pub reward: u32,
}

/// A predicate over a recorded choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "if", rename_all = "snake_case")]
pub enum Condition {
    ChoiceIs { id: String },
    SignalAbove { signal: String, value: i64 },
    SignalBelow { signal: String, value: i64 },
    FieldEquals { field: String, value: Value },
}

impl Condition {
    fn holds(&self, record: &ChoiceRecord) -> bool {
        match self {
            Self::ChoiceIs { id } => record.trigger == *id,
            Self::SignalAbove { signal, value } => {
                record.signals.get(signal).is_some_and(|v| v > value)
            }
            Self::SignalBelow { signal, value } => {
                record.signals.get(signal).is_some_and(|v| v < value)
            }
            Self::FieldEquals { field, value } => record.payload.get(field) == Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCase {
    pub when: Vec<Condition>,
    pub outcome: Outcome,
    #[serde(default)]
    pub reward: u32,
}

/// How an evaluating frame derives its outcome.
///
/// `source` names the frame whose recorded choice is judged; when omitted it is
/// the frame the run just left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum OutcomeRule {
    /// Correct when the source frame's correct option was chosen; rewards the source frame.
    Quiz {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// First case whose conditions all hold wins.
    Conditional {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        cases: Vec<OutcomeCase>,
        otherwise: Verdict,
    },
    /// Fixed outcome; rewards the frame's own declared reward.
    Fixed { outcome: Outcome },
}

impl OutcomeRule {
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        match self {
            Self::Quiz { source } | Self::Conditional { source, .. } => source.as_deref(),
            Self::Fixed { .. } => None,
        }
    }
}

/// Evaluator result cached as the run's derived outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Frame the evaluation belongs to.
    pub frame: String,
    pub outcome: Outcome,
    pub reward: u32,
    /// Frame whose recorded choice was judged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Evaluate `frame` on entry.
///
/// Returns `None` for frames that carry no rule. Missing choices are judged as
/// unfavorable rather than treated as errors: a learner can always reach an
/// outcome frame, whatever path got them there.
#[must_use]
pub fn evaluate(
    mode: &Mode,
    frame: &Frame,
    previous: Option<&str>,
    choices: &BTreeMap<String, ChoiceRecord>,
) -> Option<Evaluation> {
    let rule = frame.effective_rule()?;
    let source = rule.source().or(previous).map(str::to_string);
    let record = source.as_deref().and_then(|id| choices.get(id));

    let (outcome, reward) = match &rule {
        OutcomeRule::Quiz { .. } => {
            let quiz = source.as_deref().and_then(|id| mode.frame(id));
            match (quiz, record) {
                (Some(quiz), Some(record))
                    if quiz
                        .correct_option()
                        .is_some_and(|option| option.id == record.trigger) =>
                {
                    (Outcome::Correct, quiz.reward)
                }
                _ => (Outcome::Incorrect, 0),
            }
        }
        OutcomeRule::Conditional {
            cases, otherwise, ..
        } => record
            .and_then(|record| {
                cases
                    .iter()
                    .find(|case| case.when.iter().all(|cond| cond.holds(record)))
                    .map(|case| (case.outcome, case.reward))
            })
            .unwrap_or((otherwise.outcome, otherwise.reward)),
        OutcomeRule::Fixed { outcome } => (*outcome, frame.reward),
    };

    Some(Evaluation {
        frame: frame.id.clone(),
        outcome,
        reward,
        source,
    })
}
