use anyhow::{Context, Result};
use chainlab_engine::{
    BundledLoader, EngineError, LessonEngine, LessonRun, Mode, RunEvent, RunEventKind,
};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::policy::{Decision, Strategy};

/// Upper bound on policy decisions per playthrough.
pub const MAX_STEPS: usize = 500;

/// One decision taken during a playthrough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub step: usize,
    pub frame: String,
    pub action: String,
    pub rationale: Option<String>,
    pub accepted: bool,
}

/// Everything observed while a policy played one lesson mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaythroughSummary {
    pub lesson: String,
    pub mode: String,
    pub strategy: Strategy,
    pub policy_name: String,
    pub seed: u64,
    pub steps: usize,
    pub complete: bool,
    pub reward_total: u32,
    pub final_frame: String,
    pub clock_ms: u64,
    pub rejections: usize,
    /// Reward total sampled after every step.
    pub reward_trace: Vec<u32>,
    pub decisions: Vec<DecisionRecord>,
    pub journal: Vec<RunEvent>,
}

impl PlaythroughSummary {
    #[must_use]
    pub fn timeouts(&self) -> impl Iterator<Item = &str> {
        self.journal.iter().filter_map(|event| match &event.kind {
            RunEventKind::TimedOut { signal, .. } => Some(signal.as_str()),
            _ => None,
        })
    }

    /// Last few decisions, newest first, for failure messages.
    #[must_use]
    pub fn decision_path(&self) -> String {
        if self.decisions.is_empty() {
            return "no decisions recorded".to_string();
        }
        self.decisions
            .iter()
            .rev()
            .take(3)
            .map(|d| {
                format!(
                    "step {} ({}): {} [{}]",
                    d.step,
                    d.frame,
                    d.action,
                    d.rationale.as_deref().unwrap_or("-")
                )
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Broken expectation about a playthrough.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("lesson did not complete (stopped on `{frame}` after {steps} steps)")]
    Incomplete { frame: String, steps: usize },
    #[error("lesson completed without earning a reward")]
    NoReward,
    #[error("idle player completed the lesson")]
    CompletedWhileIdle,
    #[error("reward total fell from {from} to {to} at step {step}")]
    RewardDecreased { step: usize, from: u32, to: u32 },
    #[error("signal `{signal}` reported {value} outside {min}..={max}")]
    SignalOutOfBounds {
        signal: String,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("countdown `{signal}` never expired")]
    MissingTimeout { signal: String },
    #[error("`{trigger}` was rejected on `{frame}`: {reason}")]
    Rejected {
        frame: String,
        trigger: String,
        reason: String,
    },
    #[error("replaying seed {seed} produced a different journal")]
    Nondeterministic { seed: u64 },
}

/// Drive `lesson`/`mode` with a fresh policy until it stops, completes or runs out of steps.
///
/// # Errors
///
/// Fails only when the run cannot be started.
pub fn play(
    engine: &LessonEngine<BundledLoader>,
    lesson: &str,
    mode: &str,
    strategy: Strategy,
    seed: u64,
) -> Result<PlaythroughSummary> {
    let mut run = engine
        .start_run_with_seed(lesson, mode, seed)
        .with_context(|| format!("failed to start {lesson}/{mode}"))?;
    let mut policy = strategy.create_policy(seed);
    let mut decisions = Vec::new();
    let mut reward_trace = vec![run.state().reward_total];
    let mut rejections = 0;
    let mut steps = 0;

    while steps < MAX_STEPS && !run.is_complete() {
        let frame = run.state().current_frame.clone();
        let decision = policy.decide(&run);
        if decision == Decision::Stop {
            break;
        }
        steps += 1;
        let (action, rationale, result) = apply(&mut run, decision);
        debug!("{lesson}/{mode} step {steps} on `{frame}`: {action}");
        let accepted = result.is_ok();
        if !accepted {
            rejections += 1;
        }
        decisions.push(DecisionRecord {
            step: steps,
            frame,
            action,
            rationale: rationale.map(str::to_string),
            accepted,
        });
        reward_trace.push(run.state().reward_total);
    }

    let snapshot = run.snapshot();
    Ok(PlaythroughSummary {
        lesson: lesson.to_string(),
        mode: mode.to_string(),
        strategy,
        policy_name: policy.name().to_string(),
        seed,
        steps,
        complete: snapshot.complete,
        reward_total: snapshot.reward_total,
        final_frame: snapshot.current_frame,
        clock_ms: snapshot.clock_ms,
        rejections,
        reward_trace,
        decisions,
        journal: run.events().to_vec(),
    })
}

fn apply(
    run: &mut LessonRun,
    decision: Decision,
) -> (String, Option<&'static str>, Result<(), EngineError>) {
    match decision {
        Decision::Submit {
            trigger,
            payload,
            rationale,
        } => {
            let frame = run.state().current_frame.clone();
            let result = run.submit(&frame, &trigger, payload).map(drop);
            (format!("submit {trigger}"), Some(rationale), result)
        }
        Decision::Wait { ms } => {
            run.advance(ms);
            (format!("wait {ms}ms"), None, Ok(()))
        }
        Decision::Back => {
            let result = run.go_back().map(drop);
            ("back".to_string(), None, result)
        }
        Decision::Stop => ("stop".to_string(), None, Ok(())),
    }
}

/// Check every expectation that applies to the summary's strategy.
///
/// # Errors
///
/// Returns the first violated expectation.
pub fn check_expectations(summary: &PlaythroughSummary, mode: &Mode) -> Result<(), Violation> {
    check_reward_monotonic(summary)?;
    check_signal_bounds(summary, mode)?;
    match summary.strategy {
        Strategy::Guided => {
            if let Some(rejected) = summary.journal.iter().find_map(|event| match &event.kind {
                RunEventKind::Rejected {
                    frame,
                    trigger,
                    reason,
                    ..
                } => Some(Violation::Rejected {
                    frame: frame.clone(),
                    trigger: trigger.clone(),
                    reason: reason.clone(),
                }),
                _ => None,
            }) {
                return Err(rejected);
            }
            if !summary.complete {
                return Err(Violation::Incomplete {
                    frame: summary.final_frame.clone(),
                    steps: summary.steps,
                });
            }
            if summary.reward_total == 0 {
                return Err(Violation::NoReward);
            }
        }
        Strategy::Idle => {
            if summary.complete {
                return Err(Violation::CompletedWhileIdle);
            }
            let expired: Vec<&str> = summary.timeouts().collect();
            for spec in &mode.signals {
                if spec.timeout_trigger.is_some()
                    && spec.active_on(&mode.entry)
                    && !expired.contains(&spec.name.as_str())
                {
                    return Err(Violation::MissingTimeout {
                        signal: spec.name.clone(),
                    });
                }
            }
        }
        Strategy::Explorer => {}
    }
    Ok(())
}

fn check_reward_monotonic(summary: &PlaythroughSummary) -> Result<(), Violation> {
    for (step, pair) in summary.reward_trace.windows(2).enumerate() {
        if pair[1] < pair[0] {
            return Err(Violation::RewardDecreased {
                step: step + 1,
                from: pair[0],
                to: pair[1],
            });
        }
    }
    Ok(())
}

fn check_signal_bounds(summary: &PlaythroughSummary, mode: &Mode) -> Result<(), Violation> {
    for event in &summary.journal {
        let RunEventKind::Ticked { signal, value } = &event.kind else {
            continue;
        };
        if let Some(spec) = mode.signals.iter().find(|spec| &spec.name == signal)
            && !spec.bounds.contains(*value)
        {
            return Err(Violation::SignalOutOfBounds {
                signal: signal.clone(),
                value: *value,
                min: spec.bounds.min,
                max: spec.bounds.max,
            });
        }
    }
    Ok(())
}

/// Play the same seed twice and require identical journals.
///
/// # Errors
///
/// Fails when the replay cannot be started.
pub fn check_replay(
    engine: &LessonEngine<BundledLoader>,
    summary: &PlaythroughSummary,
) -> Result<Option<Violation>> {
    let replay = play(
        engine,
        &summary.lesson,
        &summary.mode,
        summary.strategy,
        summary.seed,
    )?;
    Ok((replay.journal != summary.journal).then_some(Violation::Nondeterministic {
        seed: summary.seed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlab_engine::ScenarioLoader;

    fn engine() -> LessonEngine<BundledLoader> {
        LessonEngine::from_loader(BundledLoader::new().unwrap()).unwrap()
    }

    fn mode_of(engine: &LessonEngine<BundledLoader>, lesson: &str, mode: &str) -> Mode {
        engine
            .loader()
            .load_scenario(lesson)
            .unwrap()
            .mode(mode)
            .unwrap()
            .clone()
    }

    #[test]
    fn guided_playthrough_meets_expectations() {
        let engine = engine();
        let summary = play(&engine, "approval-risk", "standard", Strategy::Guided, 7).unwrap();
        assert!(summary.complete);
        assert_eq!(summary.reward_total, 350);
        assert_eq!(summary.rejections, 0);
        let mode = mode_of(&engine, "approval-risk", "standard");
        check_expectations(&summary, &mode).unwrap();
        assert!(check_replay(&engine, &summary).unwrap().is_none());
    }

    #[test]
    fn idle_playthrough_times_out() {
        let engine = engine();
        let summary = play(&engine, "gas-under-pressure", "standard", Strategy::Idle, 3).unwrap();
        assert!(!summary.complete);
        assert_eq!(summary.final_frame, "expired");
        assert_eq!(summary.timeouts().collect::<Vec<_>>(), ["countdownSeconds"]);
        let mode = mode_of(&engine, "gas-under-pressure", "standard");
        check_expectations(&summary, &mode).unwrap();
    }

    #[test]
    fn explorer_playthroughs_stay_within_invariants() {
        let engine = engine();
        for seed in 0..5 {
            let summary = play(&engine, "first-transaction", "standard", Strategy::Explorer, seed)
                .unwrap();
            assert!(summary.steps <= MAX_STEPS);
            let mode = mode_of(&engine, "first-transaction", "standard");
            check_expectations(&summary, &mode).unwrap();
        }
    }

    #[test]
    fn reward_regressions_are_reported() {
        let engine = engine();
        let mut summary = play(&engine, "mini-app", "standard", Strategy::Guided, 1).unwrap();
        summary.reward_trace = vec![0, 100, 50];
        let mode = mode_of(&engine, "mini-app", "standard");
        assert_eq!(
            check_expectations(&summary, &mode),
            Err(Violation::RewardDecreased {
                step: 2,
                from: 100,
                to: 50
            })
        );
    }

    #[test]
    fn incomplete_guided_runs_fail() {
        let engine = engine();
        let mut summary = play(&engine, "mini-app", "standard", Strategy::Guided, 1).unwrap();
        summary.complete = false;
        summary.final_frame = "counter-2".into();
        let mode = mode_of(&engine, "mini-app", "standard");
        assert!(matches!(
            check_expectations(&summary, &mode),
            Err(Violation::Incomplete { .. })
        ));
        assert!(summary.decision_path().contains("submit"));
    }
}
