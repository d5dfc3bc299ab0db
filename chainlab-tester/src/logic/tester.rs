use anyhow::{Context, Result};
use chainlab_engine::{BundledLoader, LessonEngine, ScenarioLoader};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::playthrough::{check_expectations, check_replay, play};
use super::policy::Strategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario_name: String,
    pub lesson: String,
    pub mode: String,
    pub policy: Strategy,
    pub seed: u64,
    pub passed: bool,
    pub iterations_run: usize,
    pub successful_iterations: usize,
    pub completed_iterations: usize,
    pub mean_reward: f64,
    pub failures: Vec<String>,
    #[serde(with = "duration_serde")]
    pub average_duration: Duration,
    #[serde(with = "duration_vec_serde")]
    pub performance_data: Vec<Duration>,
}

pub struct LogicTester<'a> {
    engine: &'a LessonEngine<BundledLoader>,
    verbose: bool,
}

impl<'a> LogicTester<'a> {
    pub const fn new(engine: &'a LessonEngine<BundledLoader>, verbose: bool) -> Self {
        Self { engine, verbose }
    }

    /// Play every mode of `lesson` with `strategy`, once per seed.
    ///
    /// # Errors
    ///
    /// Fails when the lesson cannot be loaded.
    pub fn run_lesson(
        &self,
        lesson: &str,
        strategy: Strategy,
        seeds: &[u64],
        iterations: usize,
    ) -> Result<Vec<ScenarioResult>> {
        let scenario = self
            .engine
            .loader()
            .load_scenario(lesson)
            .with_context(|| format!("failed to load lesson {lesson}"))?;
        let mut results = Vec::new();

        for mode in scenario.mode_ids() {
            for &seed in seeds {
                if self.verbose {
                    println!(
                        "🧪 Testing lesson: {} (mode: {} policy: {} seed: {})",
                        lesson.bright_white(),
                        mode,
                        strategy,
                        seed
                    );
                }
                results.push(self.run_single(lesson, mode, strategy, seed, iterations)?);
            }
        }

        Ok(results)
    }

    fn run_single(
        &self,
        lesson: &str,
        mode_id: &str,
        strategy: Strategy,
        seed: u64,
        iterations: usize,
    ) -> Result<ScenarioResult> {
        let scenario = self.engine.loader().load_scenario(lesson)?;
        let mode = scenario
            .mode(mode_id)
            .with_context(|| format!("lesson {lesson} has no mode {mode_id}"))?;

        let mut successes = 0;
        let mut completed = 0;
        let mut reward_sum: u64 = 0;
        let mut failures = Vec::new();
        let mut performance_data = Vec::new();

        for i in 0..iterations {
            let start_time = Instant::now();
            let iteration_seed = seed.wrapping_add(u64::try_from(i).unwrap_or(u64::MAX));

            let summary = play(self.engine, lesson, mode_id, strategy, iteration_seed)?;
            if summary.complete {
                completed += 1;
            }
            reward_sum += u64::from(summary.reward_total);

            let violation = match check_expectations(&summary, mode) {
                Err(violation) => Some(violation),
                Ok(()) => check_replay(self.engine, &summary)?,
            };

            if let Some(violation) = violation {
                failures.push(format!(
                    "Iteration {} (seed {}, steps {}, frame '{}', reward {}): {} | {}",
                    i + 1,
                    summary.seed,
                    summary.steps,
                    summary.final_frame,
                    summary.reward_total,
                    violation,
                    summary.decision_path()
                ));

                if self.verbose {
                    println!(
                        "  ❌ Iteration {}/{} failed: {}",
                        i + 1,
                        iterations,
                        violation.to_string().red()
                    );
                }
            } else {
                successes += 1;
                let duration = start_time.elapsed();
                performance_data.push(duration);

                if self.verbose {
                    println!(
                        "  ✅ Iteration {}/{} passed ({duration:?}) steps:{} frame:{} reward:{}",
                        i + 1,
                        iterations,
                        summary.steps,
                        summary.final_frame,
                        summary.reward_total
                    );
                }
            }
        }

        let average_duration = if performance_data.is_empty() {
            Duration::ZERO
        } else {
            performance_data.iter().sum::<Duration>()
                / u32::try_from(performance_data.len()).unwrap_or(1)
        };
        let mean_reward = if iterations == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let mean = reward_sum as f64 / iterations as f64;
            mean
        };

        Ok(ScenarioResult {
            scenario_name: format!("{lesson}/{mode_id} [{strategy}]"),
            lesson: lesson.to_string(),
            mode: mode_id.to_string(),
            policy: strategy,
            seed,
            passed: failures.is_empty(),
            iterations_run: iterations,
            successful_iterations: successes,
            completed_iterations: completed,
            mean_reward,
            failures,
            average_duration,
            performance_data,
        })
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u128::deserialize(deserializer)?;
        Ok(Duration::from_millis(u64::try_from(millis).unwrap_or(0)))
    }
}

mod duration_vec_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis: Vec<u128> = durations.iter().map(Duration::as_millis).collect();
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis_vec = Vec::<u128>::deserialize(deserializer)?;
        Ok(millis_vec
            .into_iter()
            .map(|m| Duration::from_millis(u64::try_from(m).unwrap_or(0)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> LessonEngine<BundledLoader> {
        LessonEngine::from_loader(BundledLoader::new().unwrap()).unwrap()
    }

    #[test]
    fn guided_runs_pass_for_every_mode() {
        let engine = engine();
        let tester = LogicTester::new(&engine, false);
        let results = tester
            .run_lesson("send-tokens", Strategy::Guided, &[1, 2], 2)
            .unwrap();
        assert_eq!(results.len(), 4);
        for result in &results {
            assert!(result.passed, "{}: {:?}", result.scenario_name, result.failures);
            assert_eq!(result.completed_iterations, 2);
            assert!(result.mean_reward > 0.0);
        }
    }

    #[test]
    fn unknown_lessons_are_errors() {
        let engine = engine();
        let tester = LogicTester::new(&engine, false);
        assert!(tester.run_lesson("nope", Strategy::Idle, &[1], 1).is_err());
    }

    #[test]
    fn results_serialize_durations_as_millis() {
        let engine = engine();
        let tester = LogicTester::new(&engine, false);
        let results = tester
            .run_lesson("mini-app", Strategy::Idle, &[5], 1)
            .unwrap();
        let json = serde_json::to_value(&results[0]).unwrap();
        assert!(json["average_duration"].is_u64());
        assert_eq!(json["policy"], "idle");
        let restored: ScenarioResult = serde_json::from_value(json).unwrap();
        assert_eq!(restored.scenario_name, "mini-app/standard [idle]");
    }
}
