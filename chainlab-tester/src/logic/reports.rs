use anyhow::Result;
use chainlab_engine::LessonSummary;
use colored::Colorize;
use std::io::Write;
use std::time::Duration;

use super::ScenarioResult;
use crate::common::report_timestamp;

fn success_rate(results: &[ScenarioResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let passed = results.iter().filter(|r| r.passed).count();
    #[allow(clippy::cast_precision_loss)]
    let rate = (passed as f64 / results.len() as f64) * 100.0;
    rate
}

pub fn generate_console_report<W: Write + ?Sized>(
    out: &mut W,
    results: &[ScenarioResult],
    total_duration: Duration,
) -> Result<()> {
    writeln!(out)?;
    writeln!(out, "{}", "📊 Lesson Playthrough Summary".bright_cyan().bold())?;
    writeln!(out, "{}", "=============================".cyan())?;

    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();

    writeln!(out, "Total runs: {total}")?;
    writeln!(out, "Passed: {}", passed.to_string().green())?;
    writeln!(out, "Failed: {}", (total - passed).to_string().red())?;
    writeln!(out, "Success rate: {:.1}%", success_rate(results))?;
    writeln!(out, "Total time: {total_duration:?}")?;
    writeln!(out)?;

    for result in results {
        let status = if result.passed {
            "✅ PASS".green()
        } else {
            "❌ FAIL".red()
        };

        writeln!(out, "{} {} (seed {})", status, result.scenario_name.bold(), result.seed)?;
        writeln!(
            out,
            "   Iterations: {}/{} successful, {} completed",
            result.successful_iterations, result.iterations_run, result.completed_iterations
        )?;
        writeln!(out, "   Mean reward: {:.1}", result.mean_reward)?;
        writeln!(out, "   Average time: {:?}", result.average_duration)?;

        if !result.failures.is_empty() {
            writeln!(out, "   Failures:")?;
            for failure in &result.failures {
                writeln!(out, "     • {}", failure.red())?;
            }
        }
        writeln!(out)?;
    }

    let fastest = results.iter().min_by_key(|r| r.average_duration);
    let slowest = results.iter().max_by_key(|r| r.average_duration);
    if let (Some(fastest), Some(slowest)) = (fastest, slowest) {
        writeln!(out, "{}", "⚡ Performance Summary".bright_yellow().bold())?;
        writeln!(out, "{}", "=====================".yellow())?;
        writeln!(
            out,
            "Fastest: {} ({:?})",
            fastest.scenario_name.green(),
            fastest.average_duration
        )?;
        writeln!(
            out,
            "Slowest: {} ({:?})",
            slowest.scenario_name.yellow(),
            slowest.average_duration
        )?;
    }
    Ok(())
}

pub fn generate_json_report<W: Write + ?Sized>(out: &mut W, results: &[ScenarioResult]) -> Result<()> {
    let json_output = serde_json::to_string_pretty(results)?;
    writeln!(out, "{json_output}")?;
    Ok(())
}

pub fn generate_markdown_report<W: Write + ?Sized>(
    out: &mut W,
    results: &[ScenarioResult],
) -> Result<()> {
    writeln!(out, "# ChainLab Lesson Test Results\n")?;
    writeln!(out, "_Generated {}_\n", report_timestamp())?;

    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();

    writeln!(out, "## Summary\n")?;
    writeln!(out, "- **Total runs**: {total}")?;
    writeln!(out, "- **Passed**: {passed}")?;
    writeln!(out, "- **Failed**: {}", total - passed)?;
    writeln!(out, "- **Success rate**: {:.1}%\n", success_rate(results))?;

    writeln!(out, "## Detailed Results\n")?;
    writeln!(out, "| Status | Lesson | Mode | Policy | Seed | Passed | Completed | Mean reward |")?;
    writeln!(out, "|---|---|---|---|---|---|---|---|")?;
    for result in results {
        let status = if result.passed { "✅" } else { "❌" };
        writeln!(
            out,
            "| {status} | {} | {} | {} | {} | {}/{} | {} | {:.1} |",
            result.lesson,
            result.mode,
            result.policy,
            result.seed,
            result.successful_iterations,
            result.iterations_run,
            result.completed_iterations,
            result.mean_reward
        )?;
    }

    let failing: Vec<&ScenarioResult> = results.iter().filter(|r| !r.passed).collect();
    if !failing.is_empty() {
        writeln!(out, "\n## Failures\n")?;
        for result in failing {
            writeln!(out, "### {}\n", result.scenario_name)?;
            for failure in &result.failures {
                writeln!(out, "- {failure}")?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

pub fn generate_catalog_listing<W: Write + ?Sized>(
    out: &mut W,
    lessons: &[LessonSummary],
) -> Result<()> {
    writeln!(out, "Available lessons:")?;
    for lesson in lessons {
        writeln!(
            out,
            "  {:25} - {} (v{}, modes: {}, {} frames)",
            lesson.id,
            lesson.title,
            lesson.version,
            lesson.modes.join(", "),
            lesson.frames
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::Strategy;

    fn sample_result(passed: bool) -> ScenarioResult {
        ScenarioResult {
            scenario_name: "mini-app/standard [guided]".to_string(),
            lesson: "mini-app".to_string(),
            mode: "standard".to_string(),
            policy: Strategy::Guided,
            seed: 42,
            passed,
            iterations_run: 3,
            successful_iterations: if passed { 3 } else { 2 },
            completed_iterations: 3,
            mean_reward: 100.0,
            failures: if passed {
                Vec::new()
            } else {
                vec!["reward total fell".to_string()]
            },
            average_duration: Duration::from_millis(2),
            performance_data: vec![Duration::from_millis(2)],
        }
    }

    fn render(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> String {
        let mut buffer = Vec::new();
        f(&mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn console_report_lists_failures() {
        let results = [sample_result(true), sample_result(false)];
        let text = render(|out| generate_console_report(out, &results, Duration::from_secs(1)));
        assert!(text.contains("Lesson Playthrough Summary"));
        assert!(text.contains("Success rate: 50.0%"));
        assert!(text.contains("reward total fell"));
        assert!(text.contains("Performance Summary"));
    }

    #[test]
    fn markdown_report_has_a_results_table() {
        let results = [sample_result(false)];
        let text = render(|out| generate_markdown_report(out, &results));
        assert!(text.starts_with("# ChainLab Lesson Test Results"));
        assert!(text.contains("| ❌ | mini-app | standard | guided | 42 | 2/3 | 3 | 100.0 |"));
        assert!(text.contains("## Failures"));
    }

    #[test]
    fn json_report_is_an_array() {
        let text = render(|out| generate_json_report(out, &[sample_result(true)]));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(1));
        assert_eq!(value[0]["lesson"], "mini-app");
    }

    #[test]
    fn empty_results_have_zero_success_rate() {
        assert!(success_rate(&[]).abs() < f64::EPSILON);
    }
}
