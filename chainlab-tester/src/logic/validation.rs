use chainlab_engine::{LessonCatalog, Mode, Target};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Content problem found by static catalog checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogIssue {
    pub lesson: String,
    pub mode: String,
    pub problem: String,
}

impl fmt::Display for CatalogIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.lesson, self.mode, self.problem)
    }
}

/// Lint every lesson beyond the structural checks the engine enforces at load.
#[must_use]
pub fn validate_catalog(catalog: &LessonCatalog) -> Vec<CatalogIssue> {
    let mut issues = Vec::new();
    for lesson in catalog.ids() {
        let Some(scenario) = catalog.get(lesson) else {
            continue;
        };
        if let Err(err) = scenario.validate() {
            issues.push(CatalogIssue {
                lesson: lesson.to_string(),
                mode: "*".to_string(),
                problem: err.to_string(),
            });
            continue;
        }
        for mode in &scenario.modes {
            for problem in lint_mode(mode) {
                issues.push(CatalogIssue {
                    lesson: lesson.to_string(),
                    mode: mode.id.clone(),
                    problem,
                });
            }
        }
    }
    issues
}

fn lint_mode(mode: &Mode) -> Vec<String> {
    let mut problems = Vec::new();

    if !can_terminate(mode) {
        problems.push(format!("no path from `{}` reaches terminal", mode.entry));
    }

    for spec in &mode.signals {
        let Some(trigger) = &spec.timeout_trigger else {
            continue;
        };
        for frame in mode.frames.iter().filter(|f| spec.active_on(&f.id)) {
            if !frame.transitions.contains_key(trigger) {
                problems.push(format!(
                    "`{}` can expire on `{}` but the frame has no `{trigger}` transition",
                    spec.name, frame.id
                ));
            }
        }
    }

    for frame in &mode.frames {
        if frame.reward > 0 && frame.effective_rule().is_none() && !feeds_quiz(mode, &frame.id) {
            problems.push(format!(
                "`{}` declares a reward that nothing evaluates",
                frame.id
            ));
        }
    }

    problems
}

fn can_terminate(mode: &Mode) -> bool {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([mode.entry.as_str()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let Some(frame) = mode.frame(id) else {
            continue;
        };
        for transition in frame.transitions.values() {
            match &transition.target {
                Target::Terminal => return true,
                Target::Frame(next) => queue.push_back(next.as_str()),
            }
        }
    }
    false
}

/// Whether some evaluating frame scores answers given on `frame`.
fn feeds_quiz(mode: &Mode, frame: &str) -> bool {
    let leads_to = |target: &str| {
        mode.frame(frame).is_some_and(|f| {
            f.transitions
                .values()
                .any(|t| matches!(&t.target, Target::Frame(next) if next == target))
        })
    };
    mode.frames.iter().any(|candidate| {
        candidate.effective_rule().is_some_and(|rule| {
            rule.source()
                .map_or_else(|| leads_to(&candidate.id), |source| source == frame)
        })
    })
}
