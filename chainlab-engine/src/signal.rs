//! Timed signal generator: synthetic countdowns and fluctuating network metrics.
//!
//! A [`SignalBank`] owns every signal of one lesson run. The bank only knows
//! how to advance a value; cadence is the scheduler's concern, so ticking is
//! deterministic and needs no wall clock.
use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::rng::CountingRng;

/// Inclusive value range a signal is clamped to after every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: i64,
    pub max: i64,
}

impl Bounds {
    #[must_use]
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn clamp(self, value: i64) -> i64 {
        value.clamp(self.min, self.max)
    }

    #[must_use]
    pub const fn contains(self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Perturbation rule applied on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepFn {
    /// Countdown: strictly minus one per tick.
    Decrement,
    /// Plus or minus `delta` with even odds.
    RandomWalk { delta: i64 },
    /// Constant push by `delta` (negative drifts down).
    Drift { delta: i64 },
    /// Value never changes.
    Hold,
}

/// Static declaration of a signal inside a scenario mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    pub initial: i64,
    pub bounds: Bounds,
    pub step: StepFn,
    pub interval_ms: u64,
    /// Trigger submitted when a countdown reaches its lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_trigger: Option<String>,
    /// Frames on which the signal advances; empty means the whole run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<String>,
}

impl SignalSpec {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        initial: i64,
        bounds: Bounds,
        step: StepFn,
        interval_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            initial,
            bounds,
            step,
            interval_ms,
            timeout_trigger: None,
            frames: Vec::new(),
        }
    }

    /// One-second countdown from `seconds` to zero.
    #[must_use]
    pub fn countdown(name: impl Into<String>, seconds: i64, trigger: impl Into<String>) -> Self {
        Self::new(name, seconds, Bounds::new(0, seconds), StepFn::Decrement, 1_000)
            .with_timeout(trigger)
    }

    #[must_use]
    pub fn with_timeout(mut self, trigger: impl Into<String>) -> Self {
        self.timeout_trigger = Some(trigger.into());
        self
    }

    #[must_use]
    pub fn scoped_to<I, S>(mut self, frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.frames = frames.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the signal advances while `frame` is current.
    #[must_use]
    pub fn active_on(&self, frame: &str) -> bool {
        self.frames.is_empty() || self.frames.iter().any(|f| f == frame)
    }

    /// Static sanity checks on bounds, cadence and step rule.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason for the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.bounds.min > self.bounds.max {
            return Err(format!(
                "bounds inverted (min {} > max {})",
                self.bounds.min, self.bounds.max
            ));
        }
        if !self.bounds.contains(self.initial) {
            return Err(format!(
                "initial value {} outside {}..={}",
                self.initial, self.bounds.min, self.bounds.max
            ));
        }
        if self.interval_ms == 0 {
            return Err("tick interval must be positive".to_string());
        }
        if matches!(self.step, StepFn::Decrement) && self.bounds.min != 0 {
            return Err("countdowns must stop at zero".to_string());
        }
        Ok(())
    }
}

/// Errors raised when managing a run's signals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("signal `{0}` is already registered for this run")]
    Duplicate(String),
    #[error("signals for this run have been cancelled")]
    Cancelled,
}

/// Live signal state.
#[derive(Debug, Clone)]
pub struct SimulatedSignal {
    spec: SignalSpec,
    value: i64,
    ticks: u64,
    fired: bool,
    rng: CountingRng<SmallRng>,
}

impl SimulatedSignal {
    fn new(spec: SignalSpec, run_seed: u64) -> Self {
        let rng = CountingRng::for_domain(run_seed, spec.name.as_bytes());
        Self {
            value: spec.bounds.clamp(spec.initial),
            spec,
            ticks: 0,
            fired: false,
            rng,
        }
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.value
    }

    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    #[must_use]
    pub const fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    /// Countdowns stop for good once they have fired.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.fired
    }

    fn next_value(&mut self) -> i64 {
        let raw = match self.spec.step {
            StepFn::Decrement => self.value.saturating_sub(1),
            StepFn::RandomWalk { delta } => {
                if self.rng.gen_bool(0.5) {
                    self.value.saturating_add(delta)
                } else {
                    self.value.saturating_sub(delta)
                }
            }
            StepFn::Drift { delta } => self.value.saturating_add(delta),
            StepFn::Hold => self.value,
        };
        self.spec.bounds.clamp(raw)
    }
}

/// Result of one applied tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub signal: String,
    pub value: i64,
    /// Present exactly once per countdown: the trigger to submit on timeout.
    pub timeout: Option<String>,
}

/// Every signal belonging to one lesson run.
#[derive(Debug, Clone, Default)]
pub struct SignalBank {
    run_seed: u64,
    signals: BTreeMap<String, SimulatedSignal>,
    cancelled: bool,
}

impl SignalBank {
    #[must_use]
    pub fn new(run_seed: u64) -> Self {
        Self {
            run_seed,
            signals: BTreeMap::new(),
            cancelled: false,
        }
    }

    /// Begin tracking a signal. Only one signal per name may exist in a run.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Duplicate`] for a second registration under the same name
    /// and [`SignalError::Cancelled`] once the bank has been cancelled.
    pub fn register(&mut self, spec: SignalSpec) -> Result<(), SignalError> {
        if self.cancelled {
            return Err(SignalError::Cancelled);
        }
        if self.signals.contains_key(&spec.name) {
            return Err(SignalError::Duplicate(spec.name));
        }
        let name = spec.name.clone();
        self.signals
            .insert(name, SimulatedSignal::new(spec, self.run_seed));
        Ok(())
    }

    /// Advance a signal by one step.
    ///
    /// Returns `None` when the bank is cancelled, the signal is unknown, or a countdown has
    /// already fired; ticks racing cancellation are therefore harmless no-ops.
    pub fn tick(&mut self, name: &str) -> Option<TickOutcome> {
        if self.cancelled {
            return None;
        }
        let signal = self.signals.get_mut(name)?;
        if signal.fired {
            return None;
        }
        signal.value = signal.next_value();
        signal.ticks = signal.ticks.saturating_add(1);

        let is_countdown = matches!(signal.spec.step, StepFn::Decrement);
        let timeout = if is_countdown && signal.value <= signal.spec.bounds.min {
            signal.fired = true;
            signal.spec.timeout_trigger.clone()
        } else {
            None
        };
        Some(TickOutcome {
            signal: name.to_string(),
            value: signal.value,
            timeout,
        })
    }

    /// Stop every signal. Later ticks are ignored.
    pub fn cancel_all(&mut self) {
        self.cancelled = true;
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether the named signal would still respond to ticks.
    #[must_use]
    pub fn is_live(&self, name: &str) -> bool {
        !self.cancelled && self.signals.get(name).is_some_and(|s| !s.fired)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SimulatedSignal> {
        self.signals.get(name)
    }

    /// Current value of every signal, keyed by name.
    #[must_use]
    pub fn values(&self) -> BTreeMap<String, i64> {
        self.signals
            .iter()
            .map(|(name, signal)| (name.clone(), signal.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_reaches_zero_after_exact_ticks_and_fires_once() {
        let mut bank = SignalBank::new(1);
        bank.register(SignalSpec::countdown("countdownSeconds", 60, "timeout"))
            .unwrap();

        let mut fired = Vec::new();
        for _ in 0..59 {
            let outcome = bank.tick("countdownSeconds").unwrap();
            assert!(outcome.value > 0);
            assert!(outcome.timeout.is_none());
        }
        let last = bank.tick("countdownSeconds").unwrap();
        assert_eq!(last.value, 0);
        fired.extend(last.timeout);
        for _ in 0..5 {
            assert!(bank.tick("countdownSeconds").is_none());
        }
        assert_eq!(fired, vec!["timeout".to_string()]);
        assert_eq!(bank.get("countdownSeconds").unwrap().ticks(), 60);
        assert_eq!(bank.values()["countdownSeconds"], 0);
    }

    #[test]
    fn random_walk_stays_in_bounds_and_is_seeded() {
        let spec = SignalSpec::new(
            "networkCongestionPct",
            75,
            Bounds::new(60, 90),
            StepFn::RandomWalk { delta: 5 },
            2_000,
        );
        let mut a = SignalBank::new(99);
        let mut b = SignalBank::new(99);
        a.register(spec.clone()).unwrap();
        b.register(spec).unwrap();
        for _ in 0..500 {
            let va = a.tick("networkCongestionPct").unwrap().value;
            let vb = b.tick("networkCongestionPct").unwrap().value;
            assert_eq!(va, vb);
            assert!((60..=90).contains(&va));
        }
    }

    #[test]
    fn drift_clamps_at_bounds() {
        let mut bank = SignalBank::new(0);
        bank.register(SignalSpec::new(
            "gasPriceGwei",
            55,
            Bounds::new(40, 60),
            StepFn::Drift { delta: 4 },
            500,
        ))
        .unwrap();
        let values: Vec<i64> = (0..3).map(|_| bank.tick("gasPriceGwei").unwrap().value).collect();
        assert_eq!(values, vec![59, 60, 60]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut bank = SignalBank::new(0);
        bank.register(SignalSpec::countdown("t", 5, "go")).unwrap();
        assert_eq!(
            bank.register(SignalSpec::countdown("t", 9, "go")),
            Err(SignalError::Duplicate("t".into()))
        );
    }

    #[test]
    fn ticks_after_cancel_are_noops() {
        let mut bank = SignalBank::new(0);
        bank.register(SignalSpec::countdown("t", 5, "go")).unwrap();
        bank.tick("t");
        bank.cancel_all();
        assert!(bank.tick("t").is_none());
        assert!(!bank.is_live("t"));
        assert_eq!(bank.values()["t"], 4);
        assert_eq!(
            bank.register(SignalSpec::countdown("u", 5, "go")),
            Err(SignalError::Cancelled)
        );
    }

    #[test]
    fn scope_controls_activity() {
        let spec = SignalSpec::countdown("t", 5, "go").scoped_to(["intro"]);
        assert!(spec.active_on("intro"));
        assert!(!spec.active_on("builder"));
        assert!(SignalSpec::countdown("t", 5, "go").active_on("anything"));
    }

    #[test]
    fn validate_flags_bad_specs() {
        assert!(SignalSpec::new("x", 5, Bounds::new(10, 0), StepFn::Hold, 1).validate().is_err());
        assert!(SignalSpec::new("x", 50, Bounds::new(0, 10), StepFn::Hold, 1).validate().is_err());
        assert!(SignalSpec::new("x", 5, Bounds::new(0, 10), StepFn::Hold, 0).validate().is_err());
        assert!(
            SignalSpec::new("x", 5, Bounds::new(1, 10), StepFn::Decrement, 1)
                .validate()
                .is_err()
        );
        assert!(SignalSpec::countdown("x", 60, "go").validate().is_ok());
    }
}
