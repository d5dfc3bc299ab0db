//! ChainLab Lesson Engine
//!
//! Platform-agnostic progression engine for the ChainLab Web3 tutorials.
//! Lessons are declarative scenarios; this crate runs them as deterministic
//! state machines with simulated signals and a logical clock, without any UI
//! or platform-specific dependencies.

pub mod catalog;
pub mod config;
pub mod event;
pub mod guard;
pub mod numbers;
pub mod outcome;
pub mod progression;
pub mod rng;
pub mod scenario;
pub mod scheduler;
pub mod signal;

#[cfg(feature = "async")]
pub mod driver;

use std::sync::Arc;
use thiserror::Error;

// Re-export commonly used types
pub use catalog::{BundledLoader, CatalogError, LessonCatalog, LessonSummary};
pub use config::{ConfigError, EngineConfig};
pub use event::{EventId, EventSeverity, Journal, RunEvent, RunEventKind};
pub use guard::{Guard, GuardFailure};
pub use outcome::{Condition, Evaluation, Outcome, OutcomeCase, OutcomeRule, Verdict, evaluate};
pub use progression::{
    ChoiceRecord, Effect, EngineError, LessonRun, ProgressionState, Receipt, Snapshot,
};
pub use scenario::{
    AnswerOption, DeferredTransition, Frame, FrameKind, Mode, Scenario, ScenarioError, TERMINAL,
    Target, Transition,
};
pub use scheduler::{Action, Command, Origin, Ticket};
pub use signal::{Bounds, SignalBank, SignalError, SignalSpec, StepFn};

/// Trait for abstracting scenario loading operations
/// Platform-specific implementations should provide this
pub trait ScenarioLoader {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load a validated scenario by lesson id
    ///
    /// # Errors
    ///
    /// Returns an error if the lesson is unknown or its data cannot be loaded.
    fn load_scenario(&self, lesson: &str) -> Result<Arc<Scenario>, Self::Error>;

    /// Every lesson id this loader can serve, in presentation order
    fn lesson_ids(&self) -> Vec<String>;

    /// Load configuration data for a specific system
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or parsed.
    fn load_config<T>(&self, config_name: &str) -> Result<T, Self::Error>
    where
        T: serde::de::DeserializeOwned;
}

/// Failure to launch a lesson run from a loader.
#[derive(Debug, Error)]
pub enum LaunchError<E>
where
    E: std::error::Error + 'static,
{
    #[error("failed to load lesson data: {0}")]
    Load(#[source] E),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Main engine for creating lesson runs
pub struct LessonEngine<L>
where
    L: ScenarioLoader,
{
    loader: L,
    config: EngineConfig,
}

impl<L> LessonEngine<L>
where
    L: ScenarioLoader,
{
    /// Create an engine with the default configuration
    pub fn new(loader: L) -> Self {
        Self::with_config(loader, EngineConfig::default())
    }

    pub const fn with_config(loader: L, config: EngineConfig) -> Self {
        Self { loader, config }
    }

    /// Create an engine using the loader's `engine` configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or violates its bounds.
    pub fn from_loader(loader: L) -> Result<Self, LaunchError<L::Error>> {
        let config: EngineConfig = loader.load_config("engine").map_err(LaunchError::Load)?;
        config.validate().map_err(EngineError::from)?;
        Ok(Self::with_config(loader, config))
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn loader(&self) -> &L {
        &self.loader
    }

    pub fn lessons(&self) -> Vec<String> {
        self.loader.lesson_ids()
    }

    /// Start a run of `lesson` in `mode` with the engine's configured seed
    ///
    /// # Errors
    ///
    /// Returns an error if the lesson cannot be loaded or the mode is unknown.
    pub fn start_run(&self, lesson: &str, mode: &str) -> Result<LessonRun, LaunchError<L::Error>> {
        self.start_run_with_seed(lesson, mode, self.config.seed)
    }

    /// Start a run with an explicit seed for simulated signals
    ///
    /// # Errors
    ///
    /// Returns an error if the lesson cannot be loaded or the mode is unknown.
    pub fn start_run_with_seed(
        &self,
        lesson: &str,
        mode: &str,
        seed: u64,
    ) -> Result<LessonRun, LaunchError<L::Error>> {
        let scenario = self.loader.load_scenario(lesson).map_err(LaunchError::Load)?;
        let config = self.config.with_seed(seed);
        Ok(LessonRun::start_with_config(scenario, mode, &config)?)
    }
}
