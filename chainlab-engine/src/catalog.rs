//! Lesson data compiled into the crate, plus the default loader over it.
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::ScenarioLoader;
use crate::scenario::{Scenario, ScenarioError};

/// Bundled lesson sources in presentation order.
const BUNDLED_LESSONS: &[(&str, &str)] = &[
    (
        "first-transaction",
        include_str!("../assets/lessons/first-transaction.json"),
    ),
    (
        "smart-contract-basics",
        include_str!("../assets/lessons/smart-contract-basics.json"),
    ),
    ("mini-app", include_str!("../assets/lessons/mini-app.json")),
    (
        "gas-under-pressure",
        include_str!("../assets/lessons/gas-under-pressure.json"),
    ),
    (
        "approval-risk",
        include_str!("../assets/lessons/approval-risk.json"),
    ),
    (
        "defi-strategy",
        include_str!("../assets/lessons/defi-strategy.json"),
    ),
    (
        "send-tokens",
        include_str!("../assets/lessons/send-tokens.json"),
    ),
    (
        "interact-dapp",
        include_str!("../assets/lessons/interact-dapp.json"),
    ),
    (
        "approve-contract",
        include_str!("../assets/lessons/approve-contract.json"),
    ),
    (
        "transaction-simulator",
        include_str!("../assets/lessons/transaction-simulator.json"),
    ),
];

const BUNDLED_CONFIGS: &[(&str, &str)] = &[("engine", include_str!("../assets/engine.json"))];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("lesson `{lesson}` is invalid: {source}")]
    Invalid {
        lesson: String,
        #[source]
        source: ScenarioError,
    },
    #[error("lesson source `{file}` declares id `{declared}`")]
    IdMismatch { file: String, declared: String },
    #[error("lesson `{0}` is registered twice")]
    Duplicate(String),
    #[error("no lesson named `{0}`")]
    UnknownLesson(String),
    #[error("no configuration named `{0}`")]
    UnknownConfig(String),
    #[error("configuration `{name}` is malformed: {source}")]
    Config {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Short description of a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LessonSummary {
    pub id: String,
    pub title: String,
    pub version: u32,
    pub modes: Vec<String>,
    pub frames: usize,
}

/// Validated scenarios keyed by lesson id, remembering registration order.
#[derive(Debug, Clone, Default)]
pub struct LessonCatalog {
    scenarios: BTreeMap<String, Arc<Scenario>>,
    order: Vec<String>,
}

impl LessonCatalog {
    /// Parse and validate every bundled lesson.
    ///
    /// # Errors
    ///
    /// Returns the first lesson that fails to parse or validate.
    pub fn bundled() -> Result<Self, CatalogError> {
        Self::from_sources(BUNDLED_LESSONS.iter().copied())
    }

    /// Build a catalog from `(lesson id, JSON)` pairs.
    ///
    /// # Errors
    ///
    /// Returns a [`CatalogError`] for invalid JSON, an id that does not match its source name,
    /// or a duplicate lesson.
    pub fn from_sources<'a, I>(sources: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut catalog = Self::default();
        for (file, json) in sources {
            let scenario = Scenario::from_json(json).map_err(|source| CatalogError::Invalid {
                lesson: file.to_string(),
                source,
            })?;
            if scenario.id != file {
                return Err(CatalogError::IdMismatch {
                    file: file.to_string(),
                    declared: scenario.id,
                });
            }
            catalog.insert(scenario)?;
        }
        Ok(catalog)
    }

    /// Register an already-parsed scenario after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Invalid`] or [`CatalogError::Duplicate`].
    pub fn insert(&mut self, scenario: Scenario) -> Result<(), CatalogError> {
        scenario
            .validate()
            .map_err(|source| CatalogError::Invalid {
                lesson: scenario.id.clone(),
                source,
            })?;
        if self.scenarios.contains_key(&scenario.id) {
            return Err(CatalogError::Duplicate(scenario.id));
        }
        self.order.push(scenario.id.clone());
        self.scenarios
            .insert(scenario.id.clone(), Arc::new(scenario));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, lesson: &str) -> Option<Arc<Scenario>> {
        self.scenarios.get(lesson).cloned()
    }

    /// Lesson ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<LessonSummary> {
        self.order
            .iter()
            .filter_map(|id| self.scenarios.get(id))
            .map(|scenario| LessonSummary {
                id: scenario.id.clone(),
                title: scenario.title.clone(),
                version: scenario.version,
                modes: scenario.modes.iter().map(|m| m.id.clone()).collect(),
                frames: scenario.modes.iter().map(|m| m.frames.len()).sum(),
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Loader over the lessons and configuration compiled into this crate.
#[derive(Debug, Clone)]
pub struct BundledLoader {
    catalog: LessonCatalog,
}

impl BundledLoader {
    /// # Errors
    ///
    /// Returns an error when a bundled lesson fails validation.
    pub fn new() -> Result<Self, CatalogError> {
        Ok(Self {
            catalog: LessonCatalog::bundled()?,
        })
    }

    #[must_use]
    pub const fn catalog(&self) -> &LessonCatalog {
        &self.catalog
    }
}

impl ScenarioLoader for BundledLoader {
    type Error = CatalogError;

    fn load_scenario(&self, lesson: &str) -> Result<Arc<Scenario>, Self::Error> {
        self.catalog
            .get(lesson)
            .ok_or_else(|| CatalogError::UnknownLesson(lesson.to_string()))
    }

    fn lesson_ids(&self) -> Vec<String> {
        self.catalog.ids().map(str::to_string).collect()
    }

    fn load_config<T>(&self, config_name: &str) -> Result<T, Self::Error>
    where
        T: DeserializeOwned,
    {
        let (_, json) = BUNDLED_CONFIGS
            .iter()
            .find(|(name, _)| *name == config_name)
            .ok_or_else(|| CatalogError::UnknownConfig(config_name.to_string()))?;
        serde_json::from_str(json).map_err(|source| CatalogError::Config {
            name: config_name.to_string(),
            source,
        })
    }
}
