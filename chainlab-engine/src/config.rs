//! Engine tuning shared by every run a host creates.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seed used when the host does not pick one.
pub const DEFAULT_SEED: u64 = 0x5EED_C4A1_7AB5;

/// Run-level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seed for simulated signal streams.
    #[serde(default = "EngineConfig::default_seed")]
    pub seed: u64,
    /// Upper bound on scheduled entries fired by a single `advance` call.
    #[serde(default = "EngineConfig::default_max_pump")]
    pub max_pump: u32,
    /// Multiplier applied to every scheduled delay (signal cadence and deferred transitions).
    #[serde(default = "EngineConfig::default_time_scale")]
    pub time_scale: f64,
}

/// Errors raised when configuration invariants are violated.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be at least {min} (got {value})")]
    MinViolation {
        field: &'static str,
        min: u64,
        value: u64,
    },
    #[error("{field} must be between {min:.2} and {max:.2} (got {value:.2})")]
    RangeViolation {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("engine configuration is malformed: {0}")]
    Parse(String),
}

impl EngineConfig {
    pub const MIN_TIME_SCALE: f64 = 0.01;
    pub const MAX_TIME_SCALE: f64 = 100.0;

    #[must_use]
    pub const fn default_seed() -> u64 {
        DEFAULT_SEED
    }

    #[must_use]
    pub const fn default_max_pump() -> u32 {
        10_000
    }

    #[must_use]
    pub const fn default_time_scale() -> f64 {
        1.0
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Parse and validate JSON configuration. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and a bound violation otherwise.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when any field violates its documented bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pump < 1 {
            return Err(ConfigError::MinViolation {
                field: "max_pump",
                min: 1,
                value: u64::from(self.max_pump),
            });
        }
        if !(Self::MIN_TIME_SCALE..=Self::MAX_TIME_SCALE).contains(&self.time_scale) {
            return Err(ConfigError::RangeViolation {
                field: "time_scale",
                min: Self::MIN_TIME_SCALE,
                max: Self::MAX_TIME_SCALE,
                value: self.time_scale,
            });
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: Self::default_seed(),
            max_pump: Self::default_max_pump(),
            time_scale: Self::default_time_scale(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_json_overrides_fields() {
        let config = EngineConfig::from_json(r#"{ "seed": 42, "time_scale": 0.5 }"#).unwrap();
        assert_eq!(config.seed, 42);
        assert!((config.time_scale - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.max_pump, EngineConfig::default_max_pump());
    }

    #[test]
    fn validate_reports_bounds() {
        let config = EngineConfig {
            max_pump: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MinViolation {
                field: "max_pump",
                ..
            })
        ));

        let err = EngineConfig::from_json(r#"{ "time_scale": 500.0 }"#).unwrap_err();
        assert!(err.to_string().contains("time_scale must be between"));
        assert!(matches!(
            EngineConfig::from_json("[1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }
}
