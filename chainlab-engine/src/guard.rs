//! Payload checks attached to input-form transitions.
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Declarative validation of a submitted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Guard {
    /// Field must exist and be non-empty.
    Present { field: String },
    /// Field must equal the given JSON value. Numeric strings compare against numbers.
    Equals { field: String, value: Value },
    /// Field must parse as a number inside the inclusive range.
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Field must be a string matching the regular expression.
    Pattern { field: String, pattern: GuardPattern },
    /// Every nested guard must pass.
    All { guards: Vec<Guard> },
}

/// Regular expression source, compiled the first time it is validated or used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct GuardPattern {
    source: String,
    compiled: OnceLock<Result<Regex, String>>,
}

impl GuardPattern {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the expression has already been compiled.
    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }

    fn regex(&self) -> Result<&Regex, &str> {
        self.compiled
            .get_or_init(|| Regex::new(&self.source).map_err(|err| err.to_string()))
            .as_ref()
            .map_err(String::as_str)
    }
}

impl From<String> for GuardPattern {
    fn from(source: String) -> Self {
        Self {
            source,
            compiled: OnceLock::new(),
        }
    }
}

impl From<&str> for GuardPattern {
    fn from(source: &str) -> Self {
        Self::from(source.to_string())
    }
}

impl From<GuardPattern> for String {
    fn from(pattern: GuardPattern) -> Self {
        pattern.source
    }
}

impl PartialEq for GuardPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardFailure {
    pub field: String,
    pub reason: String,
}

impl std::fmt::Display for GuardFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}` {}", self.field, self.reason)
    }
}

impl Guard {
    #[must_use]
    pub fn present(field: impl Into<String>) -> Self {
        Self::Present {
            field: field.into(),
        }
    }

    #[must_use]
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn pattern(field: impl Into<String>, pattern: impl Into<GuardPattern>) -> Self {
        Self::Pattern {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    /// Check the guard's static configuration and compile its patterns.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed pattern.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Pattern { pattern, .. } => pattern
                .regex()
                .map(|_| ())
                .map_err(ToString::to_string),
            Self::Range {
                min: Some(min),
                max: Some(max),
                ..
            } if min > max => Err(format!("range minimum {min} exceeds maximum {max}")),
            Self::All { guards } => guards.iter().try_for_each(Self::validate),
            _ => Ok(()),
        }
    }

    /// Apply the guard to a payload.
    ///
    /// # Errors
    ///
    /// Returns the first [`GuardFailure`] encountered.
    pub fn check(&self, payload: &Value) -> Result<(), GuardFailure> {
        match self {
            Self::Present { field } => {
                if is_blank(payload.get(field)) {
                    return Err(failure(field, "is required"));
                }
                Ok(())
            }
            Self::Equals { field, value } => {
                let actual = payload.get(field);
                if actual.is_some_and(|actual| loosely_equal(actual, value)) {
                    Ok(())
                } else {
                    Err(failure(field, &format!("must be {value}")))
                }
            }
            Self::Range { field, min, max } => {
                let Some(number) = payload.get(field).and_then(as_number) else {
                    return Err(failure(field, "must be a number"));
                };
                if min.is_some_and(|min| number < min) || max.is_some_and(|max| number > max) {
                    return Err(failure(field, &describe_range(*min, *max)));
                }
                Ok(())
            }
            Self::Pattern { field, pattern } => {
                let Some(text) = payload.get(field).and_then(Value::as_str) else {
                    return Err(failure(field, "must be text"));
                };
                let regex = pattern
                    .regex()
                    .map_err(|_| failure(field, "has an unusable pattern"))?;
                if regex.is_match(text) {
                    Ok(())
                } else {
                    Err(failure(field, "is not in the expected format"))
                }
            }
            Self::All { guards } => guards.iter().try_for_each(|guard| guard.check(payload)),
        }
    }
}

fn failure(field: &str, reason: &str) -> GuardFailure {
    GuardFailure {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => false,
    }
}

fn describe_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("must be between {min} and {max}"),
        (Some(min), None) => format!("must be at least {min}"),
        (None, Some(max)) => format!("must be at most {max}"),
        (None, None) => "must be a number".to_string(),
    }
}
