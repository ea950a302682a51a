//! Field-level payload validation
//!
//! Message types implement [`Validate`] with a [`Validator`] builder. The
//! endpoint consults a shared [`ValidationSwitch`] before running checks, so
//! validation can be turned off at runtime for every endpoint at once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::errors::ErrorKind;

/// Shared on/off switch for payload validation
#[derive(Debug, Clone)]
pub struct ValidationSwitch(Arc<AtomicBool>);

impl Default for ValidationSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ValidationSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A single rule a field can break
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Required,
    MinLength(usize),
    MaxLength(usize),
    Min(i64),
    Max(i64),
    OneOf(&'static [&'static str]),
}

impl Constraint {
    /// Protocol error kind reported for a violation of this rule
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Constraint::Required => ErrorKind::OccurrenceConstraintViolation,
            _ => ErrorKind::PropertyConstraintViolation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Dotted path of the field, e.g. `chargingStation.model`
    pub field: String,
    pub constraint: Constraint,
    /// Offending value, rendered for the error description
    pub actual: Option<String>,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actual = self.actual.as_deref().unwrap_or("");
        match &self.constraint {
            Constraint::Required => write!(f, "Field {} required but not found", self.field),
            Constraint::MinLength(n) => write!(
                f,
                "Field {} must be minimum {} characters long, but was {}",
                self.field, n, actual
            ),
            Constraint::MaxLength(n) => write!(
                f,
                "Field {} must be maximum {} characters long, but was {}",
                self.field, n, actual
            ),
            Constraint::Min(n) => write!(
                f,
                "Field {} must be greater than or equal to {}, but was {}",
                self.field, n, actual
            ),
            Constraint::Max(n) => write!(
                f,
                "Field {} must be less than or equal to {}, but was {}",
                self.field, n, actual
            ),
            Constraint::OneOf(allowed) => write!(
                f,
                "Field {} must be one of [{}], but was {}",
                self.field,
                allowed.join(" "),
                actual
            ),
        }
    }
}

/// Non-empty list of field violations
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationErrors(Vec<FieldViolation>);

impl ValidationErrors {
    pub fn violations(&self) -> &[FieldViolation] {
        &self.0
    }

    pub fn first(&self) -> Option<&FieldViolation> {
        self.0.first()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<FieldViolation>> for ValidationErrors {
    fn from(violations: Vec<FieldViolation>) -> Self {
        Self(violations)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Payload types that carry field constraints
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationErrors>;
}

impl Validate for serde_json::Value {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

impl<T: Validate> Validate for Option<T> {
    fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            Some(inner) => inner.validate(),
            None => Ok(()),
        }
    }
}

/// Collects violations for one payload
///
/// ```
/// use ocppj_core::protocol::Validator;
///
/// let result = Validator::new()
///     .required_str("vendorName", "")
///     .max_len("model", "X1", 20)
///     .finish();
/// assert!(result.is_err());
/// ```
#[derive(Debug, Default)]
pub struct Validator {
    prefix: String,
    violations: Vec<FieldViolation>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    fn path(&self, field: &str) -> String {
        if self.prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", self.prefix, field)
        }
    }

    fn push(&mut self, field: &str, constraint: Constraint, actual: Option<String>) {
        let field = self.path(field);
        self.violations.push(FieldViolation {
            field,
            constraint,
            actual,
        });
    }

    /// Strings must be non-empty
    pub fn required_str(mut self, field: &str, value: &str) -> Self {
        if value.is_empty() {
            self.push(field, Constraint::Required, None);
        }
        self
    }

    pub fn required<T>(mut self, field: &str, value: &Option<T>) -> Self {
        if value.is_none() {
            self.push(field, Constraint::Required, None);
        }
        self
    }

    pub fn min_len(mut self, field: &str, value: &str, min: usize) -> Self {
        let len = value.chars().count();
        if len < min {
            self.push(field, Constraint::MinLength(min), Some(len.to_string()));
        }
        self
    }

    pub fn max_len(mut self, field: &str, value: &str, max: usize) -> Self {
        let len = value.chars().count();
        if len > max {
            self.push(field, Constraint::MaxLength(max), Some(len.to_string()));
        }
        self
    }

    pub fn opt_max_len(self, field: &str, value: &Option<String>, max: usize) -> Self {
        match value {
            Some(v) => self.max_len(field, v, max),
            None => self,
        }
    }

    /// Inclusive numeric range
    pub fn range(mut self, field: &str, value: i64, min: i64, max: i64) -> Self {
        if value < min {
            self.push(field, Constraint::Min(min), Some(value.to_string()));
        } else if value > max {
            self.push(field, Constraint::Max(max), Some(value.to_string()));
        }
        self
    }

    pub fn min(mut self, field: &str, value: i64, min: i64) -> Self {
        if value < min {
            self.push(field, Constraint::Min(min), Some(value.to_string()));
        }
        self
    }

    pub fn one_of(mut self, field: &str, value: &str, allowed: &'static [&'static str]) -> Self {
        if !allowed.contains(&value) {
            self.push(field, Constraint::OneOf(allowed), Some(value.to_string()));
        }
        self
    }

    /// Validate a nested value, prefixing its field paths with `field`
    pub fn nested<T: Validate>(mut self, field: &str, value: &T) -> Self {
        if let Err(errors) = value.validate() {
            let parent = self.path(field);
            for mut violation in errors.0 {
                violation.field = format!("{}.{}", parent, violation.field);
                self.violations.push(violation);
            }
        }
        self
    }

    pub fn finish(self) -> Result<(), ValidationErrors> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(self.violations))
        }
    }
}
