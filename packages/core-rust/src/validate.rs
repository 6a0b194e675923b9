//! Declarative field validation for handler parameters.
//!
//! Parameter types describe their constraints in [`CallParam::validate`]
//! using a [`Validator`]; the executor runs it after decoding and reports
//! any failure as `FAILED_PRECONDITION`.
//!
//! [`CallParam::validate`]: crate::traits::CallParam::validate

use std::fmt;

use regex::Regex;

/// A single failed constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every constraint a parameter value violated, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{}", join(.errors))]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

fn join(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    /// A single-field failure.
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errors: vec![FieldError {
                field: field.into(),
                message: message.into(),
            }],
        }
    }

    #[must_use]
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Collects constraint failures for one value.
///
/// ```
/// use meshcall_core::validate::Validator;
///
/// let name = "";
/// let age = 200;
/// let result = Validator::new()
///     .required("name", name)
///     .range("age", age, 0, 150)
///     .finish();
/// assert_eq!(result.unwrap_err().errors().len(), 2);
/// ```
#[derive(Debug, Default)]
#[must_use]
pub struct Validator {
    errors: Vec<FieldError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, field: &str, message: String) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message,
        });
    }

    /// The string must be non-empty.
    pub fn required(mut self, field: &str, value: &str) -> Self {
        if value.is_empty() {
            self.push(field, "is required".to_string());
        }
        self
    }

    /// The optional value must be present.
    pub fn required_opt<T>(mut self, field: &str, value: Option<&T>) -> Self {
        if value.is_none() {
            self.push(field, "is required".to_string());
        }
        self
    }

    /// The value must lie in `min..=max`.
    pub fn range<T>(mut self, field: &str, value: T, min: T, max: T) -> Self
    where
        T: PartialOrd + fmt::Display,
    {
        if value < min || value > max {
            self.push(field, format!("must be between {min} and {max}"));
        }
        self
    }

    /// The string must have at least `min` characters.
    pub fn min_len(mut self, field: &str, value: &str, min: usize) -> Self {
        if value.chars().count() < min {
            self.push(field, format!("must be at least {min} characters"));
        }
        self
    }

    /// The string must have at most `max` characters.
    pub fn max_len(mut self, field: &str, value: &str, max: usize) -> Self {
        if value.chars().count() > max {
            self.push(field, format!("must be at most {max} characters"));
        }
        self
    }

    /// The value must be one of `allowed`.
    pub fn one_of<T>(mut self, field: &str, value: &T, allowed: &[T]) -> Self
    where
        T: PartialEq + fmt::Debug,
    {
        if !allowed.contains(value) {
            self.push(field, format!("must be one of {allowed:?}"));
        }
        self
    }

    /// The string must match `pattern`. Empty strings pass; pair with
    /// [`Validator::required`] when the field is mandatory.
    pub fn matches(mut self, field: &str, value: &str, pattern: &Regex) -> Self {
        if !value.is_empty() && !pattern.is_match(value) {
            self.push(field, format!("must match {}", pattern.as_str()));
        }
        self
    }

    /// Arbitrary predicate with a custom message.
    pub fn check(mut self, field: &str, ok: bool, message: &str) -> Self {
        if !ok {
            self.push(field, message.to_string());
        }
        self
    }

    /// Ends validation.
    ///
    /// # Errors
    ///
    /// Returns every collected failure when at least one constraint failed.
    pub fn finish(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors {
                errors: self.errors,
            })
        }
    }
}
