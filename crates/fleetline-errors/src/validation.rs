//! Validation of operator-supplied settings.
//!
//! A [`ValidationError`] pairs the dotted path of the offending setting
//! (`supervisor.chunk_size`, `http.baseUrl`) with the [`Problem`] found there.
//! Validators collect every problem instead of stopping at the first one.

use core::fmt;

/// What is wrong with a setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// Absent or blank
    Missing,
    /// A list names the same entry twice
    Duplicate(String),
    /// A count or duration of zero
    NotPositive,
    /// Points at an entry that is not defined
    Dangling {
        /// Entry holding the reference
        owner: String,
        /// The undefined target
        target: String,
    },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::Missing => f.write_str("is required"),
            Problem::Duplicate(value) => write!(f, "lists '{value}' more than once"),
            Problem::NotPositive => f.write_str("must be greater than zero"),
            Problem::Dangling { owner, target } => {
                write!(f, "of {owner} names {target}, which is not defined")
            }
        }
    }
}

/// A problem found at one setting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field} {problem}")]
pub struct ValidationError {
    /// Dotted path of the setting
    pub field: String,
    /// What is wrong with it
    pub problem: Problem,
}

impl ValidationError {
    /// Setting is absent or blank.
    pub fn missing(field: impl Into<String>) -> Self {
        Self::at(field, Problem::Missing)
    }

    /// List setting repeats `value`.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::at(field, Problem::Duplicate(value.into()))
    }

    /// Count or duration setting is zero.
    pub fn not_positive(field: impl Into<String>) -> Self {
        Self::at(field, Problem::NotPositive)
    }

    /// `owner` refers to `target` through `field`, and `target` does not exist.
    pub fn dangling(
        field: impl Into<String>,
        owner: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::at(
            field,
            Problem::Dangling {
                owner: owner.into(),
                target: target.into(),
            },
        )
    }

    fn at(field: impl Into<String>, problem: Problem) -> Self {
        Self {
            field: field.into(),
            problem,
        }
    }

    /// Same problem, reported under `prefix`.
    ///
    /// Used when a nested value such as a device's preference is validated on
    /// its own and then reported as part of the enclosing document.
    #[must_use]
    pub fn nested_under(mut self, prefix: &str) -> Self {
        self.field = format!("{prefix}.{}", self.field);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_leads_with_field() {
        let err = ValidationError::not_positive("supervisor.chunk_size");
        assert_eq!(
            err.to_string(),
            "supervisor.chunk_size must be greater than zero"
        );
    }

    #[test]
    fn test_duplicate_names_value() {
        let err = ValidationError::duplicate("preferredChannels", "mqtt");
        assert_eq!(err.problem, Problem::Duplicate("mqtt".to_string()));
        assert!(err.to_string().ends_with("lists 'mqtt' more than once"));
    }

    #[test]
    fn test_nested_under_prefixes_path() {
        let err = ValidationError::missing("http.baseUrl").nested_under("devices[thermo-01]");
        assert_eq!(err.field, "devices[thermo-01].http.baseUrl");
        assert_eq!(err.to_string(), "devices[thermo-01].http.baseUrl is required");
    }
}
