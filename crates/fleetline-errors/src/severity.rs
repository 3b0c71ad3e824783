//! How loudly a failure should be reported.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Reporting level of a rollout failure, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Nothing on the device changed
    Info,
    /// A channel misbehaved but another attempt may succeed
    Warning,
    /// The rollout failed and the device was left in a known state
    Error,
    /// The device state is unknown and needs an operator
    Critical,
}

impl ErrorSeverity {
    /// Label used in logs and human output.
    pub const fn label(self) -> &'static str {
        match self {
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Warning => "WARN",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }

    /// Whether an operator has to look at the device.
    pub fn needs_operator(self) -> bool {
        self == ErrorSeverity::Critical
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
