//! Error types for fleetlined

use fleetline_rollout::{RolloutError, SessionState};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by fleetlined commands.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Unknown device
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Unknown ledger row
    #[error("Configuration version not found: {0}")]
    VersionNotFound(String),

    /// Bad command input
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A rollout ran but did not complete
    #[error("Rollout ended in {state}: {detail}")]
    RolloutEnded {
        /// Terminal state
        state: SessionState,
        /// Failure text
        detail: String,
    },

    /// Unusable configuration file
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// File access
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed JSON input
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Malformed YAML input
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl ServiceError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ServiceError::DeviceNotFound(_) => 2,
            ServiceError::VersionNotFound(_) => 3,
            ServiceError::ValidationError(_)
            | ServiceError::Config(_)
            | ServiceError::JsonError(_)
            | ServiceError::YamlError(_) => 4,
            ServiceError::RolloutEnded { state, .. } => match state {
                SessionState::RolledBack => 6,
                SessionState::CriticalFailure => 7,
                _ => 5,
            },
            ServiceError::IoError(_) => 1,
        }
    }
}

/// Exit code for any error surfaced by a command.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(e) = error.downcast_ref::<ServiceError>() {
        return e.exit_code();
    }
    if error.downcast_ref::<ConfigError>().is_some() {
        return 4;
    }
    match error.downcast_ref::<RolloutError>() {
        Some(RolloutError::DeviceNotFound(_)) => 2,
        Some(RolloutError::ConfigurationNotFound(_)) => 3,
        Some(_) => 4,
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_outcome() {
        let ended = |state| ServiceError::RolloutEnded {
            state,
            detail: String::new(),
        };
        assert_eq!(ended(SessionState::Failed).exit_code(), 5);
        assert_eq!(ended(SessionState::RolledBack).exit_code(), 6);
        assert_eq!(ended(SessionState::CriticalFailure).exit_code(), 7);
    }

    #[test]
    fn test_exit_code_sees_through_anyhow() {
        let refused = anyhow::Error::new(RolloutError::DeviceNotFound("d".to_string()));
        assert_eq!(exit_code(&refused), 2);

        let invalid = anyhow::Error::new(ServiceError::Config(ConfigError::Invalid(Vec::new())));
        assert_eq!(exit_code(&invalid), 4);

        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
