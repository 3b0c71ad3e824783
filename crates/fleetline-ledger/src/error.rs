//! Error types for ledger operations

use fleetline_errors::FailureClass;
use thiserror::Error;

use crate::model::{DeploymentStatus, VersionId};

/// Result type for ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Errors raised by the configuration ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// No row with this id
    #[error("Configuration version not found: {0}")]
    VersionNotFound(VersionId),

    /// Status change not allowed
    #[error("Version {version} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Row id
        version: VersionId,
        /// Current status
        from: DeploymentStatus,
        /// Requested status
        to: DeploymentStatus,
    },

    /// Another version of the device is already deploying
    #[error("Device {device_id} is already deploying version {version}")]
    AlreadyDeploying {
        /// Device
        device_id: String,
        /// Version number in DEPLOYING
        version: u64,
    },

    /// The device has never had a successful deployment
    #[error("Device {0} has no deployed configuration to roll back to")]
    NoKnownGoodVersion(String),

    /// Two rows passed together belong to different devices
    #[error("Version {version} belongs to device {actual}, not {expected}")]
    DeviceMismatch {
        /// Row id
        version: VersionId,
        /// Expected device
        expected: String,
        /// Owning device
        actual: String,
    },

    /// Device id unusable as a ledger key
    #[error("Invalid device id '{0}'")]
    InvalidDeviceId(String),

    /// IO error during persistence
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    /// Failure class used by the rollout machine.
    pub fn class(&self) -> FailureClass {
        match self {
            LedgerError::NoKnownGoodVersion(_) => FailureClass::RollbackFailure,
            LedgerError::VersionNotFound(_) | LedgerError::Io(_) | LedgerError::Json(_) => {
                FailureClass::Integrity
            }
            LedgerError::InvalidTransition { .. }
            | LedgerError::AlreadyDeploying { .. }
            | LedgerError::DeviceMismatch { .. }
            | LedgerError::InvalidDeviceId(_) => FailureClass::Configuration,
        }
    }
}
