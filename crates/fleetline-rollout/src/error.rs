//! Error types for rollout orchestration

use fleetline_errors::FailureClass;
use fleetline_ledger::{DeploymentStatus, LedgerError, VersionId};
use fleetline_transport::TransportKind;
use thiserror::Error;

use crate::model::{FirmwareId, UpdateType};

/// Result type for rollout operations
pub type RolloutResult<T> = std::result::Result<T, RolloutError>;

/// Errors raised before a session starts
#[derive(Error, Debug)]
pub enum RolloutError {
    /// Device not known to the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Firmware record not in the catalog
    #[error("Firmware not found: {0}")]
    FirmwareNotFound(FirmwareId),

    /// Configuration row not in the ledger
    #[error("Configuration version not found: {0}")]
    ConfigurationNotFound(VersionId),

    /// Requested update type disagrees with the bundle reference
    #[error("Requested a {requested} update with a {bundle} bundle")]
    UpdateTypeMismatch {
        /// Requested type
        requested: UpdateType,
        /// Type implied by the bundle
        bundle: UpdateType,
    },

    /// Firmware built for another hardware family
    #[error("Firmware for '{firmware_type}' cannot be installed on '{device_type}'")]
    IncompatibleFirmware {
        /// Firmware target
        firmware_type: String,
        /// Device hardware family
        device_type: String,
    },

    /// Non-production firmware refused by policy
    #[error("Firmware {0} is not marked for production")]
    NotProductionFirmware(FirmwareId),

    /// Configuration row belongs to another device
    #[error("Configuration version {version} belongs to device {owner}")]
    ConfigurationDeviceMismatch {
        /// Row version number
        version: u64,
        /// Owning device
        owner: String,
    },

    /// Configuration row is not waiting to be deployed
    #[error("Configuration version {version} is {status}, expected PENDING")]
    ConfigurationNotPending {
        /// Row version number
        version: u64,
        /// Current status
        status: DeploymentStatus,
    },

    /// Device registry lookup failed
    #[error("Device registry error: {0}")]
    Registry(String),

    /// Supervisor no longer accepts sessions
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Bundle store error
    #[error("Bundle store error: {0}")]
    Store(#[from] StoreError),

    /// Transport resolution error
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl RolloutError {
    /// Failure class reported for a rejected start request.
    pub fn class(&self) -> FailureClass {
        match self {
            RolloutError::Ledger(e) => e.class(),
            RolloutError::Store(e) => e.class(),
            RolloutError::Resolve(_)
            | RolloutError::DeviceNotFound(_)
            | RolloutError::FirmwareNotFound(_)
            | RolloutError::ConfigurationNotFound(_)
            | RolloutError::UpdateTypeMismatch { .. }
            | RolloutError::IncompatibleFirmware { .. }
            | RolloutError::NotProductionFirmware(_)
            | RolloutError::ConfigurationDeviceMismatch { .. }
            | RolloutError::ConfigurationNotPending { .. }
            | RolloutError::Registry(_)
            | RolloutError::ShuttingDown => FailureClass::Configuration,
        }
    }
}

/// Errors raised by a bundle store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Stored bytes no longer hash to their key
    #[error("Bundle {expected} is corrupt (hashes to {actual})")]
    Corrupt {
        /// Key the bundle was stored under
        expected: String,
        /// Hash of the bytes found
        actual: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Index serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Every store failure is an integrity fault.
    pub fn class(&self) -> FailureClass {
        FailureClass::Integrity
    }
}

/// Errors raised while resolving a device's transports
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Preference lists no channels
    #[error("Device {0} has an empty channel preference")]
    NoChannels(String),

    /// Preference names a transport with no registered adapter
    #[error("Device {device_id} prefers {transport}, which has no registered adapter")]
    UnregisteredTransport {
        /// Device
        device_id: String,
        /// Missing transport
        transport: TransportKind,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preflight_errors_are_configuration_faults() {
        let err = RolloutError::DeviceNotFound("d".to_string());
        assert_eq!(err.class(), FailureClass::Configuration);

        let err = RolloutError::from(ResolveError::NoChannels("d".to_string()));
        assert_eq!(err.class(), FailureClass::Configuration);
    }

    #[test]
    fn test_store_errors_are_integrity_faults() {
        let err = RolloutError::from(StoreError::Corrupt {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        });
        assert_eq!(err.class(), FailureClass::Integrity);
        assert!(err.to_string().contains("corrupt"));
    }
}
