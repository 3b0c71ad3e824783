//! Rollout failure taxonomy.
//!
//! The session machine never inspects concrete error types. It asks the error
//! for its [`FailureClass`] and routes on that: transient channel failures are
//! retried and then fall back to the next transport, protocol rejections fail
//! the stage at once, integrity and rollback failures escalate to an operator.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::severity::ErrorSeverity;

/// Classification of a failure observed while driving a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FailureClass {
    /// Timeout or unreachable channel
    TransientChannel = 0,
    /// Device NACK or checksum mismatch
    ProtocolRejection = 1,
    /// Missing bundle or unverifiable checksum
    Integrity = 2,
    /// Apply, restart or verification failure on the device
    DeviceState = 3,
    /// The rollback path itself failed
    RollbackFailure = 4,
    /// Missing adapter, invalid policy or other setup fault
    Configuration = 5,
    /// Cancelled by an operator or by the session deadline
    Cancelled = 6,
}

impl FailureClass {
    /// Every class, in declaration order.
    pub const ALL: [FailureClass; 7] = [
        FailureClass::TransientChannel,
        FailureClass::ProtocolRejection,
        FailureClass::Integrity,
        FailureClass::DeviceState,
        FailureClass::RollbackFailure,
        FailureClass::Configuration,
        FailureClass::Cancelled,
    ];

    /// Severity to report this class with.
    pub fn severity(self) -> ErrorSeverity {
        match self {
            FailureClass::TransientChannel => ErrorSeverity::Warning,
            FailureClass::Cancelled => ErrorSeverity::Info,
            FailureClass::ProtocolRejection
            | FailureClass::DeviceState
            | FailureClass::Configuration => ErrorSeverity::Error,
            FailureClass::Integrity | FailureClass::RollbackFailure => ErrorSeverity::Critical,
        }
    }

    /// Whether the same operation may be attempted again on the same channel.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::TransientChannel)
    }

    /// Whether the failure may move delivery to the next preferred transport.
    pub fn allows_fallback(self) -> bool {
        matches!(
            self,
            FailureClass::TransientChannel | FailureClass::ProtocolRejection
        )
    }

    /// Whether the failure requires operator intervention and must never be
    /// retried automatically.
    pub fn requires_operator(self) -> bool {
        self.severity().needs_operator()
    }

    /// Stable machine-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::TransientChannel => "transient_channel",
            FailureClass::ProtocolRejection => "protocol_rejection",
            FailureClass::Integrity => "integrity",
            FailureClass::DeviceState => "device_state",
            FailureClass::RollbackFailure => "rollback_failure",
            FailureClass::Configuration => "configuration",
            FailureClass::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_failures_retry() {
        let retryable: Vec<_> = FailureClass::ALL
            .iter()
            .filter(|c| c.is_retryable())
            .collect();
        assert_eq!(retryable, vec![&FailureClass::TransientChannel]);
    }

    #[test]
    fn test_protocol_rejection_falls_back_without_retry() {
        assert!(!FailureClass::ProtocolRejection.is_retryable());
        assert!(FailureClass::ProtocolRejection.allows_fallback());
    }

    #[test]
    fn test_rollback_failure_is_highest_severity() {
        assert_eq!(
            FailureClass::RollbackFailure.severity(),
            ErrorSeverity::Critical
        );
        assert!(FailureClass::RollbackFailure.requires_operator());
        assert!(FailureClass::Integrity.requires_operator());
        assert!(!FailureClass::DeviceState.requires_operator());
    }

    #[test]
    fn test_display_matches_as_str() {
        for class in FailureClass::ALL {
            assert_eq!(class.to_string(), class.as_str());
        }
    }
}
