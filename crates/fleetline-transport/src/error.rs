//! Transport failure kinds

use fleetline_errors::FailureClass;
use thiserror::Error;

use crate::adapter::TransportKind;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failure reported by a transport adapter.
///
/// `Unreachable` and `Timeout` are transient and may be retried; `Rejected`
/// and `ChecksumMismatch` mean the device answered and said no.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Device or channel could not be reached
    #[error("device {device_id} unreachable over {transport}: {reason}")]
    Unreachable {
        /// Channel that failed
        transport: TransportKind,
        /// Target device
        device_id: String,
        /// What went wrong
        reason: String,
    },

    /// No acknowledgment arrived in time
    #[error("no acknowledgment within {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Device refused the command
    #[error("device rejected command: {0}")]
    Rejected(String),

    /// Device computed a different checksum for the delivered payload
    #[error("checksum mismatch: expected {expected}, device reported {actual}")]
    ChecksumMismatch {
        /// Checksum of the source bundle
        expected: String,
        /// Checksum reported by the device
        actual: String,
    },

    /// Command could not be encoded or an ack could not be decoded
    #[error("malformed message: {0}")]
    Malformed(String),

    /// `await_ack` was called for a token this adapter never sent
    #[error("unknown delivery token {0}")]
    UnknownToken(String),
}

impl TransportError {
    /// Build an `Unreachable` error.
    pub fn unreachable(
        transport: TransportKind,
        device_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        TransportError::Unreachable {
            transport,
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }

    /// Build a `Timeout` error from a duration.
    pub fn timeout(after: std::time::Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Failure class used by the rollout machine.
    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::Unreachable { .. } | TransportError::Timeout { .. } => {
                FailureClass::TransientChannel
            }
            TransportError::Rejected(_)
            | TransportError::ChecksumMismatch { .. }
            | TransportError::Malformed(_)
            | TransportError::UnknownToken(_) => FailureClass::ProtocolRejection,
        }
    }

    /// Whether the same command may be sent again on the same channel.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

/// Error raised by the low-level link under an adapter (broker client or
/// BLE central).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The link is down
    #[error("link disconnected")]
    Disconnected,

    /// Connection attempt failed
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Read or write failed
    #[error("link I/O failed: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(TransportError::unreachable(TransportKind::Mqtt, "d1", "broker down").is_retryable());
        assert!(TransportError::timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn test_rejections_are_not_retryable() {
        let rejected = TransportError::Rejected("busy".to_string());
        let mismatch = TransportError::ChecksumMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(!mismatch.is_retryable());
        assert_eq!(mismatch.class(), FailureClass::ProtocolRejection);
    }

    #[test]
    fn test_timeout_message() {
        let err = TransportError::timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "no acknowledgment within 1500ms");
    }
}
