//! Wire protocol spoken with the on-device update agent.
//!
//! Commands and acknowledgments are JSON envelopes correlated by a
//! [`DeliveryToken`]. Each adapter carries the same envelopes over its own
//! channel, so the device agent is transport-agnostic too.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};

/// Correlates one command with its acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryToken(Uuid);

impl DeliveryToken {
    /// Fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What kind of bundle a session is delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Firmware image
    Firmware,
    /// Configuration bundle
    Configuration,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKind::Firmware => write!(f, "firmware"),
            UpdateKind::Configuration => write!(f, "configuration"),
        }
    }
}

/// Command sent to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceCommand {
    /// Announce an incoming bundle; the device answers `Ready`.
    Prepare {
        /// Bundle kind
        update: UpdateKind,
        /// Version label the bundle carries
        version: String,
        /// Bundle size in bytes
        total_size: u64,
        /// Number of chunks that follow
        total_chunks: u32,
        /// sha256 of the whole bundle
        checksum: String,
    },
    /// One slice of the bundle; the device answers `ChunkReceived`.
    Chunk {
        /// Zero-based chunk index
        index: u32,
        /// Chunk bytes, base64 on the wire
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// sha256 of this chunk
        checksum: String,
    },
    /// All chunks sent; the device answers `TransferComplete` with its own
    /// checksum of the reassembled bundle.
    Finalize {
        /// Expected bundle checksum
        checksum: String,
    },
    /// Verify the staged bundle without applying it.
    Validate {
        /// Expected bundle checksum
        checksum: String,
    },
    /// Apply the staged bundle.
    Apply,
    /// Reboot or reload; the device answers `Announced` once it is back.
    Restart,
    /// Report running version and health.
    Verify {
        /// Version the device should now be running
        expected_version: String,
    },
}

impl DeviceCommand {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::Prepare { .. } => "prepare",
            DeviceCommand::Chunk { .. } => "chunk",
            DeviceCommand::Finalize { .. } => "finalize",
            DeviceCommand::Validate { .. } => "validate",
            DeviceCommand::Apply => "apply",
            DeviceCommand::Restart => "restart",
            DeviceCommand::Verify { .. } => "verify",
        }
    }

    /// What a well-formed reply to this command must satisfy.
    pub fn expectation(&self) -> Expectation {
        match self {
            DeviceCommand::Chunk { index, .. } => Expectation::Chunk(*index),
            DeviceCommand::Finalize { checksum } => Expectation::Checksum(checksum.clone()),
            _ => Expectation::Any,
        }
    }
}

/// Acknowledgment sent back by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceAck {
    /// Ready to receive chunks
    Ready,
    /// Chunk stored
    ChunkReceived {
        /// Index of the stored chunk
        index: u32,
    },
    /// Bundle reassembled
    TransferComplete {
        /// Device-computed checksum
        checksum: String,
    },
    /// Staged bundle passed validation
    Validated,
    /// Staged bundle failed validation; nothing was applied
    ValidationFailed {
        /// Device-supplied reason
        reason: String,
    },
    /// Bundle applied
    Applied,
    /// Apply failed part way
    ApplyFailed {
        /// Device-supplied reason
        reason: String,
    },
    /// Device is back after a restart
    Announced {
        /// Running firmware version
        #[serde(default)]
        firmware_version: Option<String>,
        /// Running configuration version
        #[serde(default)]
        configuration_version: Option<u64>,
    },
    /// Health report
    Health {
        /// Version the device reports running
        version: String,
        /// Whether the device considers itself healthy
        healthy: bool,
        /// Optional explanation
        #[serde(default)]
        detail: Option<String>,
    },
    /// Command refused
    Nack {
        /// Device-supplied reason
        reason: String,
    },
}

/// Constraint a reply must meet before an adapter hands it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// Any non-NACK reply
    Any,
    /// `ChunkReceived` for this index
    Chunk(u32),
    /// `TransferComplete` with this checksum
    Checksum(String),
}

impl Expectation {
    /// Turn a raw ack into a result, surfacing NACKs and checksum mismatches
    /// as errors.
    pub fn check(&self, ack: DeviceAck) -> TransportResult<DeviceAck> {
        if let DeviceAck::Nack { reason } = ack {
            return Err(TransportError::Rejected(reason));
        }

        let mismatch = match (self, &ack) {
            (Expectation::Chunk(expected), DeviceAck::ChunkReceived { index })
                if index != expected =>
            {
                Some(TransportError::Rejected(format!(
                    "acknowledged chunk {index}, expected {expected}"
                )))
            }
            (Expectation::Checksum(expected), DeviceAck::TransferComplete { checksum })
                if !checksum.eq_ignore_ascii_case(expected) =>
            {
                Some(TransportError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: checksum.clone(),
                })
            }
            _ => None,
        };

        match mismatch {
            Some(err) => Err(err),
            None => Ok(ack),
        }
    }
}

/// Command plus correlation data, as carried on every channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Correlation token
    pub token: DeliveryToken,
    /// Owning rollout session
    pub session_id: String,
    /// Creation time
    pub sent_at: DateTime<Utc>,
    /// The command
    pub command: DeviceCommand,
}

impl CommandEnvelope {
    /// Wrap a command with a fresh token.
    pub fn new(session_id: impl Into<String>, command: DeviceCommand) -> Self {
        Self {
            token: DeliveryToken::new(),
            session_id: session_id.into(),
            sent_at: Utc::now(),
            command,
        }
    }

    /// Serialize to JSON bytes.
    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    /// Parse from JSON bytes.
    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// Acknowledgment plus correlation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEnvelope {
    /// Token of the command being acknowledged
    pub token: DeliveryToken,
    /// The ack
    pub ack: DeviceAck,
}

impl AckEnvelope {
    /// Serialize to JSON bytes.
    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    /// Parse from JSON bytes.
    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// Longest a single ack wait may run; longer timeouts are clamped to it.
pub const MAX_ACK_WAIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Instant at which an ack wait starting now gives up.
pub fn ack_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(MAX_ACK_WAIT)).unwrap_or(now)
}

/// Tokens sent by an adapter that still await an ack.
#[derive(Debug, Default)]
pub struct PendingAcks {
    inner: Mutex<HashMap<DeliveryToken, Expectation>>,
}

impl PendingAcks {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent command.
    pub fn insert(&self, token: DeliveryToken, command: &DeviceCommand) {
        self.inner.lock().insert(token, command.expectation());
    }

    /// Remove and return the expectation for a token.
    pub fn take(&self, token: &DeliveryToken) -> TransportResult<Expectation> {
        self.inner
            .lock()
            .remove(token)
            .ok_or_else(|| TransportError::UnknownToken(token.to_string()))
    }

    /// Whether a token is still outstanding.
    pub fn contains(&self, token: &DeliveryToken) -> bool {
        self.inner.lock().contains_key(token)
    }

    /// Number of outstanding commands.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Lowercase hex sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Number of chunks needed to carry `total` bytes.
pub fn chunk_count(total: usize, chunk_size: usize) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    u32::try_from(total.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ack_deadline_clamps_huge_timeouts() {
        let start = Instant::now();
        assert_eq!(ack_deadline(Duration::MAX), start + MAX_ACK_WAIT);
        assert_eq!(
            ack_deadline(Duration::from_secs(30)),
            start + Duration::from_secs(30)
        );
    }

    #[test]
    fn test_chunk_data_travels_as_base64() -> TransportResult<()> {
        let envelope = CommandEnvelope::new(
            "s-1",
            DeviceCommand::Chunk {
                index: 0,
                data: b"hello".to_vec(),
                checksum: sha256_hex(b"hello"),
            },
        );
        let bytes = envelope.encode()?;
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("\"aGVsbG8=\""));
        assert!(text.contains("\"type\":\"chunk\""));
        assert_eq!(CommandEnvelope::decode(&bytes)?, envelope);
        Ok(())
    }

    #[test]
    fn test_nack_becomes_rejected() {
        let result = Expectation::Any.check(DeviceAck::Nack {
            reason: "low battery".to_string(),
        });
        assert_eq!(result, Err(TransportError::Rejected("low battery".to_string())));
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let result = Expectation::Checksum("abc".to_string()).check(DeviceAck::TransferComplete {
            checksum: "def".to_string(),
        });
        assert!(matches!(result, Err(TransportError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_checksum_comparison_ignores_case() {
        let result = Expectation::Checksum("ABC".to_string()).check(DeviceAck::TransferComplete {
            checksum: "abc".to_string(),
        });
        assert!(matches!(result, Ok(DeviceAck::TransferComplete { .. })));
    }

    #[test]
    fn test_wrong_chunk_index_rejected() {
        let result = Expectation::Chunk(3).check(DeviceAck::ChunkReceived { index: 2 });
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[test]
    fn test_pending_acks_take_once() {
        let pending = PendingAcks::new();
        let token = DeliveryToken::new();
        pending.insert(token, &DeviceCommand::Apply);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.take(&token), Ok(Expectation::Any));
        assert!(matches!(pending.take(&token), Err(TransportError::UnknownToken(_))));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 4096), 0);
        assert_eq!(chunk_count(1, 4096), 1);
        assert_eq!(chunk_count(4096, 4096), 1);
        assert_eq!(chunk_count(4097, 4096), 2);
        assert_eq!(chunk_count(10, 0), 0);
    }

    #[test]
    fn test_ack_wire_format() -> TransportResult<()> {
        let bytes = br#"{"token":"6f9619ff-8b86-d011-b42d-00cf4fc964ff","ack":{"type":"announced","firmware_version":"2.1.0"}}"#;
        let envelope = AckEnvelope::decode(bytes)?;
        assert_eq!(
            envelope.ack,
            DeviceAck::Announced {
                firmware_version: Some("2.1.0".to_string()),
                configuration_version: None,
            }
        );
        Ok(())
    }
}
