//! Transport adapter capability and registry

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransportResult;
use crate::protocol::{CommandEnvelope, DeliveryToken, DeviceAck};

/// Supported device channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// MQTT via a broker (pub/sub, at-least-once)
    Mqtt,
    /// Bluetooth Low Energy (point-to-point, needs proximity)
    Ble,
    /// HTTP (request/response, device listener)
    Http,
}

impl TransportKind {
    /// All kinds.
    pub const ALL: [TransportKind; 3] = [TransportKind::Mqtt, TransportKind::Ble, TransportKind::Http];

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Mqtt => "mqtt",
            TransportKind::Ble => "ble",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mqtt" => Ok(TransportKind::Mqtt),
            "ble" => Ok(TransportKind::Ble),
            "http" => Ok(TransportKind::Http),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Proof that a command left the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Token to await the ack with
    pub token: DeliveryToken,
    /// Target device
    pub device_id: String,
    /// Channel used
    pub transport: TransportKind,
    /// When the command was handed to the channel
    pub sent_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    /// Receipt for an envelope just sent on `transport`.
    pub fn for_envelope(
        envelope: &CommandEnvelope,
        device_id: impl Into<String>,
        transport: TransportKind,
    ) -> Self {
        Self {
            token: envelope.token,
            device_id: device_id.into(),
            transport,
            sent_at: Utc::now(),
        }
    }
}

/// Capability every device channel provides.
///
/// Implementations never retry on their own; retry and fallback decisions
/// belong to the caller, driven by [`TransportError::class`].
///
/// [`TransportError::class`]: crate::TransportError::class
#[async_trait::async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Which channel this adapter drives.
    fn kind(&self) -> TransportKind;

    /// Hand a command to the channel.
    async fn send(
        &self,
        device_id: &str,
        envelope: &CommandEnvelope,
    ) -> TransportResult<DeliveryReceipt>;

    /// Wait for the device's reply to a previously sent command.
    async fn await_ack(
        &self,
        receipt: &DeliveryReceipt,
        timeout: Duration,
    ) -> TransportResult<DeviceAck>;

    /// Best-effort probe of whether the device can be reached right now.
    async fn is_reachable(&self, device_id: &str) -> bool;
}

/// Adapters available in the running system, keyed by kind.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    adapters: BTreeMap<TransportKind, Arc<dyn TransportAdapter>>,
}

impl TransportRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one of the same kind.
    pub fn register(&mut self, adapter: Arc<dyn TransportAdapter>) -> &mut Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Builder-style registration.
    pub fn with(mut self, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Adapter for a kind, if registered.
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn TransportAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Whether a kind is registered.
    pub fn contains(&self, kind: TransportKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    /// Registered kinds in stable order.
    pub fn kinds(&self) -> Vec<TransportKind> {
        self.adapters.keys().copied().collect()
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    struct NullAdapter(TransportKind);

    #[async_trait::async_trait]
    impl TransportAdapter for NullAdapter {
        fn kind(&self) -> TransportKind {
            self.0
        }

        async fn send(
            &self,
            device_id: &str,
            envelope: &CommandEnvelope,
        ) -> TransportResult<DeliveryReceipt> {
            Ok(DeliveryReceipt::for_envelope(envelope, device_id, self.0))
        }

        async fn await_ack(
            &self,
            _receipt: &DeliveryReceipt,
            timeout: Duration,
        ) -> TransportResult<DeviceAck> {
            Err(TransportError::timeout(timeout))
        }

        async fn is_reachable(&self, _device_id: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("MQTT".parse::<TransportKind>(), Ok(TransportKind::Mqtt));
        assert_eq!("ble".parse::<TransportKind>(), Ok(TransportKind::Ble));
        assert!(matches!("zigbee".parse::<TransportKind>(), Err(e) if e.contains("zigbee")));
    }

    #[test]
    fn test_transport_kind_serde() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_string(&TransportKind::Http)?, "\"http\"");
        let kinds: Vec<TransportKind> = serde_json::from_str(r#"["mqtt","ble"]"#)?;
        assert_eq!(kinds, vec![TransportKind::Mqtt, TransportKind::Ble]);
        Ok(())
    }

    #[test]
    fn test_registry_replaces_same_kind() {
        let registry = TransportRegistry::new()
            .with(Arc::new(NullAdapter(TransportKind::Http)))
            .with(Arc::new(NullAdapter(TransportKind::Http)))
            .with(Arc::new(NullAdapter(TransportKind::Mqtt)));

        assert_eq!(registry.kinds(), vec![TransportKind::Mqtt, TransportKind::Http]);
        assert!(registry.contains(TransportKind::Http));
        assert!(!registry.contains(TransportKind::Ble));
        assert!(registry.get(TransportKind::Ble).is_none());
    }
}
