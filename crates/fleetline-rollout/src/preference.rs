//! Communication preferences and transport resolution
//!
//! A device's preference names its channels in priority order along with the
//! retry policy applied to each of them. Resolution turns that into concrete
//! adapters; a device without a stored preference falls back to the system
//! default of a single HTTP channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleetline_errors::ValidationError;
use fleetline_transport::{TransportAdapter, TransportKind, TransportRegistry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ResolveError;

/// Retry behaviour for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed wait between attempts
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
    /// How long to wait for a device reply
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
}

impl RetryPolicy {
    /// Total attempts allowed on one channel.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    /// System default used for devices without a stored preference.
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Broker settings for the MQTT channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttChannelConfig {
    /// Broker URL
    pub broker_url: String,
    /// Client id to connect with
    #[serde(default)]
    pub client_id: Option<String>,
    /// Broker user
    #[serde(default)]
    pub username: Option<String>,
    /// Connect over TLS
    #[serde(default)]
    pub use_tls: bool,
}

/// Peripheral settings for the BLE channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BleChannelConfig {
    /// Advertised name to scan for
    #[serde(default)]
    pub advertising_name: Option<String>,
    /// Reconnect automatically after a drop
    #[serde(default)]
    pub auto_reconnect: bool,
}

/// Endpoint settings for the HTTP channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpChannelConfig {
    /// Device agent base URL
    pub base_url: String,
    /// Bearer token
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Ack polling interval override
    #[serde(default, with = "duration_ms::option")]
    pub polling_interval: Option<Duration>,
}

/// A device's stored communication preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationPreference {
    /// Device the preference belongs to; may be omitted where the owning
    /// device is implied by context
    #[serde(default)]
    pub device_id: String,
    /// Channels in priority order
    pub preferred_channels: Vec<TransportKind>,
    /// MQTT settings
    #[serde(default)]
    pub mqtt: Option<MqttChannelConfig>,
    /// BLE settings
    #[serde(default)]
    pub ble: Option<BleChannelConfig>,
    /// HTTP settings
    #[serde(default)]
    pub http: Option<HttpChannelConfig>,
    /// Reply timeout per command
    #[serde(default = "default_connection_timeout", with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wait between attempts
    #[serde(default = "default_retry_interval", with = "duration_ms")]
    pub retry_interval: Duration,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(60)
}

impl CommunicationPreference {
    /// Preference with record defaults: 30 s timeout, 5 retries, 60 s apart.
    pub fn new(device_id: impl Into<String>, channels: Vec<TransportKind>) -> Self {
        Self {
            device_id: device_id.into(),
            preferred_channels: channels,
            mqtt: None,
            ble: None,
            http: None,
            connection_timeout: default_connection_timeout(),
            max_retries: default_max_retries(),
            retry_interval: default_retry_interval(),
        }
    }

    /// Set the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.max_retries = policy.max_retries;
        self.retry_interval = policy.retry_interval;
        self.connection_timeout = policy.connection_timeout;
        self
    }

    /// Attach MQTT settings.
    pub fn with_mqtt(mut self, config: MqttChannelConfig) -> Self {
        self.mqtt = Some(config);
        self
    }

    /// Attach BLE settings.
    pub fn with_ble(mut self, config: BleChannelConfig) -> Self {
        self.ble = Some(config);
        self
    }

    /// Attach HTTP settings.
    pub fn with_http(mut self, config: HttpChannelConfig) -> Self {
        self.http = Some(config);
        self
    }

    /// Retry policy applied to every listed channel.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_interval: self.retry_interval,
            connection_timeout: self.connection_timeout,
        }
    }

    /// Check the preference is usable.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.device_id.trim().is_empty() {
            errors.push(ValidationError::missing("deviceId"));
        }
        if self.preferred_channels.is_empty() {
            errors.push(ValidationError::missing("preferredChannels"));
        }
        for (i, kind) in self.preferred_channels.iter().enumerate() {
            if self.preferred_channels.iter().take(i).any(|k| k == kind) {
                errors.push(ValidationError::duplicate("preferredChannels", kind.as_str()));
            }
        }
        if self.retry_interval.is_zero() {
            errors.push(ValidationError::not_positive("retryInterval"));
        }
        if self.connection_timeout.is_zero() {
            errors.push(ValidationError::not_positive("connectionTimeout"));
        }
        if let Some(http) = &self.http
            && http.base_url.trim().is_empty()
        {
            errors.push(ValidationError::missing("http.baseUrl"));
        }
        if let Some(mqtt) = &self.mqtt
            && mqtt.broker_url.trim().is_empty()
        {
            errors.push(ValidationError::missing("mqtt.brokerUrl"));
        }
        errors
    }
}

/// A channel ready for use, with the policy that governs it.
#[derive(Clone)]
pub struct ResolvedTransport {
    /// Channel kind
    pub kind: TransportKind,
    /// Adapter to drive it
    pub adapter: Arc<dyn TransportAdapter>,
    /// Retry policy
    pub policy: RetryPolicy,
}

impl fmt::Debug for ResolvedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTransport")
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Default applied to devices without a stored preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultPreference {
    /// Channels in priority order
    pub channels: Vec<TransportKind>,
    /// Policy for each channel
    pub policy: RetryPolicy,
}

impl Default for DefaultPreference {
    fn default() -> Self {
        Self {
            channels: vec![TransportKind::Http],
            policy: RetryPolicy::default(),
        }
    }
}

/// Resolves a device's ordered channel list against the registered adapters.
pub struct PreferenceResolver {
    registry: TransportRegistry,
    preferences: RwLock<HashMap<String, CommunicationPreference>>,
    default: DefaultPreference,
}

impl PreferenceResolver {
    /// Resolver over `registry` with the system default.
    pub fn new(registry: TransportRegistry) -> Self {
        Self::with_default(registry, DefaultPreference::default())
    }

    /// Resolver with a custom default.
    pub fn with_default(registry: TransportRegistry, default: DefaultPreference) -> Self {
        Self {
            registry,
            preferences: RwLock::new(HashMap::new()),
            default,
        }
    }

    /// Store a device's preference, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns the validation errors if the preference is unusable.
    pub fn set_preference(
        &self,
        preference: CommunicationPreference,
    ) -> Result<(), Vec<ValidationError>> {
        let errors = preference.validate();
        if !errors.is_empty() {
            return Err(errors);
        }
        debug!(
            device_id = %preference.device_id,
            channels = ?preference.preferred_channels,
            "Stored communication preference"
        );
        self.preferences
            .write()
            .insert(preference.device_id.clone(), preference);
        Ok(())
    }

    /// Drop a device's preference; it reverts to the default.
    pub fn remove_preference(&self, device_id: &str) -> Option<CommunicationPreference> {
        self.preferences.write().remove(device_id)
    }

    /// A device's stored preference.
    pub fn preference(&self, device_id: &str) -> Option<CommunicationPreference> {
        self.preferences.read().get(device_id).cloned()
    }

    /// Ordered channels for a device, each with its policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty or names a transport with no
    /// registered adapter.
    pub fn resolve(&self, device_id: &str) -> Result<Vec<ResolvedTransport>, ResolveError> {
        let (channels, policy) = match self.preferences.read().get(device_id) {
            Some(pref) => (pref.preferred_channels.clone(), pref.policy()),
            None => (self.default.channels.clone(), self.default.policy),
        };

        if channels.is_empty() {
            return Err(ResolveError::NoChannels(device_id.to_string()));
        }

        let mut resolved: Vec<ResolvedTransport> = Vec::with_capacity(channels.len());
        for kind in channels {
            if resolved.iter().any(|r| r.kind == kind) {
                continue;
            }
            let adapter =
                self.registry
                    .get(kind)
                    .ok_or_else(|| ResolveError::UnregisteredTransport {
                        device_id: device_id.to_string(),
                        transport: kind,
                    })?;
            resolved.push(ResolvedTransport {
                kind,
                adapter,
                policy,
            });
        }
        Ok(resolved)
    }

    /// Registered adapters.
    pub fn registry(&self) -> &TransportRegistry {
        &self.registry
    }
}

/// Millisecond serde for `Duration`.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetline_errors::Problem;
    use fleetline_transport::{
        CommandEnvelope, DeliveryReceipt, DeviceAck, TransportError, TransportResult,
    };

    struct Stub(TransportKind);

    #[async_trait::async_trait]
    impl TransportAdapter for Stub {
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
            true
        }
    }

    fn registry(kinds: &[TransportKind]) -> TransportRegistry {
        kinds
            .iter()
            .fold(TransportRegistry::new(), |r, k| r.with(Arc::new(Stub(*k))))
    }

    #[test]
    fn test_missing_preference_uses_system_default() -> Result<(), ResolveError> {
        let resolver = PreferenceResolver::new(registry(&[TransportKind::Http]));
        let resolved = resolver.resolve("dev-1")?;

        assert_eq!(resolved.len(), 1);
        let first = resolved.first().map(|r| (r.kind, r.policy));
        assert_eq!(first, Some((TransportKind::Http, RetryPolicy::default())));
        assert_eq!(RetryPolicy::default().max_retries, 3);
        assert_eq!(RetryPolicy::default().retry_interval, Duration::from_secs(60));
        Ok(())
    }

    #[test]
    fn test_preference_order_is_kept() -> anyhow::Result<()> {
        let resolver = PreferenceResolver::new(registry(&TransportKind::ALL));
        let pref = CommunicationPreference::new(
            "dev-1",
            vec![TransportKind::Mqtt, TransportKind::Ble, TransportKind::Http],
        );
        resolver
            .set_preference(pref)
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;

        let kinds: Vec<_> = resolver.resolve("dev-1")?.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [TransportKind::Mqtt, TransportKind::Ble, TransportKind::Http]
        );
        Ok(())
    }

    #[test]
    fn test_unregistered_transport_is_a_configuration_fault() {
        let resolver = PreferenceResolver::new(registry(&[TransportKind::Http]));
        let pref = CommunicationPreference::new("dev-1", vec![TransportKind::Ble]);
        assert_eq!(resolver.set_preference(pref), Ok(()));

        assert_eq!(
            resolver.resolve("dev-1").map(|r| r.len()),
            Err(ResolveError::UnregisteredTransport {
                device_id: "dev-1".to_string(),
                transport: TransportKind::Ble,
            })
        );
    }

    #[test]
    fn test_empty_default_has_no_channels() {
        let resolver = PreferenceResolver::with_default(
            registry(&[TransportKind::Http]),
            DefaultPreference {
                channels: Vec::new(),
                policy: RetryPolicy::default(),
            },
        );
        assert!(matches!(
            resolver.resolve("dev-1"),
            Err(ResolveError::NoChannels(_))
        ));
    }

    #[test]
    fn test_invalid_preferences_are_refused() {
        let resolver = PreferenceResolver::new(registry(&[TransportKind::Http]));
        let empty = CommunicationPreference::new("dev-1", Vec::new());
        assert_eq!(
            resolver.set_preference(empty),
            Err(vec![ValidationError::missing("preferredChannels")])
        );

        let dup = CommunicationPreference::new(
            "dev-1",
            vec![TransportKind::Http, TransportKind::Http],
        );
        let errors = dup.validate();
        assert!(matches!(
            errors.as_slice(),
            [ValidationError {
                problem: Problem::Duplicate(_),
                ..
            }]
        ));
    }

    #[test]
    fn test_preference_wire_form() -> Result<(), serde_json::Error> {
        let pref: CommunicationPreference = serde_json::from_str(
            r#"{
                "deviceId": "dev-1",
                "preferredChannels": ["mqtt", "http"],
                "http": {"baseUrl": "http://10.0.0.5:8080", "pollingInterval": 500},
                "retryInterval": 1000
            }"#,
        )?;

        assert_eq!(pref.max_retries, 5);
        assert_eq!(pref.connection_timeout, Duration::from_secs(30));
        assert_eq!(pref.retry_interval, Duration::from_secs(1));
        assert_eq!(
            pref.http.and_then(|h| h.polling_interval),
            Some(Duration::from_millis(500))
        );
        Ok(())
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_stored_preference_is_logged() {
        let resolver = PreferenceResolver::new(TransportRegistry::new());
        let stored = resolver.set_preference(CommunicationPreference::new(
            "dev-7",
            vec![TransportKind::Ble],
        ));
        assert_eq!(stored, Ok(()));
        assert!(logs_contain("Stored communication preference"));
        assert!(logs_contain("dev-7"));
    }
}
