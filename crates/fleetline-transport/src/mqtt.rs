//! MQTT transport.
//!
//! Commands are published to `{prefix}/{device}/ota/cmd`; the device agent
//! publishes acks to `{prefix}/{device}/ota/ack` and keeps a retained
//! `online`/`offline` presence message on `{prefix}/{device}/presence`.
//! The broker delivers at-least-once, so the same ack may show up more than
//! once; duplicates are dropped by token.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapter::{DeliveryReceipt, TransportAdapter, TransportKind};
use crate::error::{LinkError, TransportError, TransportResult};
use crate::protocol::{
    AckEnvelope, CommandEnvelope, DeliveryToken, DeviceAck, Expectation, PendingAcks, ack_deadline,
};

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    /// Fire and forget
    AtMostOnce,
    /// Delivered one or more times
    AtLeastOnce,
    /// Delivered exactly once
    ExactlyOnce,
}

/// Minimal broker client the adapter needs.
#[async_trait::async_trait]
pub trait MqttClient: Send + Sync {
    /// Whether the broker session is up.
    fn is_connected(&self) -> bool;

    /// Publish a message.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), LinkError>;

    /// Next message on a subscribed topic, or `None` when `timeout` elapses.
    async fn next_message(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, LinkError>;

    /// Retained message on a topic, if any.
    async fn retained(&self, topic: &str) -> Option<Vec<u8>>;
}

/// MQTT adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttTransportConfig {
    /// Topic prefix
    pub topic_prefix: String,
    /// QoS for command publishes
    pub qos: QoS,
    /// How many delivered tokens to remember for duplicate suppression
    pub dedupe_window: usize,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "fleet".to_string(),
            qos: QoS::AtLeastOnce,
            dedupe_window: 256,
        }
    }
}

impl MqttTransportConfig {
    /// Set the topic prefix
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Set the command QoS
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}

/// Transport adapter over an MQTT broker.
pub struct MqttTransport {
    client: Arc<dyn MqttClient>,
    config: MqttTransportConfig,
    pending: PendingAcks,
    early: Mutex<HashMap<DeliveryToken, DeviceAck>>,
    delivered: Mutex<VecDeque<DeliveryToken>>,
}

impl MqttTransport {
    /// Create an adapter on top of a connected client.
    pub fn new(client: Arc<dyn MqttClient>, config: MqttTransportConfig) -> Self {
        Self {
            client,
            config,
            pending: PendingAcks::new(),
            early: Mutex::new(HashMap::new()),
            delivered: Mutex::new(VecDeque::new()),
        }
    }

    /// Topic commands for `device_id` are published to.
    pub fn command_topic(&self, device_id: &str) -> String {
        format!("{}/{}/ota/cmd", self.config.topic_prefix, device_id)
    }

    /// Topic acks from `device_id` arrive on.
    pub fn ack_topic(&self, device_id: &str) -> String {
        format!("{}/{}/ota/ack", self.config.topic_prefix, device_id)
    }

    /// Retained presence topic for `device_id`.
    pub fn presence_topic(&self, device_id: &str) -> String {
        format!("{}/{}/presence", self.config.topic_prefix, device_id)
    }

    fn already_delivered(&self, token: &DeliveryToken) -> bool {
        self.delivered.lock().contains(token)
    }

    fn deliver(
        &self,
        token: DeliveryToken,
        expectation: &Expectation,
        ack: DeviceAck,
    ) -> TransportResult<DeviceAck> {
        let mut delivered = self.delivered.lock();
        delivered.push_back(token);
        while delivered.len() > self.config.dedupe_window {
            delivered.pop_front();
        }
        drop(delivered);
        expectation.check(ack)
    }
}

#[async_trait::async_trait]
impl TransportAdapter for MqttTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    async fn send(
        &self,
        device_id: &str,
        envelope: &CommandEnvelope,
    ) -> TransportResult<DeliveryReceipt> {
        if !self.client.is_connected() {
            return Err(TransportError::unreachable(
                TransportKind::Mqtt,
                device_id,
                "broker connection is down",
            ));
        }

        let payload = envelope.encode()?;
        self.client
            .publish(&self.command_topic(device_id), payload, self.config.qos, false)
            .await
            .map_err(|e| TransportError::unreachable(TransportKind::Mqtt, device_id, e.to_string()))?;

        self.pending.insert(envelope.token, &envelope.command);
        debug!(
            device_id = %device_id,
            token = %envelope.token,
            command = envelope.command.name(),
            "Published command"
        );
        Ok(DeliveryReceipt::for_envelope(envelope, device_id, TransportKind::Mqtt))
    }

    async fn await_ack(
        &self,
        receipt: &DeliveryReceipt,
        timeout: Duration,
    ) -> TransportResult<DeviceAck> {
        let expectation = self.pending.take(&receipt.token)?;

        let early = self.early.lock().remove(&receipt.token);
        if let Some(ack) = early {
            return self.deliver(receipt.token, &expectation, ack);
        }

        let topic = self.ack_topic(&receipt.device_id);
        let deadline = ack_deadline(timeout);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout(timeout));
            }

            let message = match self.client.next_message(&topic, remaining).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    return Err(TransportError::unreachable(
                        TransportKind::Mqtt,
                        &receipt.device_id,
                        e.to_string(),
                    ));
                }
            };

            let envelope = match AckEnvelope::decode(&message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(device_id = %receipt.device_id, error = %e, "Dropping malformed ack");
                    continue;
                }
            };

            if self.already_delivered(&envelope.token) {
                debug!(token = %envelope.token, "Dropping duplicate ack");
                continue;
            }

            if envelope.token == receipt.token {
                return self.deliver(receipt.token, &expectation, envelope.ack);
            }

            if self.pending.contains(&envelope.token) {
                self.early.lock().insert(envelope.token, envelope.ack);
            } else {
                debug!(token = %envelope.token, "Dropping ack for expired command");
            }
        }
    }

    async fn is_reachable(&self, device_id: &str) -> bool {
        if !self.client.is_connected() {
            return false;
        }
        match self.client.retained(&self.presence_topic(device_id)).await {
            Some(presence) => presence.as_slice() != b"offline",
            None => true,
        }
    }
}
