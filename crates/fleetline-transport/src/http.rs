//! HTTP transport.
//!
//! The device runs a small listener: commands are POSTed to
//! `{base_url}/ota/commands` and acks are polled from
//! `{base_url}/ota/acks/{token}` until they appear. A 404 while polling means
//! "not yet"; 409 and 422 mean the device refused the command.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::adapter::{DeliveryReceipt, TransportAdapter, TransportKind};
use crate::error::{TransportError, TransportResult};
use crate::protocol::{AckEnvelope, CommandEnvelope, DeviceAck, PendingAcks, ack_deadline};

/// Where and how to reach one device over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEndpoint {
    /// Base URL of the device listener
    pub base_url: String,
    /// Bearer token, if the listener requires one
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Ack polling interval; the adapter default applies when unset
    #[serde(default)]
    pub polling_interval: Option<Duration>,
}

impl HttpEndpoint {
    /// Endpoint with no auth and default polling.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            polling_interval: None,
        }
    }

    /// Set the bearer token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the polling interval
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// HTTP adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTransportConfig {
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Ack polling interval when the endpoint sets none
    pub polling_interval: Duration,
    /// User agent header
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            polling_interval: Duration::from_secs(1),
            user_agent: format!("fleetline/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpTransportConfig {
    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the default polling interval
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }
}

/// Transport adapter for devices with an HTTP listener.
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
    endpoints: RwLock<HashMap<String, HttpEndpoint>>,
    pending: PendingAcks,
}

impl HttpTransport {
    /// Build the adapter and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(config: HttpTransportConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            config,
            endpoints: RwLock::new(HashMap::new()),
            pending: PendingAcks::new(),
        })
    }

    /// Register or replace the endpoint for a device.
    pub fn register_device(&self, device_id: impl Into<String>, endpoint: HttpEndpoint) {
        let device_id = device_id.into();
        info!(device_id = %device_id, base_url = %endpoint.base_url, "Registered HTTP endpoint");
        self.endpoints.write().insert(device_id, endpoint);
    }

    /// Endpoint registered for a device.
    pub fn endpoint(&self, device_id: &str) -> Option<HttpEndpoint> {
        self.endpoints.read().get(device_id).cloned()
    }

    fn require_endpoint(&self, device_id: &str) -> TransportResult<HttpEndpoint> {
        self.endpoint(device_id).ok_or_else(|| {
            TransportError::unreachable(TransportKind::Http, device_id, "no HTTP endpoint registered")
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder, endpoint: &HttpEndpoint) -> reqwest::RequestBuilder {
        match &endpoint.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn map_request_error(&self, device_id: &str, err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::timeout(self.config.request_timeout)
        } else {
            TransportError::unreachable(TransportKind::Http, device_id, err.to_string())
        }
    }
}

fn is_refusal(status: StatusCode) -> bool {
    status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY
}

#[async_trait::async_trait]
impl TransportAdapter for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(
        &self,
        device_id: &str,
        envelope: &CommandEnvelope,
    ) -> TransportResult<DeliveryReceipt> {
        let endpoint = self.require_endpoint(device_id)?;

        let response = self
            .request(self.client.post(endpoint.url("ota/commands")), &endpoint)
            .json(envelope)
            .send()
            .await
            .map_err(|e| self.map_request_error(device_id, &e))?;

        let status = response.status();
        if is_refusal(status) {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(TransportError::unreachable(
                TransportKind::Http,
                device_id,
                format!("listener answered {status}"),
            ));
        }

        self.pending.insert(envelope.token, &envelope.command);
        debug!(
            device_id = %device_id,
            token = %envelope.token,
            command = envelope.command.name(),
            "Posted command"
        );
        Ok(DeliveryReceipt::for_envelope(envelope, device_id, TransportKind::Http))
    }

    async fn await_ack(
        &self,
        receipt: &DeliveryReceipt,
        timeout: Duration,
    ) -> TransportResult<DeviceAck> {
        let expectation = self.pending.take(&receipt.token)?;
        let endpoint = self.require_endpoint(&receipt.device_id)?;
        let url = endpoint.url(&format!("ota/acks/{}", receipt.token));
        let interval = endpoint
            .polling_interval
            .unwrap_or(self.config.polling_interval);
        let deadline = ack_deadline(timeout);

        loop {
            let response = self
                .request(self.client.get(&url), &endpoint)
                .send()
                .await
                .map_err(|e| self.map_request_error(&receipt.device_id, &e))?;

            let status = response.status();
            if status.is_success() && status != StatusCode::NO_CONTENT {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| self.map_request_error(&receipt.device_id, &e))?;
                let envelope = AckEnvelope::decode(&bytes)?;
                if envelope.token != receipt.token {
                    return Err(TransportError::Malformed(format!(
                        "ack for {} returned while polling {}",
                        envelope.token, receipt.token
                    )));
                }
                return expectation.check(envelope.ack);
            }
            if is_refusal(status) {
                let body = response.text().await.unwrap_or_default();
                return Err(TransportError::Rejected(format!("{status}: {body}")));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout(timeout));
            }
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }

    async fn is_reachable(&self, device_id: &str) -> bool {
        let Some(endpoint) = self.endpoint(device_id) else {
            return false;
        };
        match self
            .request(self.client.get(endpoint.url("ota/ping")), &endpoint)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
