//! BLE transport.
//!
//! Point-to-point and connection-oriented: the adapter connects before every
//! send if the link dropped, splits each envelope into MTU-sized frames and
//! reassembles notification frames into acks. A device out of radio range is
//! `Unreachable`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{DeliveryReceipt, TransportAdapter, TransportKind};
use crate::error::{LinkError, TransportError, TransportResult};
use crate::protocol::{AckEnvelope, CommandEnvelope, DeviceAck, PendingAcks, ack_deadline};

/// Header bit set on the last frame of a message.
const FINAL_FRAME: u8 = 0x80;

/// Minimal central-role BLE link the adapter needs.
#[async_trait::async_trait]
pub trait BleLink: Send + Sync {
    /// Whether the device was seen advertising recently.
    async fn in_range(&self, device_id: &str) -> bool;

    /// Whether a GATT connection is currently open.
    async fn is_connected(&self, device_id: &str) -> bool;

    /// Open a GATT connection.
    async fn connect(&self, device_id: &str, timeout: Duration) -> Result<(), LinkError>;

    /// Negotiated ATT payload size for the connection.
    fn mtu(&self, device_id: &str) -> Option<usize>;

    /// Write one frame to the command characteristic.
    async fn write(&self, device_id: &str, frame: Vec<u8>) -> Result<(), LinkError>;

    /// Next notification frame, or `None` when `timeout` elapses.
    async fn next_notification(
        &self,
        device_id: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, LinkError>;
}

/// BLE adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleTransportConfig {
    /// Connection attempt timeout
    pub connect_timeout: Duration,
    /// Frame size used when the link reports no MTU
    pub default_mtu: usize,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            default_mtu: 244,
        }
    }
}

impl BleTransportConfig {
    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the fallback MTU
    pub fn with_default_mtu(mut self, mtu: usize) -> Self {
        self.default_mtu = mtu;
        self
    }
}

/// Split `payload` into frames of at most `mtu` bytes, each prefixed with a
/// one-byte header whose high bit marks the final frame.
pub fn fragment(payload: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let body = mtu.saturating_sub(1).max(1);
    let mut frames: Vec<Vec<u8>> = payload
        .chunks(body)
        .map(|chunk| {
            let mut frame = Vec::with_capacity(chunk.len() + 1);
            frame.push(0);
            frame.extend_from_slice(chunk);
            frame
        })
        .collect();

    if frames.is_empty() {
        frames.push(vec![FINAL_FRAME]);
    } else if let Some(header) = frames.last_mut().and_then(|last| last.first_mut()) {
        *header = FINAL_FRAME;
    }
    frames
}

/// Transport adapter over a BLE link.
pub struct BleTransport {
    link: Arc<dyn BleLink>,
    config: BleTransportConfig,
    pending: PendingAcks,
    partial: Mutex<HashMap<String, Vec<u8>>>,
}

impl BleTransport {
    /// Create an adapter on top of a link.
    pub fn new(link: Arc<dyn BleLink>, config: BleTransportConfig) -> Self {
        Self {
            link,
            config,
            pending: PendingAcks::new(),
            partial: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_connected(&self, device_id: &str) -> TransportResult<()> {
        if !self.link.in_range(device_id).await {
            return Err(TransportError::unreachable(
                TransportKind::Ble,
                device_id,
                "device out of range",
            ));
        }
        if self.link.is_connected(device_id).await {
            return Ok(());
        }

        info!(device_id = %device_id, "Connecting over BLE");
        self.partial.lock().remove(device_id);
        self.link
            .connect(device_id, self.config.connect_timeout)
            .await
            .map_err(|e| TransportError::unreachable(TransportKind::Ble, device_id, e.to_string()))
    }

    /// Feed one notification frame; returns the message once complete.
    fn reassemble(&self, device_id: &str, frame: &[u8]) -> Option<Vec<u8>> {
        let (header, body) = frame.split_first()?;
        let mut partial = self.partial.lock();
        let buffer = partial.entry(device_id.to_string()).or_default();
        buffer.extend_from_slice(body);
        if header & FINAL_FRAME != 0 {
            partial.remove(device_id)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl TransportAdapter for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn send(
        &self,
        device_id: &str,
        envelope: &CommandEnvelope,
    ) -> TransportResult<DeliveryReceipt> {
        self.ensure_connected(device_id).await?;

        let payload = envelope.encode()?;
        let mtu = self.link.mtu(device_id).unwrap_or(self.config.default_mtu);
        let frames = fragment(&payload, mtu);
        let frame_count = frames.len();

        for frame in frames {
            self.link
                .write(device_id, frame)
                .await
                .map_err(|e| TransportError::unreachable(TransportKind::Ble, device_id, e.to_string()))?;
        }

        self.pending.insert(envelope.token, &envelope.command);
        debug!(
            device_id = %device_id,
            token = %envelope.token,
            command = envelope.command.name(),
            frames = frame_count,
            "Wrote command"
        );
        Ok(DeliveryReceipt::for_envelope(envelope, device_id, TransportKind::Ble))
    }

    async fn await_ack(
        &self,
        receipt: &DeliveryReceipt,
        timeout: Duration,
    ) -> TransportResult<DeviceAck> {
        let expectation = self.pending.take(&receipt.token)?;
        let deadline = ack_deadline(timeout);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout(timeout));
            }

            let frame = match self
                .link
                .next_notification(&receipt.device_id, remaining)
                .await
            {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    self.partial.lock().remove(&receipt.device_id);
                    return Err(TransportError::unreachable(
                        TransportKind::Ble,
                        &receipt.device_id,
                        e.to_string(),
                    ));
                }
            };

            let Some(message) = self.reassemble(&receipt.device_id, &frame) else {
                continue;
            };

            match AckEnvelope::decode(&message) {
                Ok(envelope) if envelope.token == receipt.token => {
                    return expectation.check(envelope.ack);
                }
                Ok(envelope) => {
                    debug!(token = %envelope.token, "Dropping stale ack");
                }
                Err(e) => {
                    warn!(device_id = %receipt.device_id, error = %e, "Dropping malformed ack");
                }
            }
        }
    }

    async fn is_reachable(&self, device_id: &str) -> bool {
        self.link.in_range(device_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceCommand;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Peripheral that answers every complete command with `Applied`.
    struct FakePeripheral {
        in_range: AtomicBool,
        connected: AtomicBool,
        connects: AtomicUsize,
        mtu: usize,
        inbound: Mutex<Vec<u8>>,
        outbound: Mutex<VecDeque<Vec<u8>>>,
        frames_written: AtomicUsize,
        notify: Notify,
    }

    impl FakePeripheral {
        fn new(mtu: usize) -> Self {
            Self {
                in_range: AtomicBool::new(true),
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                mtu,
                inbound: Mutex::new(Vec::new()),
                outbound: Mutex::new(VecDeque::new()),
                frames_written: AtomicUsize::new(0),
                notify: Notify::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl BleLink for FakePeripheral {
        async fn in_range(&self, _device_id: &str) -> bool {
            self.in_range.load(Ordering::SeqCst)
        }

        async fn is_connected(&self, _device_id: &str) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn connect(&self, _device_id: &str, _timeout: Duration) -> Result<(), LinkError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn mtu(&self, _device_id: &str) -> Option<usize> {
            Some(self.mtu)
        }

        async fn write(&self, _device_id: &str, frame: Vec<u8>) -> Result<(), LinkError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(LinkError::Disconnected);
            }
            assert!(frame.len() <= self.mtu);
            self.frames_written.fetch_add(1, Ordering::SeqCst);
            let Some((header, body)) = frame.split_first() else {
                return Ok(());
            };
            let complete = {
                let mut inbound = self.inbound.lock();
                inbound.extend_from_slice(body);
                if header & FINAL_FRAME != 0 {
                    Some(std::mem::take(&mut *inbound))
                } else {
                    None
                }
            };
            if let Some(message) = complete {
                let envelope =
                    CommandEnvelope::decode(&message).map_err(|e| LinkError::Io(e.to_string()))?;
                let reply = AckEnvelope {
                    token: envelope.token,
                    ack: DeviceAck::Applied,
                }
                .encode()
                .map_err(|e| LinkError::Io(e.to_string()))?;
                self.outbound.lock().extend(fragment(&reply, self.mtu));
                self.notify.notify_one();
            }
            Ok(())
        }

        async fn next_notification(
            &self,
            _device_id: &str,
            timeout: Duration,
        ) -> Result<Option<Vec<u8>>, LinkError> {
            let wait = async {
                loop {
                    let next = self.outbound.lock().pop_front();
                    if let Some(frame) = next {
                        return frame;
                    }
                    self.notify.notified().await;
                }
            };
            Ok(tokio::time::timeout(timeout, wait).await.ok())
        }
    }

    #[test]
    fn test_fragment_marks_only_last_frame() {
        let frames = fragment(&[7u8; 10], 4);
        assert_eq!(frames.len(), 4);
        let headers: Vec<u8> = frames.iter().filter_map(|f| f.first().copied()).collect();
        assert_eq!(headers, vec![0, 0, 0, FINAL_FRAME]);
        assert!(frames.iter().all(|f| f.len() <= 4));
    }

    #[test]
    fn test_fragment_empty_payload() {
        assert_eq!(fragment(&[], 20), vec![vec![FINAL_FRAME]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_before_first_send() -> TransportResult<()> {
        let link = Arc::new(FakePeripheral::new(23));
        let transport = BleTransport::new(link.clone(), BleTransportConfig::default());

        let receipt = transport
            .send("tag-1", &CommandEnvelope::new("s-1", DeviceCommand::Apply))
            .await?;
        let ack = transport.await_ack(&receipt, Duration::from_secs(5)).await?;

        assert_eq!(ack, DeviceAck::Applied);
        assert_eq!(link.connects.load(Ordering::SeqCst), 1);
        assert!(link.frames_written.load(Ordering::SeqCst) > 1);

        transport
            .send("tag-1", &CommandEnvelope::new("s-1", DeviceCommand::Restart))
            .await?;
        assert_eq!(link.connects.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_out_of_range_is_unreachable() {
        let link = Arc::new(FakePeripheral::new(244));
        link.in_range.store(false, Ordering::SeqCst);
        let transport = BleTransport::new(link, BleTransportConfig::default());

        let result = transport
            .send("tag-1", &CommandEnvelope::new("s-1", DeviceCommand::Apply))
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
        assert!(!transport.is_reachable("tag-1").await);
    }
}
