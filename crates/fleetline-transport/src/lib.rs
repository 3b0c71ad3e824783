//! Device transports for Fleetline
//!
//! Every device channel is reached through the [`TransportAdapter`] capability:
//! send a command envelope, await its acknowledgment, probe reachability. The
//! three adapters differ wildly in delivery semantics but all of them report
//! failures through [`TransportError`], whose [`FailureClass`] tells the
//! rollout machine whether to retry, fall back or stop.
//!
//! - [`protocol`]: JSON command/ack envelopes exchanged with the device agent
//! - [`adapter`]: The adapter trait, [`TransportKind`] and [`TransportRegistry`]
//! - [`mqtt`]: Pub/sub adapter over an [`MqttClient`] (at-least-once)
//! - [`ble`]: Connection-oriented adapter over a [`BleLink`]
//! - [`http`]: Request/response adapter built on `reqwest`
//!
//! [`FailureClass`]: fleetline_errors::FailureClass

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod adapter;
pub mod ble;
pub mod error;
pub mod http;
pub mod mqtt;
pub mod prelude;
pub mod protocol;

pub use adapter::{DeliveryReceipt, TransportAdapter, TransportKind, TransportRegistry};
pub use ble::{BleLink, BleTransport, BleTransportConfig};
pub use error::{LinkError, TransportError, TransportResult};
pub use http::{HttpEndpoint, HttpTransport, HttpTransportConfig};
pub use mqtt::{MqttClient, MqttTransport, MqttTransportConfig, QoS};
pub use protocol::{AckEnvelope, CommandEnvelope, DeliveryToken, DeviceAck, DeviceCommand, UpdateKind};
