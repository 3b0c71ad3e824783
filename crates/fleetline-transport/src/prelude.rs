//! Prelude for transport consumers.

pub use crate::{
    adapter::{DeliveryReceipt, TransportAdapter, TransportKind, TransportRegistry},
    error::{LinkError, TransportError, TransportResult},
    protocol::{AckEnvelope, CommandEnvelope, DeliveryToken, DeviceAck, DeviceCommand, UpdateKind},
};
