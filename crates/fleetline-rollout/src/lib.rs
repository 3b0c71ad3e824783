//! Rollout orchestration for Fleetline
//!
//! An [`UpdateSession`] moves one device from its current firmware or
//! configuration to a target bundle: prepare, transfer, validate, apply,
//! restart, verify, and roll back when a step after apply goes wrong. The
//! [`Supervisor`] runs sessions as independent tasks, allows one per device,
//! and publishes every transition on a broadcast stream.
//!
//! - [`state`]: The session state machine, a total transition function
//! - [`preference`]: Per-device transport order and retry policy
//! - [`store`]: Content-addressed bundle storage
//! - [`registry`]: Device registry and firmware catalog capabilities
//! - [`session`]: Session records and events
//! - [`supervisor`]: Session ownership, locking and cancellation
//!
//! Configuration versions live in [`fleetline_ledger`]; device I/O goes
//! through [`fleetline_transport`].

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod model;
pub mod preference;
pub mod prelude;
pub mod registry;
mod runner;
pub mod session;
pub mod state;
pub mod store;
pub mod supervisor;

pub use error::{ResolveError, RolloutError, RolloutResult, StoreError};
pub use model::{
    BundleRef, Device, DeviceStatus, Firmware, FirmwareId, SessionId, UpdateOptions, UpdateType,
};
pub use preference::{
    BleChannelConfig, CommunicationPreference, DefaultPreference, HttpChannelConfig,
    MqttChannelConfig, PreferenceResolver, ResolvedTransport, RetryPolicy,
};
pub use registry::{DeviceRegistry, FirmwareCatalog, InMemoryDeviceRegistry, InMemoryFirmwareCatalog};
pub use session::{SessionEvent, SessionEventKind, SessionFailure, StateChange, UpdateSession};
pub use state::{InvalidTransition, SessionState, Trigger};
pub use store::{BundleStore, FileBundleStore, InMemoryBundleStore, StoredBundle};
pub use supervisor::{RolloutServices, SessionHandle, Supervisor, SupervisorConfig};
