//! Prelude for rollout consumers.

pub use crate::{
    error::{RolloutError, RolloutResult},
    model::{BundleRef, Device, Firmware, FirmwareId, SessionId, UpdateOptions, UpdateType},
    preference::{CommunicationPreference, PreferenceResolver, RetryPolicy},
    registry::{DeviceRegistry, FirmwareCatalog},
    session::{SessionEvent, SessionEventKind, SessionFailure, UpdateSession},
    state::{SessionState, Trigger},
    store::BundleStore,
    supervisor::{RolloutServices, SessionHandle, Supervisor, SupervisorConfig},
};
