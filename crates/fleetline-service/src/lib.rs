//! Fleetline service
//!
//! Loads the `fleetlined` YAML configuration, seeds the device registry,
//! firmware catalog and bundle store from it, and wires the HTTP adapter and
//! preference resolver into a [`fleetline_rollout::Supervisor`].

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod fleet;
pub mod output;

pub use config::{ConfigError, ServiceConfig};
pub use error::ServiceError;
pub use fleet::{Fleet, FleetBuilder};
