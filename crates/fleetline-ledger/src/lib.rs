//! Configuration version ledger
//!
//! The ledger is the durable record of what configuration each device runs
//! and how it got there. Rows are append-only; only a row's deployment status
//! moves, and only forward:
//!
//! ```text
//! PENDING ──> DEPLOYING ──> DEPLOYED
//!    │            ├───────> FAILED
//!    │            └───────> ROLLED_BACK
//!    └──────────────────────> FAILED
//! ```
//!
//! Version numbers are allocated per device under that device's lock, so
//! concurrent proposals never share a number and the committed sequence has
//! no gaps.

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod ledger;
pub mod model;
pub mod prelude;
pub mod storage;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{ConfigurationLedger, LedgerConfig};
pub use model::{ConfigBundle, ConfigurationVersion, DeploymentStatus, VersionId, bundle_bytes, bundle_checksum};
pub use storage::LedgerStorage;
