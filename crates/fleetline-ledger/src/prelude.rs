//! Prelude for ledger consumers.

pub use crate::{
    error::{LedgerError, LedgerResult},
    ledger::{ConfigurationLedger, LedgerConfig},
    model::{ConfigBundle, ConfigurationVersion, DeploymentStatus, VersionId},
};
