//! Ledger rows and deployment status

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Opaque settings mapping. `BTreeMap` keeps serialisation, and therefore the
/// checksum, independent of insertion order.
pub type ConfigBundle = BTreeMap<String, serde_json::Value>;

/// Canonical bytes of a bundle, as delivered to devices.
pub fn bundle_bytes(bundle: &ConfigBundle) -> Vec<u8> {
    serde_json::to_vec(bundle).unwrap_or_default()
}

/// Lowercase hex sha256 of [`bundle_bytes`].
pub fn bundle_checksum(bundle: &ConfigBundle) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bundle_bytes(bundle));
    hex::encode(hasher.finalize())
}

/// Identifier of one ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(Uuid);

impl VersionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for VersionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a ledger row is in its deployment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Proposed, no session has started
    Pending,
    /// A session is delivering this version
    Deploying,
    /// Running on the device
    Deployed,
    /// Delivery failed; the device kept its previous version or is in an
    /// unknown state after a failed rollback
    Failed,
    /// Applied, then undone by a successful rollback
    RolledBack,
}

impl DeploymentStatus {
    /// Terminal statuses are never left.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Deployed | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }

    /// Whether `self -> next` is a legal move.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Deploying) | (Pending, Failed) | (Deploying, Deployed | Failed | RolledBack)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "PENDING",
            DeploymentStatus::Deploying => "DEPLOYING",
            DeploymentStatus::Deployed => "DEPLOYED",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

/// One configuration version of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationVersion {
    /// Row id
    pub id: VersionId,
    /// Owning device
    pub device_id: String,
    /// Per-device version number, strictly increasing
    pub version: u64,
    /// Version this row supersedes
    pub previous_version: Option<u64>,
    /// Settings
    pub bundle: ConfigBundle,
    /// sha256 of the canonical bundle bytes
    pub checksum: String,
    /// Operator notes
    pub change_log: Option<String>,
    /// Whether this row restores an earlier bundle
    pub is_rollback: bool,
    /// Version whose failure triggered this rollback
    pub rollback_source: Option<u64>,
    /// Lifecycle status
    pub deployment_status: DeploymentStatus,
    /// Why the row failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// When the row was appended
    pub created_at: DateTime<Utc>,
    /// When the row reached `DEPLOYED`
    pub deployed_at: Option<DateTime<Utc>>,
}

impl ConfigurationVersion {
    /// Version label sent to devices.
    pub fn label(&self) -> String {
        self.version.to_string()
    }
}
