//! The configuration ledger

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::model::{ConfigBundle, ConfigurationVersion, DeploymentStatus, VersionId, bundle_checksum};
use crate::storage::{LedgerFile, LedgerStorage, is_valid_device_id};

/// Ledger settings.
#[derive(Debug, Clone, Default)]
pub struct LedgerConfig {
    /// Directory for per-device JSON files; memory only when unset
    pub directory: Option<PathBuf>,
}

impl LedgerConfig {
    /// Persist under `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
        }
    }

    fn storage(&self) -> LedgerStorage {
        match &self.directory {
            Some(dir) => LedgerStorage::Directory(dir.clone()),
            None => LedgerStorage::Memory,
        }
    }
}

#[derive(Debug, Clone)]
struct DeviceLedger {
    device_id: String,
    rows: Vec<ConfigurationVersion>,
}

impl DeviceLedger {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            rows: Vec::new(),
        }
    }

    fn next_version(&self) -> u64 {
        self.rows.last().map_or(1, |row| row.version.saturating_add(1))
    }

    fn latest_deployed(&self) -> Option<&ConfigurationVersion> {
        self.rows
            .iter()
            .rev()
            .find(|row| row.deployment_status == DeploymentStatus::Deployed)
    }

    fn deploying(&self) -> Option<&ConfigurationVersion> {
        self.rows
            .iter()
            .find(|row| row.deployment_status == DeploymentStatus::Deploying)
    }

    fn row_mut(&mut self, id: VersionId) -> LedgerResult<&mut ConfigurationVersion> {
        self.rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(LedgerError::VersionNotFound(id))
    }

    fn transition(
        &mut self,
        id: VersionId,
        to: DeploymentStatus,
    ) -> LedgerResult<&mut ConfigurationVersion> {
        let row = self.row_mut(id)?;
        if !row.deployment_status.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                version: id,
                from: row.deployment_status,
                to,
            });
        }
        row.deployment_status = to;
        Ok(row)
    }

    fn to_file(&self) -> LedgerFile {
        LedgerFile {
            device_id: self.device_id.clone(),
            rows: self.rows.clone(),
        }
    }
}

/// Append-only, per-device configuration ledger.
///
/// Each device's rows sit behind their own async lock; a mutation is staged on
/// a copy, persisted, and only then made visible, so a failed write leaves the
/// in-memory ledger unchanged.
pub struct ConfigurationLedger {
    storage: LedgerStorage,
    devices: RwLock<HashMap<String, Arc<Mutex<DeviceLedger>>>>,
    index: RwLock<HashMap<VersionId, String>>,
}

impl ConfigurationLedger {
    /// Ledger held in memory only.
    pub fn in_memory() -> Self {
        Self {
            storage: LedgerStorage::Memory,
            devices: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Open a ledger, loading any persisted rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a file is corrupt.
    pub async fn open(config: LedgerConfig) -> LedgerResult<Self> {
        let storage = config.storage();
        let mut devices = HashMap::new();
        let mut index = HashMap::new();

        for file in storage.load_all().await? {
            for row in &file.rows {
                index.insert(row.id, file.device_id.clone());
            }
            devices.insert(
                file.device_id.clone(),
                Arc::new(Mutex::new(DeviceLedger {
                    device_id: file.device_id,
                    rows: file.rows,
                })),
            );
        }

        Ok(Self {
            storage,
            devices: RwLock::new(devices),
            index: RwLock::new(index),
        })
    }

    fn device(&self, device_id: &str) -> Arc<Mutex<DeviceLedger>> {
        if let Some(ledger) = self.devices.read().get(device_id) {
            return ledger.clone();
        }
        self.devices
            .write()
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceLedger::new(device_id))))
            .clone()
    }

    fn device_of(&self, id: VersionId) -> LedgerResult<String> {
        self.index
            .read()
            .get(&id)
            .cloned()
            .ok_or(LedgerError::VersionNotFound(id))
    }

    /// Run `f` against a copy of the device's rows, persist the copy and then
    /// publish it.
    async fn mutate<T>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut DeviceLedger) -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let ledger = self.device(device_id);
        let mut guard = ledger.lock().await;
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        self.storage.save(&draft.to_file()).await?;
        *guard = draft;
        Ok(out)
    }

    /// Append a PENDING row with the next version number for the device.
    ///
    /// `previous_version` is set to the device's latest deployed version.
    ///
    /// # Errors
    ///
    /// Returns an error if the device id is unusable or persistence fails.
    pub async fn propose(
        &self,
        device_id: &str,
        bundle: ConfigBundle,
        change_log: Option<String>,
    ) -> LedgerResult<ConfigurationVersion> {
        if !is_valid_device_id(device_id) {
            return Err(LedgerError::InvalidDeviceId(device_id.to_string()));
        }

        let row = self
            .mutate(device_id, |ledger| {
                let row = ConfigurationVersion {
                    id: VersionId::new(),
                    device_id: device_id.to_string(),
                    version: ledger.next_version(),
                    previous_version: ledger.latest_deployed().map(|r| r.version),
                    checksum: bundle_checksum(&bundle),
                    bundle,
                    change_log,
                    is_rollback: false,
                    rollback_source: None,
                    deployment_status: DeploymentStatus::Pending,
                    failure_reason: None,
                    created_at: Utc::now(),
                    deployed_at: None,
                };
                ledger.rows.push(row.clone());
                Ok(row)
            })
            .await?;

        self.index.write().insert(row.id, row.device_id.clone());
        info!(device_id = %device_id, version = row.version, "Proposed configuration version");
        Ok(row)
    }

    /// PENDING -> DEPLOYING. At most one row per device may be deploying.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is not PENDING or another row is deploying.
    pub async fn mark_deploying(&self, id: VersionId) -> LedgerResult<ConfigurationVersion> {
        let device_id = self.device_of(id)?;
        self.mutate(&device_id, |ledger| {
            if let Some(other) = ledger.deploying().filter(|row| row.id != id) {
                return Err(LedgerError::AlreadyDeploying {
                    device_id: ledger.device_id.clone(),
                    version: other.version,
                });
            }
            Ok(ledger.transition(id, DeploymentStatus::Deploying)?.clone())
        })
        .await
    }

    /// Mark a deploying row DEPLOYED. Re-committing a DEPLOYED row is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is in any other status.
    pub async fn commit_deployed(&self, id: VersionId) -> LedgerResult<ConfigurationVersion> {
        let device_id = self.device_of(id)?;
        let row = self
            .mutate(&device_id, |ledger| {
                let current = ledger.row_mut(id)?;
                if current.deployment_status == DeploymentStatus::Deployed {
                    return Ok(current.clone());
                }
                let row = ledger.transition(id, DeploymentStatus::Deployed)?;
                row.deployed_at = Some(Utc::now());
                Ok(row.clone())
            })
            .await?;
        info!(device_id = %device_id, version = row.version, "Configuration deployed");
        Ok(row)
    }

    /// Mark a pending or deploying row FAILED. Re-failing a FAILED row is a
    /// no-op that keeps the original reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the row already reached another terminal status.
    pub async fn commit_failed(
        &self,
        id: VersionId,
        reason: impl Into<String>,
    ) -> LedgerResult<ConfigurationVersion> {
        let device_id = self.device_of(id)?;
        let reason = reason.into();
        let row = self
            .mutate(&device_id, |ledger| {
                let current = ledger.row_mut(id)?;
                if current.deployment_status == DeploymentStatus::Failed {
                    return Ok(current.clone());
                }
                let row = ledger.transition(id, DeploymentStatus::Failed)?;
                row.failure_reason = Some(reason);
                Ok(row.clone())
            })
            .await?;
        warn!(
            device_id = %device_id,
            version = row.version,
            reason = row.failure_reason.as_deref().unwrap_or_default(),
            "Configuration version failed"
        );
        Ok(row)
    }

    /// Record a successful rollback of `failed`.
    ///
    /// `failed` moves DEPLOYING -> ROLLED_BACK and a new DEPLOYED row is
    /// appended carrying the bundle of `restored`, with `is_rollback` set,
    /// `rollback_source` = the failed version and `previous_version` = the
    /// last deployed version. Returns the new row.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows belong to different devices, `restored`
    /// is not DEPLOYED, or `failed` is not DEPLOYING.
    pub async fn commit_rolled_back(
        &self,
        failed: VersionId,
        restored: VersionId,
    ) -> LedgerResult<ConfigurationVersion> {
        let device_id = self.device_of(failed)?;
        let restored_device = self.device_of(restored)?;
        if restored_device != device_id {
            return Err(LedgerError::DeviceMismatch {
                version: restored,
                expected: device_id,
                actual: restored_device,
            });
        }

        let row = self
            .mutate(&device_id, |ledger| {
                let last_good = ledger
                    .latest_deployed()
                    .map(|row| row.version)
                    .ok_or_else(|| LedgerError::NoKnownGoodVersion(ledger.device_id.clone()))?;

                let source = ledger.row_mut(restored)?;
                if source.deployment_status != DeploymentStatus::Deployed {
                    return Err(LedgerError::InvalidTransition {
                        version: restored,
                        from: source.deployment_status,
                        to: DeploymentStatus::Deployed,
                    });
                }
                let bundle = source.bundle.clone();
                let checksum = source.checksum.clone();

                let failed_version = ledger.transition(failed, DeploymentStatus::RolledBack)?.version;

                let now = Utc::now();
                let row = ConfigurationVersion {
                    id: VersionId::new(),
                    device_id: ledger.device_id.clone(),
                    version: ledger.next_version(),
                    previous_version: Some(last_good),
                    bundle,
                    checksum,
                    change_log: Some(format!("rollback of version {failed_version}")),
                    is_rollback: true,
                    rollback_source: Some(failed_version),
                    deployment_status: DeploymentStatus::Deployed,
                    failure_reason: None,
                    created_at: now,
                    deployed_at: Some(now),
                };
                ledger.rows.push(row.clone());
                Ok(row)
            })
            .await?;

        self.index.write().insert(row.id, row.device_id.clone());
        info!(
            device_id = %device_id,
            version = row.version,
            rollback_source = ?row.rollback_source,
            "Recorded configuration rollback"
        );
        Ok(row)
    }

    /// Most recent DEPLOYED row of a device: the rollback target.
    pub async fn latest_deployed(&self, device_id: &str) -> Option<ConfigurationVersion> {
        let ledger = self.devices.read().get(device_id).cloned()?;
        let guard = ledger.lock().await;
        guard.latest_deployed().cloned()
    }

    /// Row currently DEPLOYING for a device.
    pub async fn deploying(&self, device_id: &str) -> Option<ConfigurationVersion> {
        let ledger = self.devices.read().get(device_id).cloned()?;
        let guard = ledger.lock().await;
        guard.deploying().cloned()
    }

    /// All rows of a device in version order.
    pub async fn history(&self, device_id: &str) -> Vec<ConfigurationVersion> {
        let Some(ledger) = self.devices.read().get(device_id).cloned() else {
            return Vec::new();
        };
        let guard = ledger.lock().await;
        guard.rows.clone()
    }

    /// Look up a row by id.
    pub async fn get(&self, id: VersionId) -> Option<ConfigurationVersion> {
        let device_id = self.device_of(id).ok()?;
        let ledger = self.devices.read().get(&device_id).cloned()?;
        let guard = ledger.lock().await;
        guard.rows.iter().find(|row| row.id == id).cloned()
    }

    /// Devices with at least one row.
    pub fn devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
