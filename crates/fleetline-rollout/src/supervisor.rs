//! Session supervisor: owns live sessions, serializes them per device and
//! publishes their events

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use fleetline_ledger::{ConfigBundle, ConfigurationLedger, ConfigurationVersion, DeploymentStatus};
use fleetline_transport::TransportKind;
use fleetline_transport::protocol::chunk_count;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, broadcast, watch,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::model::{BundleRef, Device, SessionId, UpdateOptions, UpdateType, duration_serde};
use crate::preference::PreferenceResolver;
use crate::registry::{DeviceRegistry, FirmwareCatalog};
use crate::runner::{Payload, PayloadOrigin, SessionContext, SessionRunner, cancelled};
use crate::session::{SessionEvent, SessionEventKind, UpdateSession, expected_duration};
use crate::store::BundleStore;

/// Collaborators a supervisor drives sessions against.
#[derive(Clone)]
pub struct RolloutServices {
    /// Device records and version pointers
    pub registry: Arc<dyn DeviceRegistry>,
    /// Firmware records
    pub catalog: Arc<dyn FirmwareCatalog>,
    /// Bundle bytes by checksum
    pub store: Arc<dyn BundleStore>,
    /// Configuration versions
    pub ledger: Arc<ConfigurationLedger>,
    /// Transport order and retry policy per device
    pub resolver: Arc<PreferenceResolver>,
}

/// Supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Sessions allowed to run at once across the fleet
    pub max_concurrent_sessions: usize,
    /// How long to wait for a device to re-announce after restart; the
    /// transport's connection timeout when unset
    #[serde(with = "duration_serde::option")]
    pub reboot_timeout: Option<Duration>,
    /// Events buffered per subscriber before the slowest one lags
    pub event_capacity: usize,
    /// Refuse firmware not marked for production unless forced
    pub require_production_firmware: bool,
    /// Options used by [`Supervisor::start_rollout`]
    pub default_options: UpdateOptions,
    /// Finished sessions kept per device
    pub archive_per_device: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 64,
            reboot_timeout: None,
            event_capacity: 1000,
            require_production_firmware: false,
            default_options: UpdateOptions::default(),
            archive_per_device: 50,
        }
    }
}

impl SupervisorConfig {
    /// Set the fleet-wide session limit.
    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    /// Set the re-announcement wait.
    pub fn with_reboot_timeout(mut self, timeout: Duration) -> Self {
        self.reboot_timeout = Some(timeout);
        self
    }

    /// Require production firmware.
    pub fn with_require_production_firmware(mut self, require: bool) -> Self {
        self.require_production_firmware = require;
        self
    }

    /// Set the default rollout options.
    pub fn with_default_options(mut self, options: UpdateOptions) -> Self {
        self.default_options = options;
        self
    }
}

/// Handle to a started session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Session id
    pub id: SessionId,
    /// Target device
    pub device_id: String,
    /// What is delivered
    pub update_type: UpdateType,
    outcome: watch::Receiver<Option<UpdateSession>>,
}

impl SessionHandle {
    /// The finished session, if it has finished.
    pub fn outcome(&self) -> Option<UpdateSession> {
        self.outcome.borrow().clone()
    }

    /// Wait for the session to reach a terminal state. `None` only if the
    /// session task was lost without reporting.
    pub async fn wait(&self) -> Option<UpdateSession> {
        let mut outcome = self.outcome.clone();
        match outcome.wait_for(Option::is_some).await {
            Ok(session) => session.clone(),
            Err(_) => None,
        }
    }
}

struct ActiveSession {
    device_id: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Tracking {
    active: AsyncMutex<HashMap<SessionId, ActiveSession>>,
    archive: Mutex<HashMap<String, VecDeque<UpdateSession>>>,
    archive_per_device: usize,
}

impl Tracking {
    async fn finish(&self, session: &UpdateSession) {
        self.active.lock().await.remove(&session.id);

        let mut archive = self.archive.lock();
        let entries = archive.entry(session.device_id.clone()).or_default();
        entries.push_back(session.clone());
        while entries.len() > self.archive_per_device {
            entries.pop_front();
        }
    }
}

/// Owns every live update session.
pub struct Supervisor {
    ctx: Arc<SessionContext>,
    config: SupervisorConfig,
    permits: Arc<Semaphore>,
    device_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    tracking: Arc<Tracking>,
    accepting: AtomicBool,
}

impl Supervisor {
    /// Create a supervisor over `services`.
    pub fn new(services: RolloutServices, config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let ctx = Arc::new(SessionContext {
            registry: services.registry,
            catalog: services.catalog,
            store: services.store,
            ledger: services.ledger,
            resolver: services.resolver,
            events,
            reboot_timeout: config.reboot_timeout,
        });

        Self {
            ctx,
            permits: Arc::new(Semaphore::new(config.max_concurrent_sessions.max(1))),
            device_locks: Mutex::new(HashMap::new()),
            tracking: Arc::new(Tracking {
                active: AsyncMutex::new(HashMap::new()),
                archive: Mutex::new(HashMap::new()),
                archive_per_device: config.archive_per_device.max(1),
            }),
            accepting: AtomicBool::new(true),
            config,
        }
    }

    /// Subscribe to session events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Supervisor configuration.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start a rollout with the configured default options.
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails preflight; no session is
    /// created in that case.
    pub async fn start_rollout(
        &self,
        device_id: &str,
        update_type: UpdateType,
        bundle: BundleRef,
    ) -> RolloutResult<SessionHandle> {
        let options = self.config.default_options.clone();
        self.start_rollout_with_options(device_id, update_type, bundle, options)
            .await
    }

    /// Start a rollout. The session runs in its own task; it waits in
    /// `INITIATED` while another session holds the device.
    ///
    /// # Errors
    ///
    /// Returns an error when the request fails preflight or the supervisor is
    /// shutting down.
    pub async fn start_rollout_with_options(
        &self,
        device_id: &str,
        update_type: UpdateType,
        bundle: BundleRef,
        options: UpdateOptions,
    ) -> RolloutResult<SessionHandle> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RolloutError::ShuttingDown);
        }
        let (device, target) = self.plan(device_id, update_type, &bundle, &options).await?;

        let size = usize::try_from(target.size).unwrap_or(usize::MAX);
        let total_chunks = chunk_count(size, options.chunk_size.max(1));
        let session = UpdateSession::new(
            device_id,
            bundle,
            target.version.clone(),
            options,
            expected_duration(total_chunks),
        );
        let id = session.id;

        info!(
            session_id = %id,
            device_id = %device_id,
            update_type = %update_type,
            bundle = %session.bundle,
            target_version = %session.target_version,
            "Rollout accepted"
        );
        let created = SessionEvent {
            session_id: id,
            device_id: device_id.to_string(),
            update_type,
            timestamp: Utc::now(),
            kind: SessionEventKind::Created {
                target_version: session.target_version.clone(),
                expected_duration: session.expected_duration,
            },
        };
        if self.ctx.events.send(created).is_err() {
            debug!(session_id = %id, "No event subscribers");
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let runner = SessionRunner::new(
            Arc::clone(&self.ctx),
            session,
            device,
            target,
            cancel_rx.clone(),
        );

        let lock = self.device_lock(device_id);
        let permits = Arc::clone(&self.permits);
        let tracking = Arc::clone(&self.tracking);

        // Registered before the task can finish and remove itself.
        let mut active = self.tracking.active.lock().await;
        let task = tokio::spawn(async move {
            let mut waiting = cancel_rx;
            let held = tokio::select! {
                held = acquire(lock, permits) => held,
                () = cancelled(&mut waiting) => None,
            };
            if held.is_none() {
                debug!(session_id = %id, "Session released before holding its device");
            }

            let session = runner.run().await;
            drop(held);
            tracking.finish(&session).await;
            outcome_tx.send_modify(|outcome| *outcome = Some(session));
        });
        active.insert(
            id,
            ActiveSession {
                device_id: device_id.to_string(),
                cancel: cancel_tx,
                task,
            },
        );

        Ok(SessionHandle {
            id,
            device_id: device_id.to_string(),
            update_type,
            outcome: outcome_rx,
        })
    }

    /// Run the start checks without creating a session.
    ///
    /// # Errors
    ///
    /// Returns the error [`Supervisor::start_rollout_with_options`] would.
    pub async fn preflight(
        &self,
        device_id: &str,
        update_type: UpdateType,
        bundle: &BundleRef,
        options: &UpdateOptions,
    ) -> RolloutResult<()> {
        self.plan(device_id, update_type, bundle, options).await?;
        Ok(())
    }

    async fn plan(
        &self,
        device_id: &str,
        update_type: UpdateType,
        bundle: &BundleRef,
        options: &UpdateOptions,
    ) -> RolloutResult<(Device, Payload)> {
        if bundle.update_type() != update_type {
            return Err(RolloutError::UpdateTypeMismatch {
                requested: update_type,
                bundle: bundle.update_type(),
            });
        }

        let device = self
            .ctx
            .registry
            .get(device_id)
            .await
            .map_err(|e| RolloutError::Registry(e.to_string()))?
            .ok_or_else(|| RolloutError::DeviceNotFound(device_id.to_string()))?;

        let payload = match bundle {
            BundleRef::Firmware(firmware_id) => {
                let firmware = self
                    .ctx
                    .catalog
                    .get(firmware_id)
                    .await
                    .map_err(|e| RolloutError::Registry(e.to_string()))?
                    .ok_or_else(|| RolloutError::FirmwareNotFound(firmware_id.clone()))?;

                if !options.force {
                    if firmware.device_type != device.device_type {
                        return Err(RolloutError::IncompatibleFirmware {
                            firmware_type: firmware.device_type,
                            device_type: device.device_type,
                        });
                    }
                    if self.config.require_production_firmware && !firmware.is_production {
                        return Err(RolloutError::NotProductionFirmware(firmware.id));
                    }
                }

                Payload {
                    checksum: firmware.checksum,
                    size: firmware.size,
                    version: firmware.version.to_string(),
                    origin: PayloadOrigin::Firmware(firmware.id),
                }
            }
            BundleRef::Configuration(version_id) => {
                let row = self
                    .ctx
                    .ledger
                    .get(*version_id)
                    .await
                    .ok_or(RolloutError::ConfigurationNotFound(*version_id))?;

                if row.device_id != device.id {
                    return Err(RolloutError::ConfigurationDeviceMismatch {
                        version: row.version,
                        owner: row.device_id,
                    });
                }
                if row.deployment_status != DeploymentStatus::Pending {
                    return Err(RolloutError::ConfigurationNotPending {
                        version: row.version,
                        status: row.deployment_status,
                    });
                }

                let size = fleetline_ledger::bundle_bytes(&row.bundle).len();
                Payload {
                    size: u64::try_from(size).unwrap_or(u64::MAX),
                    version: row.label(),
                    origin: PayloadOrigin::Configuration {
                        id: row.id,
                        version: row.version,
                    },
                    checksum: row.checksum,
                }
            }
        };

        Ok((device, payload))
    }

    fn device_lock(&self, device_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.device_locks.lock();
        Arc::clone(locks.entry(device_id.to_string()).or_default())
    }

    /// Append a PENDING configuration version for a device and put its bundle
    /// in the store, ready for [`Supervisor::start_rollout`].
    ///
    /// # Errors
    ///
    /// Returns an error if the device is unknown or the ledger or store
    /// refuses the write.
    pub async fn propose_configuration(
        &self,
        device_id: &str,
        bundle: ConfigBundle,
        change_log: Option<String>,
    ) -> RolloutResult<ConfigurationVersion> {
        if self
            .ctx
            .registry
            .get(device_id)
            .await
            .map_err(|e| RolloutError::Registry(e.to_string()))?
            .is_none()
        {
            return Err(RolloutError::DeviceNotFound(device_id.to_string()));
        }

        let row = self.ctx.ledger.propose(device_id, bundle, change_log).await?;
        self.ctx
            .store
            .put(&fleetline_ledger::bundle_bytes(&row.bundle))
            .await?;
        Ok(row)
    }

    /// Ask a session to stop. Returns whether the request was delivered to a
    /// live session that had not already been cancelled.
    pub async fn cancel_rollout(&self, handle: &SessionHandle) -> bool {
        self.cancel_session(handle.id).await
    }

    /// [`Supervisor::cancel_rollout`] by id.
    pub async fn cancel_session(&self, id: SessionId) -> bool {
        let active = self.tracking.active.lock().await;
        match active.get(&id) {
            Some(entry) => {
                let already = entry.cancel.send_replace(true);
                if !already {
                    info!(session_id = %id, device_id = %entry.device_id, "Cancellation requested");
                }
                !already
            }
            None => {
                debug!(session_id = %id, "Cancel for unknown or finished session");
                false
            }
        }
    }

    /// Live sessions with their devices.
    pub async fn active_sessions(&self) -> Vec<(SessionId, String)> {
        let active = self.tracking.active.lock().await;
        let mut sessions: Vec<_> = active
            .iter()
            .map(|(id, entry)| (*id, entry.device_id.clone()))
            .collect();
        sessions.sort();
        sessions
    }

    /// Finished sessions for a device, oldest first.
    pub fn archived_sessions(&self, device_id: &str) -> Vec<UpdateSession> {
        self.tracking
            .archive
            .lock()
            .get(device_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Reachability of a device over each transport it would be updated
    /// through, in preference order.
    ///
    /// # Errors
    ///
    /// Returns an error if the device's preference cannot be resolved.
    pub async fn reachability(&self, device_id: &str) -> RolloutResult<Vec<(TransportKind, bool)>> {
        let transports = self.ctx.resolver.resolve(device_id)?;
        let mut report = Vec::with_capacity(transports.len());
        for transport in transports {
            let reachable = transport.adapter.is_reachable(device_id).await;
            report.push((transport.kind, reachable));
        }
        Ok(report)
    }

    /// Stop accepting rollouts, cancel every live session and wait for all
    /// of them to settle. Sessions already rolling back finish their rollback.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let entries: Vec<ActiveSession> = self
            .tracking
            .active
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        info!(sessions = entries.len(), "Supervisor shutting down");
        for entry in &entries {
            entry.cancel.send_modify(|cancelled| *cancelled = true);
        }
        self.permits.close();

        for entry in entries {
            if let Err(e) = entry.task.await {
                error!(device_id = %entry.device_id, error = %e, "Session task ended abnormally");
            }
        }
    }
}

async fn acquire(
    lock: Arc<AsyncMutex<()>>,
    permits: Arc<Semaphore>,
) -> Option<(OwnedMutexGuard<()>, OwnedSemaphorePermit)> {
    let guard = lock.lock_owned().await;
    match permits.acquire_owned().await {
        Ok(permit) => Some((guard, permit)),
        Err(_) => {
            warn!("Session limit closed while waiting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_serde() -> Result<(), serde_json::Error> {
        let config: SupervisorConfig =
            serde_json::from_str(r#"{"max_concurrent_sessions": 4, "reboot_timeout": 90}"#)?;
        assert_eq!(config.max_concurrent_sessions, 4);
        assert_eq!(config.reboot_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.event_capacity, 1000);
        assert!(!config.require_production_firmware);
        assert_eq!(config.default_options, UpdateOptions::default());
        Ok(())
    }

    #[test]
    fn test_config_builders() {
        let config = SupervisorConfig::default()
            .with_max_concurrent_sessions(2)
            .with_reboot_timeout(Duration::from_secs(5))
            .with_require_production_firmware(true);
        assert_eq!(config.max_concurrent_sessions, 2);
        assert_eq!(config.reboot_timeout, Some(Duration::from_secs(5)));
        assert!(config.require_production_firmware);
    }
}
