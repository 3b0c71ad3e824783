//! Wiring a [`ServiceConfig`] into a running supervisor

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetline_ledger::{ConfigurationLedger, ConfigurationVersion, LedgerConfig, VersionId};
use fleetline_rollout::{
    BundleRef, BundleStore, DefaultPreference, Device, FileBundleStore, Firmware, FirmwareId,
    InMemoryBundleStore, InMemoryDeviceRegistry, InMemoryFirmwareCatalog, PreferenceResolver,
    RolloutServices, SessionEvent, SessionState, Supervisor, SupervisorConfig, UpdateOptions,
    UpdateSession,
};
use fleetline_transport::{
    HttpEndpoint, HttpTransport, HttpTransportConfig, TransportAdapter, TransportRegistry,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::{ConfigError, ServiceConfig};
use crate::error::ServiceError;

/// Builds a [`Fleet`]. The HTTP adapter is always registered; MQTT and BLE
/// adapters are supplied by the embedder over their own broker client and
/// radio link.
pub struct FleetBuilder {
    config: ServiceConfig,
    transports: Vec<Arc<dyn TransportAdapter>>,
}

impl FleetBuilder {
    /// Register an extra adapter. One of kind HTTP replaces the built-in one.
    pub fn with_transport(mut self, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.transports.push(adapter);
        self
    }

    /// Open storage, seed the registry and catalog and start the supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be opened, a firmware image cannot
    /// be read or a device preference is unusable.
    pub async fn build(self) -> Result<Fleet> {
        let config = self.config;

        let store: Arc<dyn BundleStore> = match &config.bundle_store.dir {
            Some(dir) => Arc::new(
                FileBundleStore::open(dir.clone())
                    .await
                    .with_context(|| format!("Failed to open bundle store at {}", dir.display()))?,
            ),
            None => Arc::new(InMemoryBundleStore::new()),
        };

        let ledger = Arc::new(
            ConfigurationLedger::open(LedgerConfig {
                directory: config.ledger.path.clone(),
            })
            .await
            .context("Failed to open configuration ledger")?,
        );

        let catalog = Arc::new(InMemoryFirmwareCatalog::new());
        for entry in &config.firmware {
            let image = tokio::fs::read(&entry.image).await.with_context(|| {
                format!("Failed to read firmware image {}", entry.image.display())
            })?;
            store
                .put(&image)
                .await
                .with_context(|| format!("Failed to store firmware image {}", entry.id))?;

            let mut firmware = Firmware::describe(
                entry.id.clone(),
                entry.name.clone(),
                entry.version.clone(),
                entry.device_type.clone(),
                &image,
            );
            firmware.is_production = entry.production;
            firmware.changelog.clone_from(&entry.changelog);
            catalog.insert(firmware);
        }

        let registry = Arc::new(InMemoryDeviceRegistry::new());
        for entry in &config.devices {
            let mut device = Device::new(entry.id.clone(), entry.device_type.clone());
            device.firmware_id = entry.firmware_id.clone().map(FirmwareId::new);
            device.firmware_version = entry.firmware_version.clone().or_else(|| {
                config
                    .firmware
                    .iter()
                    .find(|f| Some(&f.id) == entry.firmware_id.as_ref())
                    .map(|f| f.version.to_string())
            });
            device.configuration_version = match ledger.latest_deployed(&entry.id).await {
                Some(row) => Some(row.version),
                None => entry.configuration_version,
            };
            registry.upsert(device);
        }

        let http = Arc::new(
            HttpTransport::new(
                HttpTransportConfig::default()
                    .with_request_timeout(Duration::from_secs(config.http.request_timeout_secs))
                    .with_polling_interval(Duration::from_millis(config.http.polling_interval_ms)),
            )
            .context("Failed to build HTTP client")?,
        );
        let mut transports = TransportRegistry::new().with(http.clone());
        for adapter in self.transports {
            transports.register(adapter);
        }

        let resolver = Arc::new(PreferenceResolver::with_default(
            transports,
            DefaultPreference {
                channels: config.default_policy.channels.clone(),
                policy: config.default_policy.policy(),
            },
        ));
        for entry in &config.devices {
            let Some(pref) = entry.preference() else {
                continue;
            };
            if let Some(channel) = &pref.http {
                let mut endpoint = HttpEndpoint::new(channel.base_url.clone());
                if let Some(token) = &channel.auth_token {
                    endpoint = endpoint.with_auth_token(token.clone());
                }
                if let Some(interval) = channel.polling_interval {
                    endpoint = endpoint.with_polling_interval(interval);
                }
                http.register_device(entry.id.clone(), endpoint);
            }
            resolver
                .set_preference(pref)
                .map_err(|errors| ServiceError::from(ConfigError::Invalid(errors)))?;
        }

        let mut supervisor_config = SupervisorConfig::default()
            .with_max_concurrent_sessions(config.supervisor.max_concurrent_sessions)
            .with_require_production_firmware(config.supervisor.require_production_firmware)
            .with_default_options(config.update_options());
        supervisor_config.event_capacity = config.supervisor.event_capacity;
        if let Some(secs) = config.supervisor.reboot_timeout_secs {
            supervisor_config = supervisor_config.with_reboot_timeout(Duration::from_secs(secs));
        }

        let supervisor = Supervisor::new(
            RolloutServices {
                registry: registry.clone(),
                catalog: catalog.clone(),
                store: store.clone(),
                ledger: ledger.clone(),
                resolver,
            },
            supervisor_config,
        );

        info!(
            devices = config.devices.len(),
            firmware = config.firmware.len(),
            persistent_ledger = config.ledger.path.is_some(),
            "Fleet ready"
        );

        Ok(Fleet {
            config,
            supervisor,
            registry,
            catalog,
            ledger,
            store,
        })
    }
}

/// The supervisor together with the services it was built over.
pub struct Fleet {
    config: ServiceConfig,
    supervisor: Supervisor,
    registry: Arc<InMemoryDeviceRegistry>,
    catalog: Arc<InMemoryFirmwareCatalog>,
    ledger: Arc<ConfigurationLedger>,
    store: Arc<dyn BundleStore>,
}

impl Fleet {
    /// Start building from a configuration.
    pub fn builder(config: ServiceConfig) -> FleetBuilder {
        FleetBuilder {
            config,
            transports: Vec::new(),
        }
    }

    /// The session supervisor.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// The configuration ledger.
    pub fn ledger(&self) -> &ConfigurationLedger {
        &self.ledger
    }

    /// The configuration the fleet was built from.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Devices as currently recorded, in configuration order.
    pub fn devices(&self) -> Vec<Device> {
        self.config
            .devices
            .iter()
            .filter_map(|entry| self.registry.device(&entry.id))
            .collect()
    }

    /// Firmware records a device's hardware family can take.
    pub fn firmware_for(&self, device_type: &str) -> Vec<Firmware> {
        self.catalog.for_device_type(device_type)
    }

    /// Find a configuration row by version number or row id, and make sure
    /// its bundle is in the store.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::VersionNotFound`] when no row matches.
    pub async fn stage_configuration(
        &self,
        device_id: &str,
        selector: &str,
    ) -> Result<ConfigurationVersion> {
        let row = match selector.parse::<u64>() {
            Ok(version) => self
                .ledger
                .history(device_id)
                .await
                .into_iter()
                .find(|row| row.version == version),
            Err(_) => match selector.parse::<VersionId>() {
                Ok(id) => self
                    .ledger
                    .get(id)
                    .await
                    .filter(|row| row.device_id == device_id),
                Err(_) => None,
            },
        };
        let row = row.ok_or_else(|| {
            ServiceError::VersionNotFound(format!("{device_id} version {selector}"))
        })?;

        self.store
            .put(&fleetline_ledger::bundle_bytes(&row.bundle))
            .await
            .context("Failed to stage configuration bundle")?;
        Ok(row)
    }

    /// Run one rollout to its end, handing every event of the session to
    /// `on_event`. Ctrl-C cancels the session and keeps waiting for it to
    /// settle.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollout fails preflight.
    pub async fn run_rollout(
        &self,
        device_id: &str,
        bundle: BundleRef,
        options: UpdateOptions,
        mut on_event: impl FnMut(&SessionEvent),
    ) -> Result<UpdateSession> {
        let mut events = self.supervisor.subscribe_events();
        let update_type = bundle.update_type();
        let handle = self
            .supervisor
            .start_rollout_with_options(device_id, update_type, bundle, options)
            .await?;

        let mut interrupted = false;
        let outcome = loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) if event.session_id == handle.id => on_event(&event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %handle.id, skipped, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => break handle.wait().await,
                },
                outcome = handle.wait() => break outcome,
                signal = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    if signal.is_ok() {
                        info!(session_id = %handle.id, "Interrupted, cancelling rollout");
                        self.supervisor.cancel_rollout(&handle).await;
                    }
                }
            }
        };

        outcome.ok_or_else(|| anyhow::anyhow!("Session {} ended without an outcome", handle.id))
    }

    /// Stop all sessions.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

/// Error describing a session that did not complete, `None` on success.
pub fn outcome_error(session: &UpdateSession) -> Option<ServiceError> {
    match session.state {
        SessionState::Completed => None,
        state => Some(ServiceError::RolloutEnded {
            state,
            detail: session
                .failure
                .as_ref()
                .map_or_else(|| "no failure recorded".to_string(), ToString::to_string),
        }),
    }
}
