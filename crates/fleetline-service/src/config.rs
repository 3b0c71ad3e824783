//! `fleetlined` configuration file
//!
//! Every section has defaults, so an empty file describes a memory-only
//! service reaching devices over HTTP.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetline_errors::ValidationError;
use fleetline_rollout::{CommunicationPreference, RetryPolicy, UpdateOptions};
use fleetline_transport::TransportKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to produce a usable [`ServiceConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The file parsed but describes an unusable service
    #[error("Invalid configuration: {}", join(.0))]
    Invalid(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Session supervision limits and per-rollout defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSection {
    /// Sessions allowed to run at once across the fleet
    pub max_concurrent_sessions: usize,
    /// Overall deadline of one session
    pub update_timeout_secs: u64,
    /// Wait for the device to come back after restart; the channel's
    /// connection timeout when unset
    pub reboot_timeout_secs: Option<u64>,
    /// Bytes per transfer chunk
    pub chunk_size: usize,
    /// Event stream buffer
    pub event_capacity: usize,
    /// Refuse firmware not flagged for production unless forced
    pub require_production_firmware: bool,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 64,
            update_timeout_secs: 300,
            reboot_timeout_secs: None,
            chunk_size: 4096,
            event_capacity: 1000,
            require_production_firmware: false,
        }
    }
}

/// Channel order and retry policy for devices without their own preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    /// Channels in priority order
    pub channels: Vec<TransportKind>,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wait between attempts
    pub retry_interval_secs: u64,
    /// Reply timeout per command
    pub connection_timeout_secs: u64,
}

impl Default for PolicySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            channels: vec![TransportKind::Http],
            max_retries: policy.max_retries,
            retry_interval_secs: policy.retry_interval.as_secs(),
            connection_timeout_secs: policy.connection_timeout.as_secs(),
        }
    }
}

impl PolicySection {
    /// Policy the section describes.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
        }
    }
}

/// Ledger persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerSection {
    /// Directory of per-device ledger files; memory only when unset
    pub path: Option<PathBuf>,
}

/// Bundle storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundleStoreSection {
    /// Directory of stored bundles; memory only when unset
    pub dir: Option<PathBuf>,
}

/// HTTP adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSection {
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Ack polling interval for endpoints that set none
    pub polling_interval_ms: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            polling_interval_ms: 1000,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// A device seeded into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    /// Device id
    pub id: String,
    /// Hardware family
    pub device_type: String,
    /// Firmware record installed, an id from the `firmware` section
    #[serde(default)]
    pub firmware_id: Option<String>,
    /// Installed firmware version label, taken from the firmware record when
    /// unset
    #[serde(default)]
    pub firmware_version: Option<String>,
    /// Applied configuration version; the ledger's latest deployed row wins
    /// when there is one
    #[serde(default)]
    pub configuration_version: Option<u64>,
    /// Stored communication preference; `deviceId` may be omitted
    #[serde(default)]
    pub communication: Option<CommunicationPreference>,
}

impl DeviceEntry {
    /// The entry's preference, owned by this device.
    pub fn preference(&self) -> Option<CommunicationPreference> {
        self.communication.clone().map(|mut pref| {
            pref.device_id.clone_from(&self.id);
            pref
        })
    }
}

/// A firmware image published to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirmwareEntry {
    /// Record id
    pub id: String,
    /// Display name
    pub name: String,
    /// Image version
    pub version: semver::Version,
    /// Hardware family
    pub device_type: String,
    /// Image file, relative to the configuration file
    pub image: PathBuf,
    /// Cleared for production devices
    #[serde(default)]
    pub production: bool,
    /// Release notes
    #[serde(default)]
    pub changelog: Option<String>,
}

/// Top-level configuration of `fleetlined`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Supervisor limits
    pub supervisor: SupervisorSection,
    /// Fallback channel policy
    pub default_policy: PolicySection,
    /// Ledger persistence
    pub ledger: LedgerSection,
    /// Bundle storage
    pub bundle_store: BundleStoreSection,
    /// HTTP adapter
    pub http: HttpSection,
    /// Log output
    pub logging: LoggingSection,
    /// Registry seed
    pub devices: Vec<DeviceEntry>,
    /// Catalog seed
    pub firmware: Vec<FirmwareEntry>,
}

impl ServiceConfig {
    /// Parse YAML without validating.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read, parse and validate a file. Relative paths inside it are
    /// resolved against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable, malformed or invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&content)?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }

        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(path) = self.ledger.path.as_mut() {
            resolve(path);
        }
        if let Some(dir) = self.bundle_store.dir.as_mut() {
            resolve(dir);
        }
        for firmware in &mut self.firmware {
            resolve(&mut firmware.image);
        }
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let sup = &self.supervisor;
        if sup.max_concurrent_sessions == 0 {
            errors.push(ValidationError::not_positive("supervisor.max_concurrent_sessions"));
        }
        if sup.chunk_size == 0 {
            errors.push(ValidationError::not_positive("supervisor.chunk_size"));
        }
        if sup.update_timeout_secs == 0 {
            errors.push(ValidationError::not_positive("supervisor.update_timeout_secs"));
        }
        if sup.reboot_timeout_secs == Some(0) {
            errors.push(ValidationError::not_positive("supervisor.reboot_timeout_secs"));
        }
        if sup.event_capacity == 0 {
            errors.push(ValidationError::not_positive("supervisor.event_capacity"));
        }

        let policy = &self.default_policy;
        if policy.channels.is_empty() {
            errors.push(ValidationError::missing("default_policy.channels"));
        }
        for (i, kind) in policy.channels.iter().enumerate() {
            if policy.channels.iter().take(i).any(|k| k == kind) {
                errors.push(ValidationError::duplicate(
                    "default_policy.channels",
                    kind.as_str(),
                ));
            }
        }
        if policy.retry_interval_secs == 0 {
            errors.push(ValidationError::not_positive("default_policy.retry_interval_secs"));
        }
        if policy.connection_timeout_secs == 0 {
            errors.push(ValidationError::not_positive("default_policy.connection_timeout_secs"));
        }

        if self.http.polling_interval_ms == 0 {
            errors.push(ValidationError::not_positive("http.polling_interval_ms"));
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                errors.push(ValidationError::missing("devices.id"));
            } else if !device_ids.insert(device.id.as_str()) {
                errors.push(ValidationError::duplicate("devices.id", &device.id));
            }
            if let Some(pref) = device.preference() {
                let prefix = format!("devices[{}].communication", device.id);
                errors.extend(pref.validate().into_iter().map(|e| e.nested_under(&prefix)));
            }
        }

        let mut firmware_ids = HashSet::new();
        for firmware in &self.firmware {
            if !firmware_ids.insert(firmware.id.as_str()) {
                errors.push(ValidationError::duplicate("firmware.id", &firmware.id));
            }
        }
        for device in &self.devices {
            if let Some(id) = &device.firmware_id
                && !firmware_ids.contains(id.as_str())
            {
                errors.push(ValidationError::dangling("devices.firmware_id", &device.id, id));
            }
        }

        errors
    }

    /// Options every rollout starts from.
    pub fn update_options(&self) -> UpdateOptions {
        UpdateOptions::default()
            .with_chunk_size(self.supervisor.chunk_size)
            .with_update_timeout(Duration::from_secs(self.supervisor.update_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_valid() -> Result<(), ConfigError> {
        let config = ServiceConfig::from_yaml("")?;
        assert_eq!(config, ServiceConfig::default());
        assert!(config.validate().is_empty());
        assert_eq!(config.default_policy.channels, [TransportKind::Http]);
        assert_eq!(config.default_policy.policy(), RetryPolicy::default());
        Ok(())
    }

    #[test]
    fn test_partial_sections_keep_defaults() -> Result<(), ConfigError> {
        let config = ServiceConfig::from_yaml(
            r#"
supervisor:
  chunk_size: 1024
default_policy:
  channels: [mqtt, http]
"#,
        )?;
        assert_eq!(config.supervisor.chunk_size, 1024);
        assert_eq!(config.supervisor.max_concurrent_sessions, 64);
        assert_eq!(
            config.default_policy.channels,
            [TransportKind::Mqtt, TransportKind::Http]
        );
        assert_eq!(config.default_policy.max_retries, 3);
        assert_eq!(config.update_options().chunk_size, 1024);
        Ok(())
    }

    #[test]
    fn test_device_preference_takes_entry_id() -> Result<(), ConfigError> {
        let config = ServiceConfig::from_yaml(
            r#"
devices:
  - id: thermo-01
    device_type: thermostat
    communication:
      preferredChannels: [http]
      http:
        baseUrl: http://10.0.0.5:8080
"#,
        )?;
        let pref = config.devices.first().and_then(DeviceEntry::preference);
        assert_eq!(pref.map(|p| p.device_id), Some("thermo-01".to_string()));
        assert!(config.validate().is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_values_are_reported() -> Result<(), ConfigError> {
        let config = ServiceConfig::from_yaml(
            r#"
supervisor:
  chunk_size: 0
default_policy:
  channels: []
  retry_interval_secs: 0
devices:
  - id: a
    device_type: t
    firmware_id: fw-missing
  - id: a
    device_type: t
"#,
        )?;
        let messages: Vec<String> = config.validate().iter().map(ToString::to_string).collect();
        insta::assert_snapshot!(messages.join("\n"), @r"
        supervisor.chunk_size must be greater than zero
        default_policy.channels is required
        default_policy.retry_interval_secs must be greater than zero
        devices.id lists 'a' more than once
        devices.firmware_id of a names fw-missing, which is not defined
        ");
        Ok(())
    }

    #[test]
    fn test_preference_problems_name_their_device() -> Result<(), ConfigError> {
        let config = ServiceConfig::from_yaml(
            r#"
devices:
  - id: hub-2
    device_type: hub
    communication:
      preferredChannels: [mqtt, mqtt]
"#,
        )?;
        let messages: Vec<String> = config.validate().iter().map(ToString::to_string).collect();
        assert_eq!(
            messages,
            ["devices[hub-2].communication.preferredChannels lists 'mqtt' more than once"]
        );
        Ok(())
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let parsed = ServiceConfig::from_yaml("supervisor:\n  max_sessions: 4\n");
        assert!(matches!(parsed, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_resolves_relative_paths() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fleetline.yaml");
        std::fs::write(
            &path,
            r#"
bundle_store:
  dir: bundles
firmware:
  - id: fw-1
    name: Thermostat
    version: 1.2.0
    device_type: thermostat
    image: images/fw-1.bin
"#,
        )?;

        let config = ServiceConfig::load(&path)?;
        assert_eq!(config.bundle_store.dir, Some(dir.path().join("bundles")));
        let image = config.firmware.first().map(|f| f.image.clone());
        assert_eq!(image, Some(dir.path().join("images/fw-1.bin")));
        Ok(())
    }

    #[test]
    fn test_load_refuses_invalid_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fleetline.yaml");
        std::fs::write(&path, "http:\n  polling_interval_ms: 0\n")?;

        let loaded = ServiceConfig::load(&path);
        assert!(matches!(loaded, Err(ConfigError::Invalid(ref e)) if e.len() == 1));
        Ok(())
    }
}
