//! Devices, firmware records and the options a rollout is started with

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetline_ledger::VersionId;
use fleetline_transport::UpdateKind;
use fleetline_transport::protocol::sha256_hex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a session delivers.
pub type UpdateType = UpdateKind;

/// Identifier of a firmware record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirmwareId(String);

impl FirmwareId {
    /// Wrap an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FirmwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FirmwareId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of one update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connectivity as last reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Seen recently
    Online,
    /// Not seen recently
    #[default]
    Offline,
}

/// A managed device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device id
    pub id: String,
    /// Hardware family, matched against firmware `device_type`
    pub device_type: String,
    /// Firmware record currently installed
    #[serde(default)]
    pub firmware_id: Option<FirmwareId>,
    /// Version label of the installed firmware
    #[serde(default)]
    pub firmware_version: Option<String>,
    /// Configuration version currently applied
    #[serde(default)]
    pub configuration_version: Option<u64>,
    /// Last known connectivity
    #[serde(default)]
    pub status: DeviceStatus,
}

impl Device {
    /// Device with no firmware or configuration recorded.
    pub fn new(id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
            firmware_id: None,
            firmware_version: None,
            configuration_version: None,
            status: DeviceStatus::Online,
        }
    }

    /// Record installed firmware.
    pub fn with_firmware(mut self, firmware: &Firmware) -> Self {
        self.firmware_id = Some(firmware.id.clone());
        self.firmware_version = Some(firmware.version.to_string());
        self
    }

    /// Record the applied configuration version.
    pub fn with_configuration_version(mut self, version: u64) -> Self {
        self.configuration_version = Some(version);
        self
    }
}

/// A firmware image known to the catalog. The image bytes live in the
/// bundle store under `checksum`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware {
    /// Record id
    pub id: FirmwareId,
    /// Display name
    pub name: String,
    /// Image version
    pub version: semver::Version,
    /// Hardware family the image targets
    pub device_type: String,
    /// Lowercase hex sha256 of the image
    pub checksum: String,
    /// Image size in bytes
    pub size: u64,
    /// Release notes
    #[serde(default)]
    pub changelog: Option<String>,
    /// Whether the image is cleared for production devices
    #[serde(default)]
    pub is_production: bool,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl Firmware {
    /// Describe an image, computing checksum and size from its bytes.
    pub fn describe(
        id: impl Into<FirmwareId>,
        name: impl Into<String>,
        version: semver::Version,
        device_type: impl Into<String>,
        image: &[u8],
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version,
            device_type: device_type.into(),
            checksum: sha256_hex(image),
            size: u64::try_from(image.len()).unwrap_or(u64::MAX),
            changelog: None,
            is_production: false,
            created_at: Utc::now(),
        }
    }

    /// Mark the image production ready.
    pub fn production(mut self) -> Self {
        self.is_production = true;
        self
    }

    /// Attach release notes.
    pub fn with_changelog(mut self, changelog: impl Into<String>) -> Self {
        self.changelog = Some(changelog.into());
        self
    }
}

impl From<String> for FirmwareId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Reference to the bundle a session delivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BundleRef {
    /// A firmware record
    Firmware(FirmwareId),
    /// A configuration ledger row
    Configuration(VersionId),
}

impl BundleRef {
    /// Kind of update this reference implies.
    pub fn update_type(&self) -> UpdateType {
        match self {
            BundleRef::Firmware(_) => UpdateKind::Firmware,
            BundleRef::Configuration(_) => UpdateKind::Configuration,
        }
    }
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleRef::Firmware(id) => write!(f, "firmware:{id}"),
            BundleRef::Configuration(id) => write!(f, "configuration:{id}"),
        }
    }
}

/// Per-rollout knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateOptions {
    /// Bytes per chunk command
    pub chunk_size: usize,
    /// Skip the device-type and production checks
    pub force: bool,
    /// Accept the version announced after restart instead of sending a
    /// separate verify command
    pub skip_verification: bool,
    /// Overall session deadline, measured from the moment the session holds
    /// its device lock
    #[serde(with = "duration_serde")]
    pub update_timeout: Duration,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            force: false,
            skip_verification: false,
            update_timeout: Duration::from_secs(300),
        }
    }
}

impl UpdateOptions {
    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Bypass compatibility checks.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Trust the restart announcement.
    pub fn with_skip_verification(mut self, skip: bool) -> Self {
        self.skip_verification = skip;
        self
    }

    /// Set the session deadline.
    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }
}

/// Whole-second serde for `Duration`.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&d.as_secs()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
        }
    }
}
