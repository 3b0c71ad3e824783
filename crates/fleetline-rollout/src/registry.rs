//! Device registry and firmware catalog seams
//!
//! Both are owned by the surrounding system; the supervisor reads devices and
//! firmware records through them and writes back the version pointers a
//! terminal session settles on.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use parking_lot::RwLock;
use tracing::debug;

use crate::model::{Device, DeviceStatus, Firmware, FirmwareId};

/// Source of truth for devices and their version pointers.
#[async_trait::async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Look up a device.
    async fn get(&self, device_id: &str) -> Result<Option<Device>>;

    /// List all devices of a hardware family.
    async fn list_devices(&self, device_type: &str) -> Result<Vec<String>>;

    /// Point the device at a firmware record.
    async fn record_firmware(
        &self,
        device_id: &str,
        firmware_id: &FirmwareId,
        version: &str,
    ) -> Result<()>;

    /// Point the device at a configuration version.
    async fn record_configuration(&self, device_id: &str, version: u64) -> Result<()>;
}

/// Firmware records available for rollout.
#[async_trait::async_trait]
pub trait FirmwareCatalog: Send + Sync {
    /// Look up a firmware record.
    async fn get(&self, firmware_id: &FirmwareId) -> Result<Option<Firmware>>;
}

/// Device registry held in memory.
#[derive(Default)]
pub struct InMemoryDeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
}

impl InMemoryDeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device.
    pub fn upsert(&self, device: Device) {
        self.devices.write().insert(device.id.clone(), device);
    }

    /// Update connectivity.
    pub fn set_status(&self, device_id: &str, status: DeviceStatus) -> bool {
        match self.devices.write().get_mut(device_id) {
            Some(device) => {
                device.status = status;
                true
            }
            None => false,
        }
    }

    /// Snapshot of a device.
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.read().get(device_id).cloned()
    }
}

#[async_trait::async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn get(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.device(device_id))
    }

    async fn list_devices(&self, device_type: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .devices
            .read()
            .values()
            .filter(|d| d.device_type == device_type)
            .map(|d| d.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn record_firmware(
        &self,
        device_id: &str,
        firmware_id: &FirmwareId,
        version: &str,
    ) -> Result<()> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| anyhow!("unknown device {device_id}"))?;
        device.firmware_id = Some(firmware_id.clone());
        device.firmware_version = Some(version.to_string());
        debug!(device_id = %device_id, firmware_id = %firmware_id, version = %version, "Recorded firmware");
        Ok(())
    }

    async fn record_configuration(&self, device_id: &str, version: u64) -> Result<()> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| anyhow!("unknown device {device_id}"))?;
        device.configuration_version = Some(version);
        debug!(device_id = %device_id, version, "Recorded configuration");
        Ok(())
    }
}

/// Firmware catalog held in memory.
#[derive(Default)]
pub struct InMemoryFirmwareCatalog {
    firmware: RwLock<HashMap<FirmwareId, Firmware>>,
}

impl InMemoryFirmwareCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a record.
    pub fn insert(&self, firmware: Firmware) {
        self.firmware.write().insert(firmware.id.clone(), firmware);
    }

    /// Records targeting a hardware family, newest version first.
    pub fn for_device_type(&self, device_type: &str) -> Vec<Firmware> {
        let mut records: Vec<Firmware> = self
            .firmware
            .read()
            .values()
            .filter(|f| f.device_type == device_type)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.version.cmp(&a.version));
        records
    }
}

#[async_trait::async_trait]
impl FirmwareCatalog for InMemoryFirmwareCatalog {
    async fn get(&self, firmware_id: &FirmwareId) -> Result<Option<Firmware>> {
        Ok(self.firmware.read().get(firmware_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_pointers() -> Result<()> {
        let registry = InMemoryDeviceRegistry::new();
        registry.upsert(Device::new("dev-1", "thermo"));

        registry
            .record_firmware("dev-1", &FirmwareId::new("fw-2"), "2.0.0")
            .await?;
        registry.record_configuration("dev-1", 7).await?;

        let device = registry.get("dev-1").await?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(device.firmware_id, Some(FirmwareId::new("fw-2")));
        assert_eq!(device.firmware_version.as_deref(), Some("2.0.0"));
        assert_eq!(device.configuration_version, Some(7));

        let missing = registry.record_configuration("ghost", 1).await;
        assert!(matches!(missing, Err(e) if e.to_string().contains("ghost")));
        Ok(())
    }

    #[tokio::test]
    async fn test_catalog_orders_newest_first() -> Result<()> {
        let catalog = InMemoryFirmwareCatalog::new();
        for (id, minor) in [("a", 1), ("b", 3), ("c", 2)] {
            catalog.insert(Firmware::describe(
                id,
                "sensor",
                semver::Version::new(1, minor, 0),
                "thermo",
                id.as_bytes(),
            ));
        }

        let ids: Vec<String> = catalog
            .for_device_type("thermo")
            .into_iter()
            .map(|f| f.id.to_string())
            .collect();
        assert_eq!(ids, ["b", "c", "a"]);
        assert!(catalog.get(&FirmwareId::new("b")).await?.is_some());
        Ok(())
    }
}
