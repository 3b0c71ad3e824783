//! Device commands

use anyhow::Result;
use fleetline_service::error::ServiceError;
use fleetline_service::{Fleet, output};

/// List configured devices with their recorded versions
pub fn list(fleet: &Fleet, json: bool) {
    output::print_devices(&fleet.devices(), json);
}

/// Probe every transport the device would be updated through
pub async fn reachability(fleet: &Fleet, device: &str, json: bool) -> Result<()> {
    if !fleet.devices().iter().any(|d| d.id == device) {
        return Err(ServiceError::DeviceNotFound(device.to_string()).into());
    }
    let report = fleet.supervisor().reachability(device).await?;
    output::print_reachability(device, &report, json);
    Ok(())
}
