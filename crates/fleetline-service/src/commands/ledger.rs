//! Configuration ledger commands

use std::path::Path;

use anyhow::{Context, Result};
use fleetline_ledger::ConfigBundle;
use fleetline_service::error::ServiceError;
use fleetline_service::{Fleet, output};

use crate::commands::LedgerCommands;

/// Execute ledger command
pub async fn execute(cmd: &LedgerCommands, fleet: &Fleet, json: bool) -> Result<()> {
    match cmd {
        LedgerCommands::Show { device } => {
            let rows = fleet.ledger().history(device).await;
            output::print_history(device, &rows, json);
            Ok(())
        }
        LedgerCommands::Propose {
            device,
            bundle,
            change_log,
        } => {
            let bundle = read_bundle(bundle)?;
            let row = fleet
                .supervisor()
                .propose_configuration(device, bundle, change_log.clone())
                .await?;
            output::print_proposed(&row, json);
            Ok(())
        }
    }
}

/// Read a settings mapping. YAML is a superset of JSON, so one parser covers
/// both.
fn read_bundle(path: &Path) -> Result<ConfigBundle> {
    let content = std::fs::read_to_string(path)
        .map_err(ServiceError::from)
        .with_context(|| format!("Failed to read bundle {}", path.display()))?;
    let bundle: ConfigBundle = serde_yaml::from_str(&content).map_err(ServiceError::from)?;
    if bundle.is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "bundle {} has no settings",
            path.display()
        ))
        .into());
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bundle_accepts_yaml_and_json() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let yaml = dir.path().join("settings.yaml");
        std::fs::write(&yaml, "setpoint: 21.5\nmode: heat\n")?;
        let json = dir.path().join("settings.json");
        std::fs::write(&json, r#"{"mode": "heat", "setpoint": 21.5}"#)?;

        assert_eq!(read_bundle(&yaml)?, read_bundle(&json)?);
        Ok(())
    }

    #[test]
    fn test_read_bundle_refuses_empty_mapping() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty.yaml");
        std::fs::write(&path, "{}\n")?;

        let err = read_bundle(&path).err().map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.contains("has no settings")));
        Ok(())
    }
}
