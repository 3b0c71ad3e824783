//! Integration tests for fleetlined
//!
//! The binary is run against configuration files in temporary directories;
//! no device is contacted.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use fleetline_ledger::ConfigBundle;
use fleetline_rollout::{BundleRef, UpdateType};
use fleetline_service::{Fleet, ServiceConfig};
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Custom predicate to check if output is valid JSON
fn is_json() -> impl predicates::Predicate<[u8]> {
    predicates::function::function(|s: &[u8]| {
        std::str::from_utf8(s)
            .ok()
            .is_some_and(|text| serde_json::from_str::<Value>(text).is_ok())
    })
}

fn fleetlined() -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("fleetlined")?;
    cmd.env_remove("FLEETLINE_CONFIG").env_remove("RUST_LOG");
    Ok(cmd)
}

/// Config with one thermostat on HTTP, one firmware image and a persistent
/// ledger.
fn write_config(dir: &TempDir) -> Result<PathBuf, std::io::Error> {
    fs::create_dir_all(dir.path().join("images"))?;
    fs::write(dir.path().join("images/thermo-1.0.0.bin"), vec![0xA5u8; 3000])?;

    let path = dir.path().join("fleetline.yaml");
    fs::write(
        &path,
        r#"
supervisor:
  chunk_size: 1024
default_policy:
  channels: [http]
  max_retries: 0
  retry_interval_secs: 1
  connection_timeout_secs: 1
ledger:
  path: ledger
logging:
  filter: warn
firmware:
  - id: thermo-fw-1.0.0
    name: Thermostat firmware
    version: 1.0.0
    device_type: thermostat
    image: images/thermo-1.0.0.bin
    production: true
devices:
  - id: thermo-01
    device_type: thermostat
    firmware_id: thermo-fw-1.0.0
    communication:
      preferredChannels: [http]
      maxRetries: 0
      retryInterval: 1000
      connectionTimeout: 1000
      http:
        baseUrl: http://127.0.0.1:9
"#,
    )?;
    Ok(path)
}

fn write_bundle(dir: &Path, setpoint: f64) -> Result<PathBuf, std::io::Error> {
    let path = dir.join(format!("settings-{setpoint}.yaml"));
    fs::write(&path, format!("setpoint: {setpoint}\nmode: heat\n"))?;
    Ok(path)
}

#[test]
fn check_config_without_file_uses_defaults() -> TestResult {
    fleetlined()?
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("Default channels: http"));
    Ok(())
}

#[test]
fn check_config_json_is_parseable() -> TestResult {
    let dir = TempDir::new()?;
    let config = write_config(&dir)?;
    fleetlined()?
        .args(["--json", "check-config", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(is_json());
    Ok(())
}

#[test]
fn invalid_config_exits_with_validation_code() -> TestResult {
    let dir = TempDir::new()?;
    let path = dir.path().join("bad.yaml");
    fs::write(&path, "supervisor:\n  chunk_size: 0\n")?;

    fleetlined()?
        .arg("--config")
        .arg(&path)
        .arg("check-config")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("chunk_size must be greater than zero"));
    Ok(())
}

#[test]
fn devices_lists_seeded_registry() -> TestResult {
    let dir = TempDir::new()?;
    let config = write_config(&dir)?;
    fleetlined()?
        .arg("--config")
        .arg(&config)
        .arg("devices")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "thermo-01 (thermostat) firmware 1.0.0 configuration -",
        ));
    Ok(())
}

#[test]
fn proposed_versions_persist_between_runs() -> TestResult {
    let dir = TempDir::new()?;
    let config = write_config(&dir)?;

    for setpoint in [20.0, 21.5] {
        let bundle = write_bundle(dir.path(), setpoint)?;
        fleetlined()?
            .arg("--config")
            .arg(&config)
            .args(["ledger", "propose", "thermo-01"])
            .arg(&bundle)
            .args(["-m", "seasonal"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Proposed configuration"));
    }

    let output = fleetlined()?
        .arg("--config")
        .arg(&config)
        .args(["--json", "ledger", "show", "thermo-01"])
        .output()?;
    assert!(output.status.success());

    let body: Value = serde_json::from_slice(&output.stdout)?;
    let versions: Vec<(u64, String)> = body
        .get("versions")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    Some((
                        row.get("version")?.as_u64()?,
                        row.get("deploymentStatus")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(
        versions,
        [(1, "PENDING".to_string()), (2, "PENDING".to_string())]
    );
    Ok(())
}

#[test]
fn rollout_to_unknown_device_exits_with_not_found() -> TestResult {
    let dir = TempDir::new()?;
    let config = write_config(&dir)?;
    fleetlined()?
        .arg("--config")
        .arg(&config)
        .args(["rollout", "boiler-07", "--firmware", "thermo-fw-1.0.0"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("boiler-07"));
    Ok(())
}

#[test]
fn rollout_of_unknown_configuration_exits_with_version_code() -> TestResult {
    let dir = TempDir::new()?;
    let config = write_config(&dir)?;
    fleetlined()?
        .arg("--config")
        .arg(&config)
        .args(["rollout", "thermo-01", "--configuration", "9"])
        .assert()
        .code(3);
    Ok(())
}

#[test]
fn dry_run_checks_without_contacting_device() -> TestResult {
    let dir = TempDir::new()?;
    let config = write_config(&dir)?;
    fleetlined()?
        .arg("--config")
        .arg(&config)
        .args([
            "rollout",
            "thermo-01",
            "--firmware",
            "thermo-fw-1.0.0",
            "--dry-run",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Preflight passed"));
    Ok(())
}

#[test]
fn dry_run_json_reports_passed_preflight() -> TestResult {
    let dir = TempDir::new()?;
    let config = write_config(&dir)?;
    let output = fleetlined()?
        .arg("--config")
        .arg(&config)
        .args([
            "--json",
            "rollout",
            "thermo-01",
            "--firmware",
            "thermo-fw-1.0.0",
            "--dry-run",
        ])
        .output()?;
    assert!(output.status.success());

    let body: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(body.get("success"), Some(&Value::Bool(true)));
    assert_eq!(body.get("dry_run"), Some(&Value::Bool(true)));
    assert_eq!(body.get("device_id").and_then(Value::as_str), Some("thermo-01"));
    assert_eq!(body.get("update_type").and_then(Value::as_str), Some("firmware"));
    Ok(())
}

#[tokio::test]
async fn fleet_seeds_registry_catalog_and_store() -> TestResult {
    let dir = TempDir::new()?;
    let config = ServiceConfig::load(&write_config(&dir)?)?;
    let fleet = Fleet::builder(config).build().await?;

    let devices = fleet.devices();
    let thermo = devices.first().ok_or("no device")?;
    assert_eq!(thermo.firmware_version.as_deref(), Some("1.0.0"));
    assert_eq!(fleet.firmware_for("thermostat").len(), 1);

    let mut bundle = ConfigBundle::new();
    bundle.insert("setpoint".to_string(), serde_json::json!(19.0));
    let row = fleet
        .supervisor()
        .propose_configuration("thermo-01", bundle, None)
        .await?;

    let staged = fleet.stage_configuration("thermo-01", "1").await?;
    assert_eq!(staged.id, row.id);
    let by_id = fleet
        .stage_configuration("thermo-01", &row.id.to_string())
        .await?;
    assert_eq!(by_id.version, 1);

    fleet
        .supervisor()
        .preflight(
            "thermo-01",
            UpdateType::Configuration,
            &BundleRef::Configuration(row.id),
            &fleet.config().update_options(),
        )
        .await?;
    Ok(())
}
