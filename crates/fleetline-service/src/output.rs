//! Output formatting for fleetlined commands

use anyhow::Error;
use fleetline_ledger::ConfigurationVersion;
use fleetline_rollout::{BundleRef, Device, SessionEvent, SessionEventKind, UpdateSession};
use fleetline_transport::TransportKind;
use serde::Serialize;
use serde_json::json;

use crate::config::ServiceConfig;

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to format output as JSON: {e}"),
    }
}

/// Print error in JSON format
pub fn print_error_json(error: &Error) {
    print_json(&json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "exit_code": crate::error::exit_code(error),
        }
    }));
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("Error: {error}");

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  Caused by: {err}");
        source = err.source();
    }
}

/// Print a summary of a loaded configuration
pub fn print_config_summary(config: &ServiceConfig, json: bool) {
    if json {
        print_json(&json!({ "success": true, "config": config }));
        return;
    }

    let channels: Vec<&str> = config
        .default_policy
        .channels
        .iter()
        .map(|k| k.as_str())
        .collect();
    println!("Configuration OK");
    println!("  Devices:          {}", config.devices.len());
    println!("  Firmware images:  {}", config.firmware.len());
    println!("  Default channels: {}", channels.join(", "));
    println!(
        "  Ledger:           {}",
        config
            .ledger
            .path
            .as_ref()
            .map_or_else(|| "in memory".to_string(), |p| p.display().to_string())
    );
    println!(
        "  Bundle store:     {}",
        config
            .bundle_store
            .dir
            .as_ref()
            .map_or_else(|| "in memory".to_string(), |p| p.display().to_string())
    );
}

/// Print the device list
pub fn print_devices(devices: &[Device], json: bool) {
    if json {
        print_json(&json!({ "success": true, "devices": devices }));
        return;
    }
    if devices.is_empty() {
        println!("No devices configured");
        return;
    }
    for device in devices {
        println!("{}", format_device(device));
    }
}

fn format_device(device: &Device) -> String {
    format!(
        "{} ({}) firmware {} configuration {}",
        device.id,
        device.device_type,
        device.firmware_version.as_deref().unwrap_or("-"),
        device
            .configuration_version
            .map_or_else(|| "-".to_string(), |v| format!("v{v}")),
    )
}

/// Print a device's ledger rows
pub fn print_history(device_id: &str, rows: &[ConfigurationVersion], json: bool) {
    if json {
        print_json(&json!({ "success": true, "device_id": device_id, "versions": rows }));
        return;
    }
    if rows.is_empty() {
        println!("No configuration versions for {device_id}");
        return;
    }
    println!("Configuration versions for {device_id}:");
    for row in rows {
        println!("  {}", format_row(row));
    }
}

fn format_row(row: &ConfigurationVersion) -> String {
    let mut line = format!("v{:<4} {:<12}", row.version, row.deployment_status.to_string());
    if row.is_rollback {
        match row.rollback_source {
            Some(source) => line.push_str(&format!(" rollback of v{source}")),
            None => line.push_str(" rollback"),
        }
    }
    if let Some(reason) = &row.failure_reason {
        line.push_str(&format!(" ({reason})"));
    }
    if let Some(log) = &row.change_log {
        line.push_str(&format!(" - {log}"));
    }
    line
}

/// Print a newly proposed row
pub fn print_proposed(row: &ConfigurationVersion, json: bool) {
    if json {
        print_json(&json!({ "success": true, "version": row }));
    } else {
        println!(
            "Proposed configuration v{} for {} ({})",
            row.version, row.device_id, row.id
        );
    }
}

/// Print a passed dry run
pub fn print_preflight(device_id: &str, bundle: &BundleRef, json: bool) {
    if json {
        print_json(&json!({
            "success": true,
            "dry_run": true,
            "device_id": device_id,
            "update_type": bundle.update_type(),
            "bundle": bundle.to_string(),
        }));
    } else {
        println!("Preflight passed for {bundle} on {device_id}");
    }
}

/// Print one session event as it arrives
pub fn print_event(event: &SessionEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("Failed to format event as JSON: {e}"),
        }
    } else {
        println!("{}", format_event(event));
    }
}

/// One-line human rendering of an event.
pub fn format_event(event: &SessionEvent) -> String {
    match &event.kind {
        SessionEventKind::Created {
            target_version,
            expected_duration,
        } => format!(
            "{}: {} session created, target {target_version}, about {}s",
            event.device_id,
            event.update_type,
            expected_duration.as_secs()
        ),
        SessionEventKind::StateChanged {
            from,
            to,
            transport,
            failure,
            ..
        } => {
            let mut line = format!("{}: {from} -> {to}", event.device_id);
            if let Some(kind) = transport {
                line.push_str(&format!(" via {kind}"));
            }
            if let Some(failure) = failure {
                line.push_str(&format!(" [{failure}]"));
            }
            line
        }
        SessionEventKind::TransferProgress {
            transport,
            chunks_sent,
            total_chunks,
            bytes_sent,
            total_bytes,
            rollback,
        } => format!(
            "{}: {} chunk {chunks_sent}/{total_chunks} ({bytes_sent}/{total_bytes} bytes) via {transport}",
            event.device_id,
            if *rollback { "rollback" } else { "transfer" },
        ),
        SessionEventKind::RetryScheduled {
            transport,
            attempt,
            max_attempts,
            error,
        } => format!(
            "{}: attempt {attempt}/{max_attempts} on {transport} failed: {error}",
            event.device_id
        ),
    }
}

/// Print a finished session
pub fn print_outcome(session: &UpdateSession, json: bool) {
    if json {
        print_json(&json!({
            "success": session.failure.is_none(),
            "session": session,
        }));
        return;
    }
    println!("{}", format_outcome(session));
}

fn format_outcome(session: &UpdateSession) -> String {
    let mut out = format!(
        "Session {} for {} ended in {}",
        session.id, session.device_id, session.state
    );
    if let Some(kind) = session.transport {
        out.push_str(&format!(" (last transport {kind})"));
    }
    if let Some(failure) = &session.failure {
        out.push_str(&format!("\n  Failure ({}): {failure}", failure.severity()));
        if failure.severity().needs_operator() {
            out.push_str("\n  Operator attention required");
        }
    }
    out
}

/// Print per-transport reachability
pub fn print_reachability(device_id: &str, report: &[(TransportKind, bool)], json: bool) {
    if json {
        let transports: Vec<_> = report
            .iter()
            .map(|(kind, reachable)| json!({ "transport": kind, "reachable": reachable }))
            .collect();
        print_json(&json!({
            "success": true,
            "device_id": device_id,
            "transports": transports,
        }));
        return;
    }
    println!("Reachability of {device_id}:");
    for (kind, reachable) in report {
        println!(
            "  {kind:<5} {}",
            if *reachable { "reachable" } else { "unreachable" }
        );
    }
}
