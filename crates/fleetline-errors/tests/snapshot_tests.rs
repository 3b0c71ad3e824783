//! Snapshot tests for operator-facing error text.

use fleetline_errors::{FailureClass, ValidationError};
use insta::assert_snapshot;

#[test]
fn test_validation_messages() {
    let messages = [
        ValidationError::missing("default_policy.channels"),
        ValidationError::duplicate("devices.id", "thermo-01"),
        ValidationError::not_positive("default_policy.retry_interval_secs"),
        ValidationError::dangling("devices.firmware_id", "thermo-01", "fw-9"),
    ]
    .map(|e| e.to_string());
    assert_snapshot!(messages.join("\n"), @r"
    default_policy.channels is required
    devices.id lists 'thermo-01' more than once
    default_policy.retry_interval_secs must be greater than zero
    devices.firmware_id of thermo-01 names fw-9, which is not defined
    ");
}

#[test]
fn test_severity_labels() {
    let labels: Vec<String> = FailureClass::ALL
        .iter()
        .map(|c| format!("{c}={}", c.severity()))
        .collect();
    assert_snapshot!(labels.join("\n"), @r"
    transient_channel=WARN
    protocol_rejection=ERROR
    integrity=CRITICAL
    device_state=ERROR
    rollback_failure=CRITICAL
    configuration=ERROR
    cancelled=INFO
    ");
}
