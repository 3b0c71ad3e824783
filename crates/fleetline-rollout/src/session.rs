//! Update session records and the events they publish

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetline_errors::{ErrorSeverity, FailureClass};
use fleetline_transport::TransportKind;
use serde::{Deserialize, Serialize};

use crate::model::{BundleRef, SessionId, UpdateOptions, UpdateType, duration_serde};
use crate::state::{InvalidTransition, SessionState, Trigger};

/// Why a session ended somewhere other than `COMPLETED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    /// Failure class
    pub class: FailureClass,
    /// State the failure was observed in
    pub stage: SessionState,
    /// Human-readable detail
    pub detail: String,
    /// Failure that led here, when this one was raised while handling another
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl SessionFailure {
    /// New failure without a cause.
    pub fn new(class: FailureClass, stage: SessionState, detail: impl Into<String>) -> Self {
        Self {
            class,
            stage,
            detail: detail.into(),
            cause: None,
        }
    }

    /// Attach the failure that led here.
    pub fn caused_by(mut self, cause: Option<&SessionFailure>) -> Self {
        self.cause = cause.map(ToString::to_string);
        self
    }

    /// Severity of the class.
    pub fn severity(&self) -> ErrorSeverity {
        self.class.severity()
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.class, self.stage, self.detail)?;
        if let Some(cause) = &self.cause {
            write!(f, " (after {cause})")?;
        }
        Ok(())
    }
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Previous state
    pub from: SessionState,
    /// New state
    pub to: SessionState,
    /// What caused it
    pub trigger: Trigger,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// One attempt to push a device to a target bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSession {
    /// Session id
    pub id: SessionId,
    /// Target device
    pub device_id: String,
    /// What is delivered
    pub update_type: UpdateType,
    /// Bundle being installed
    pub bundle: BundleRef,
    /// Version label the device should report afterwards
    pub target_version: String,
    /// Current state
    pub state: SessionState,
    /// Transport currently or last in use
    pub transport: Option<TransportKind>,
    /// Delivery attempts per state
    pub attempts: BTreeMap<SessionState, u32>,
    /// Set once the session fails
    pub failure: Option<SessionFailure>,
    /// Options the session runs with
    pub options: UpdateOptions,
    /// Rough duration estimate for operators
    #[serde(with = "duration_serde")]
    pub expected_duration: Duration,
    /// Every transition, oldest first
    pub history: Vec<StateChange>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the state last changed
    pub last_transition_at: DateTime<Utc>,
    /// When a terminal state was reached
    pub completed_at: Option<DateTime<Utc>>,
}

impl UpdateSession {
    /// New session in `INITIATED`.
    pub fn new(
        device_id: impl Into<String>,
        bundle: BundleRef,
        target_version: impl Into<String>,
        options: UpdateOptions,
        expected_duration: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            device_id: device_id.into(),
            update_type: bundle.update_type(),
            bundle,
            target_version: target_version.into(),
            state: SessionState::Initiated,
            transport: None,
            attempts: BTreeMap::new(),
            failure: None,
            options,
            expected_duration,
            history: Vec::new(),
            created_at: now,
            last_transition_at: now,
            completed_at: None,
        }
    }

    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Deliveries attempted while in `state`.
    pub fn attempts_in(&self, state: SessionState) -> u32 {
        self.attempts.get(&state).copied().unwrap_or(0)
    }

    /// Run `trigger` through the state machine and record the result.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves the session untouched when the
    /// current state does not accept `trigger`.
    pub fn apply(&mut self, trigger: Trigger) -> Result<StateChange, InvalidTransition> {
        let to = self.state.on(trigger)?;
        let change = StateChange {
            from: self.state,
            to,
            trigger,
            at: Utc::now(),
        };
        self.state = to;
        self.last_transition_at = change.at;
        if to.is_terminal() {
            self.completed_at = Some(change.at);
        }
        self.history.push(change.clone());
        Ok(change)
    }

    /// Force `CRITICAL_FAILURE` when the machine itself refused a trigger
    /// the runner produced; the device state can no longer be reasoned about.
    pub(crate) fn escalate(&mut self, fault: InvalidTransition) {
        let now = Utc::now();
        self.failure = Some(SessionFailure::new(
            FailureClass::Configuration,
            self.state,
            fault.to_string(),
        ));
        self.state = SessionState::CriticalFailure;
        self.last_transition_at = now;
        self.completed_at = Some(now);
    }

    pub(crate) fn count_attempt(&mut self) {
        let count = self.attempts.entry(self.state).or_insert(0);
        *count = count.saturating_add(1);
    }
}

/// Estimated wall time of a transfer: one second per chunk plus a fixed 30 s
/// for validate, apply, restart and verify.
pub fn expected_duration(total_chunks: u32) -> Duration {
    Duration::from_secs(u64::from(total_chunks).saturating_add(30))
}

/// Published on the supervisor's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Session
    pub session_id: SessionId,
    /// Device
    pub device_id: String,
    /// What is delivered
    pub update_type: UpdateType,
    /// When the event was raised
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub kind: SessionEventKind,
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    /// Session accepted
    Created {
        /// Version label being installed
        target_version: String,
        /// Duration estimate
        #[serde(with = "duration_serde")]
        expected_duration: Duration,
    },
    /// State changed
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
        /// Cause
        trigger: Trigger,
        /// Transport in use
        transport: Option<TransportKind>,
        /// Terminal failure, present only on the final transition of a
        /// failed session
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<SessionFailure>,
    },
    /// A chunk was acknowledged
    TransferProgress {
        /// Transport in use
        transport: TransportKind,
        /// Chunks acknowledged so far
        chunks_sent: u32,
        /// Chunks in the bundle
        total_chunks: u32,
        /// Bytes acknowledged so far
        bytes_sent: u64,
        /// Bundle size
        total_bytes: u64,
        /// Whether this is the rollback bundle
        rollback: bool,
    },
    /// A transient failure will be retried on the same transport
    RetryScheduled {
        /// Transport in use
        transport: TransportKind,
        /// Attempt that failed, starting at 1
        attempt: u32,
        /// Attempts allowed on this transport
        max_attempts: u32,
        /// Failure text
        error: String,
    },
}

impl SessionEvent {
    /// Terminal state carried by this event, if any.
    pub fn terminal_state(&self) -> Option<SessionState> {
        match &self.kind {
            SessionEventKind::StateChanged { to, .. } if to.is_terminal() => Some(*to),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FirmwareId;

    fn session() -> UpdateSession {
        UpdateSession::new(
            "dev-1",
            BundleRef::Firmware(FirmwareId::new("fw-2")),
            "2.0.0",
            UpdateOptions::default(),
            expected_duration(4),
        )
    }

    #[test]
    fn test_apply_records_history() -> Result<(), InvalidTransition> {
        let mut s = session();
        s.apply(Trigger::TransportSelected)?;
        s.apply(Trigger::Abort)?;

        assert_eq!(s.state, SessionState::Failed);
        assert!(s.completed_at.is_some());
        let path: Vec<_> = s.history.iter().map(|c| (c.from, c.to)).collect();
        assert_eq!(
            path,
            [
                (SessionState::Initiated, SessionState::Preparing),
                (SessionState::Preparing, SessionState::Failed),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_rejected_trigger_leaves_session_untouched() {
        let mut s = session();
        let before = s.clone();
        assert!(matches!(
            s.apply(Trigger::Applied),
            Err(InvalidTransition {
                from: SessionState::Initiated,
                trigger: Trigger::Applied
            })
        ));
        assert_eq!(s, before);
    }

    #[test]
    fn test_attempts_counted_per_state() {
        let mut s = session();
        s.count_attempt();
        s.count_attempt();
        assert_eq!(s.attempts_in(SessionState::Initiated), 2);
        assert_eq!(s.attempts_in(SessionState::Transferring), 0);
    }

    #[test]
    fn test_expected_duration() {
        assert_eq!(expected_duration(0), Duration::from_secs(30));
        assert_eq!(expected_duration(12), Duration::from_secs(42));
    }

    #[test]
    fn test_failure_display_includes_cause() {
        let cause = SessionFailure::new(
            FailureClass::DeviceState,
            SessionState::Verifying,
            "version mismatch",
        );
        let failure = SessionFailure::new(
            FailureClass::RollbackFailure,
            SessionState::RollingBack,
            "rollback timed out",
        )
        .caused_by(Some(&cause));

        insta::assert_snapshot!(
            failure.to_string(),
            @"rollback_failure in ROLLING_BACK: rollback timed out (after device_state in VERIFYING: version mismatch)"
        );
        assert_eq!(failure.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_event_wire_form() -> Result<(), serde_json::Error> {
        let event = SessionEventKind::TransferProgress {
            transport: TransportKind::Ble,
            chunks_sent: 1,
            total_chunks: 2,
            bytes_sent: 4096,
            total_bytes: 5000,
            rollback: false,
        };
        let json = serde_json::to_value(&event)?;
        assert_eq!(
            json.get("event").and_then(serde_json::Value::as_str),
            Some("transfer_progress")
        );
        assert_eq!(
            json.get("transport").and_then(serde_json::Value::as_str),
            Some("ble")
        );
        Ok(())
    }
}
