//! Update session state machine
//!
//! ```text
//! INITIATED ─> PREPARING ─> TRANSFERRING ─> VALIDATING ─> APPLYING ─> RESTARTING ─> VERIFYING ─> COMPLETED
//!     │            │    ^        │   │           │            │            │              │
//!     │            │    └────────┘   │           │            └────────────┴──────┬───────┘
//!     │            │     fallback    │           │                                v
//!     └────────────┼─────────────────┴───────────┴──> FAILED                 ROLLING_BACK ──> ROLLED_BACK
//!                  │                                                               │
//!                  └──────────────────────────────────> CRITICAL_FAILURE <─────────┘
//! ```
//!
//! [`SessionState::on`] is the only way a state changes. It is total: every
//! `(state, trigger)` pair has an explicit outcome, either a next state or an
//! [`InvalidTransition`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where an update session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Created; waiting for the device lock or resolving transports
    Initiated,
    /// Transport chosen; fetching the bundle
    Preparing,
    /// Bundle moving to the device
    Transferring,
    /// Device checking the staged bundle
    Validating,
    /// Device applying the bundle
    Applying,
    /// Device rebooting or reloading
    Restarting,
    /// Confirming the running version and health
    Verifying,
    /// Update in effect
    Completed,
    /// Stopped before the device was mutated
    Failed,
    /// Restoring the last known-good bundle
    RollingBack,
    /// Previous bundle restored
    RolledBack,
    /// Device state unknown; operator required
    CriticalFailure,
}

impl SessionState {
    /// Every state, in lifecycle order.
    pub const ALL: [SessionState; 12] = [
        SessionState::Initiated,
        SessionState::Preparing,
        SessionState::Transferring,
        SessionState::Validating,
        SessionState::Applying,
        SessionState::Restarting,
        SessionState::Verifying,
        SessionState::Completed,
        SessionState::Failed,
        SessionState::RollingBack,
        SessionState::RolledBack,
        SessionState::CriticalFailure,
    ];

    /// Terminal states are never left.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::RolledBack
                | SessionState::CriticalFailure
        )
    }

    /// States in which the device may already run something other than its
    /// previous bundle. Failures here go through rollback.
    pub fn may_have_mutated(self) -> bool {
        matches!(
            self,
            SessionState::Applying
                | SessionState::Restarting
                | SessionState::Verifying
                | SessionState::RollingBack
        )
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Initiated => "INITIATED",
            SessionState::Preparing => "PREPARING",
            SessionState::Transferring => "TRANSFERRING",
            SessionState::Validating => "VALIDATING",
            SessionState::Applying => "APPLYING",
            SessionState::Restarting => "RESTARTING",
            SessionState::Verifying => "VERIFYING",
            SessionState::Completed => "COMPLETED",
            SessionState::Failed => "FAILED",
            SessionState::RollingBack => "ROLLING_BACK",
            SessionState::RolledBack => "ROLLED_BACK",
            SessionState::CriticalFailure => "CRITICAL_FAILURE",
        }
    }

    /// What a terminal state means for the device, for operators.
    pub fn outcome(self) -> Option<&'static str> {
        match self {
            SessionState::Completed => Some("update in effect"),
            SessionState::Failed => Some("device left on its previous version"),
            SessionState::RolledBack => Some("device restored to its previous version"),
            SessionState::CriticalFailure => {
                Some("device state unknown, operator intervention required")
            }
            SessionState::Initiated
            | SessionState::Preparing
            | SessionState::Transferring
            | SessionState::Validating
            | SessionState::Applying
            | SessionState::Restarting
            | SessionState::Verifying
            | SessionState::RollingBack => None,
        }
    }

    /// Next state for `trigger`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when the trigger is not accepted in this
    /// state. Terminal states accept nothing.
    pub fn on(self, trigger: Trigger) -> Result<SessionState, InvalidTransition> {
        use SessionState as S;
        use Trigger as T;

        let next = match self {
            S::Initiated => match trigger {
                T::TransportSelected => Some(S::Preparing),
                T::SetupFailed | T::Abort => Some(S::Failed),
                T::BundleDispatched
                | T::BundleMissing
                | T::TransferAcknowledged
                | T::TransportsExhausted
                | T::ValidationPassed
                | T::ValidationRejected
                | T::Applied
                | T::ApplyFailed
                | T::Reannounced
                | T::ReannounceTimedOut
                | T::VerificationPassed
                | T::VerificationFailed
                | T::RollbackUnavailable
                | T::RollbackSucceeded
                | T::RollbackFailed => None,
            },
            S::Preparing => match trigger {
                T::BundleDispatched => Some(S::Transferring),
                T::BundleMissing => Some(S::CriticalFailure),
                T::Abort => Some(S::Failed),
                T::TransportSelected
                | T::SetupFailed
                | T::TransferAcknowledged
                | T::TransportsExhausted
                | T::ValidationPassed
                | T::ValidationRejected
                | T::Applied
                | T::ApplyFailed
                | T::Reannounced
                | T::ReannounceTimedOut
                | T::VerificationPassed
                | T::VerificationFailed
                | T::RollbackUnavailable
                | T::RollbackSucceeded
                | T::RollbackFailed => None,
            },
            S::Transferring => match trigger {
                T::TransferAcknowledged => Some(S::Validating),
                T::TransportSelected => Some(S::Preparing),
                T::TransportsExhausted | T::Abort => Some(S::Failed),
                T::SetupFailed
                | T::BundleDispatched
                | T::BundleMissing
                | T::ValidationPassed
                | T::ValidationRejected
                | T::Applied
                | T::ApplyFailed
                | T::Reannounced
                | T::ReannounceTimedOut
                | T::VerificationPassed
                | T::VerificationFailed
                | T::RollbackUnavailable
                | T::RollbackSucceeded
                | T::RollbackFailed => None,
            },
            S::Validating => match trigger {
                T::ValidationPassed => Some(S::Applying),
                T::ValidationRejected | T::Abort => Some(S::Failed),
                T::TransportSelected
                | T::SetupFailed
                | T::BundleDispatched
                | T::BundleMissing
                | T::TransferAcknowledged
                | T::TransportsExhausted
                | T::Applied
                | T::ApplyFailed
                | T::Reannounced
                | T::ReannounceTimedOut
                | T::VerificationPassed
                | T::VerificationFailed
                | T::RollbackUnavailable
                | T::RollbackSucceeded
                | T::RollbackFailed => None,
            },
            S::Applying => match trigger {
                T::Applied => Some(S::Restarting),
                T::ApplyFailed | T::Abort => Some(S::RollingBack),
                T::RollbackUnavailable => Some(S::CriticalFailure),
                T::TransportSelected
                | T::SetupFailed
                | T::BundleDispatched
                | T::BundleMissing
                | T::TransferAcknowledged
                | T::TransportsExhausted
                | T::ValidationPassed
                | T::ValidationRejected
                | T::Reannounced
                | T::ReannounceTimedOut
                | T::VerificationPassed
                | T::VerificationFailed
                | T::RollbackSucceeded
                | T::RollbackFailed => None,
            },
            S::Restarting => match trigger {
                T::Reannounced => Some(S::Verifying),
                T::ReannounceTimedOut | T::Abort => Some(S::RollingBack),
                T::RollbackUnavailable => Some(S::CriticalFailure),
                T::TransportSelected
                | T::SetupFailed
                | T::BundleDispatched
                | T::BundleMissing
                | T::TransferAcknowledged
                | T::TransportsExhausted
                | T::ValidationPassed
                | T::ValidationRejected
                | T::Applied
                | T::ApplyFailed
                | T::VerificationPassed
                | T::VerificationFailed
                | T::RollbackSucceeded
                | T::RollbackFailed => None,
            },
            S::Verifying => match trigger {
                T::VerificationPassed => Some(S::Completed),
                T::VerificationFailed | T::Abort => Some(S::RollingBack),
                T::RollbackUnavailable => Some(S::CriticalFailure),
                T::TransportSelected
                | T::SetupFailed
                | T::BundleDispatched
                | T::BundleMissing
                | T::TransferAcknowledged
                | T::TransportsExhausted
                | T::ValidationPassed
                | T::ValidationRejected
                | T::Applied
                | T::ApplyFailed
                | T::Reannounced
                | T::ReannounceTimedOut
                | T::RollbackSucceeded
                | T::RollbackFailed => None,
            },
            S::RollingBack => match trigger {
                T::RollbackSucceeded => Some(S::RolledBack),
                T::RollbackFailed => Some(S::CriticalFailure),
                // Rollback runs to completion once started.
                T::Abort => Some(S::RollingBack),
                T::TransportSelected
                | T::SetupFailed
                | T::BundleDispatched
                | T::BundleMissing
                | T::TransferAcknowledged
                | T::TransportsExhausted
                | T::ValidationPassed
                | T::ValidationRejected
                | T::Applied
                | T::ApplyFailed
                | T::Reannounced
                | T::ReannounceTimedOut
                | T::VerificationPassed
                | T::VerificationFailed
                | T::RollbackUnavailable => None,
            },
            S::Completed | S::Failed | S::RolledBack | S::CriticalFailure => None,
        };

        next.ok_or(InvalidTransition {
            from: self,
            trigger,
        })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// A transport was picked, first or as a fallback
    TransportSelected,
    /// No usable transport, or the bundle could not be reserved
    SetupFailed,
    /// Bundle fetched and verified, handed to the transport
    BundleDispatched,
    /// Bundle absent from the store or failed its checksum
    BundleMissing,
    /// Device acknowledged receipt of the whole bundle
    TransferAcknowledged,
    /// Every transport failed
    TransportsExhausted,
    /// Device accepted the staged bundle
    ValidationPassed,
    /// Device rejected the staged bundle, or could not be asked
    ValidationRejected,
    /// Device applied the bundle
    Applied,
    /// Apply failed or went unanswered
    ApplyFailed,
    /// Device came back after restart
    Reannounced,
    /// Device did not come back in time
    ReannounceTimedOut,
    /// Device runs the target version and is healthy
    VerificationPassed,
    /// Version mismatch, unhealthy device, or no answer
    VerificationFailed,
    /// The device may be mutated and there is nothing to roll back to
    RollbackUnavailable,
    /// Previous bundle restored and verified
    RollbackSucceeded,
    /// Restoring the previous bundle failed
    RollbackFailed,
    /// Operator cancellation or session deadline
    Abort,
}

impl Trigger {
    /// Every trigger.
    pub const ALL: [Trigger; 18] = [
        Trigger::TransportSelected,
        Trigger::SetupFailed,
        Trigger::BundleDispatched,
        Trigger::BundleMissing,
        Trigger::TransferAcknowledged,
        Trigger::TransportsExhausted,
        Trigger::ValidationPassed,
        Trigger::ValidationRejected,
        Trigger::Applied,
        Trigger::ApplyFailed,
        Trigger::Reannounced,
        Trigger::ReannounceTimedOut,
        Trigger::VerificationPassed,
        Trigger::VerificationFailed,
        Trigger::RollbackUnavailable,
        Trigger::RollbackSucceeded,
        Trigger::RollbackFailed,
        Trigger::Abort,
    ];
}

/// A trigger the current state does not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid transition: {trigger:?} in state {from}")]
pub struct InvalidTransition {
    /// State the session was in
    pub from: SessionState,
    /// Rejected trigger
    pub trigger: Trigger,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() -> Result<(), InvalidTransition> {
        let path = [
            Trigger::TransportSelected,
            Trigger::BundleDispatched,
            Trigger::TransferAcknowledged,
            Trigger::ValidationPassed,
            Trigger::Applied,
            Trigger::Reannounced,
            Trigger::VerificationPassed,
        ];
        let mut state = SessionState::Initiated;
        for trigger in path {
            state = state.on(trigger)?;
        }
        assert_eq!(state, SessionState::Completed);
        Ok(())
    }

    #[test]
    fn test_fallback_returns_to_preparing() -> Result<(), InvalidTransition> {
        let state = SessionState::Transferring.on(Trigger::TransportSelected)?;
        assert_eq!(state, SessionState::Preparing);
        Ok(())
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for state in SessionState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for trigger in Trigger::ALL {
                assert_eq!(
                    state.on(trigger),
                    Err(InvalidTransition { from: state, trigger })
                );
            }
        }
    }

    #[test]
    fn test_abort_before_apply_fails_without_rollback() -> Result<(), InvalidTransition> {
        for state in [
            SessionState::Initiated,
            SessionState::Preparing,
            SessionState::Transferring,
            SessionState::Validating,
        ] {
            assert_eq!(state.on(Trigger::Abort)?, SessionState::Failed);
        }
        Ok(())
    }

    #[test]
    fn test_abort_after_apply_rolls_back() -> Result<(), InvalidTransition> {
        for state in [
            SessionState::Applying,
            SessionState::Restarting,
            SessionState::Verifying,
            SessionState::RollingBack,
        ] {
            assert_eq!(state.on(Trigger::Abort)?, SessionState::RollingBack);
        }
        Ok(())
    }

    #[test]
    fn test_rollback_unavailable_only_after_mutation() {
        for state in SessionState::ALL {
            let accepted = state.on(Trigger::RollbackUnavailable).is_ok();
            assert_eq!(
                accepted,
                state.may_have_mutated() && state != SessionState::RollingBack,
                "{state}"
            );
        }
    }

    #[test]
    fn test_critical_failure_sources() {
        for state in SessionState::ALL {
            for trigger in Trigger::ALL {
                if state.on(trigger) == Ok(SessionState::CriticalFailure) {
                    assert!(
                        matches!(
                            state,
                            SessionState::Preparing
                                | SessionState::Applying
                                | SessionState::Restarting
                                | SessionState::Verifying
                                | SessionState::RollingBack
                        ),
                        "{state} -> CRITICAL_FAILURE via {trigger:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_outcome_described_for_terminal_states_only() {
        for state in SessionState::ALL {
            assert_eq!(state.outcome().is_some(), state.is_terminal());
        }
    }
}
