//! Drives one update session from `INITIATED` to a terminal state

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetline_errors::FailureClass;
use fleetline_ledger::{ConfigurationLedger, VersionId};
use fleetline_transport::protocol::{chunk_count, sha256_hex};
use fleetline_transport::{CommandEnvelope, DeviceAck, DeviceCommand, TransportError};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::model::{Device, FirmwareId};
use crate::preference::{PreferenceResolver, ResolvedTransport};
use crate::registry::{DeviceRegistry, FirmwareCatalog};
use crate::session::{SessionEvent, SessionEventKind, SessionFailure, UpdateSession};
use crate::state::{SessionState, Trigger};
use crate::store::BundleStore;

/// Collaborators shared by every session of a supervisor.
pub(crate) struct SessionContext {
    pub registry: Arc<dyn DeviceRegistry>,
    pub catalog: Arc<dyn FirmwareCatalog>,
    pub store: Arc<dyn BundleStore>,
    pub ledger: Arc<ConfigurationLedger>,
    pub resolver: Arc<PreferenceResolver>,
    pub events: broadcast::Sender<SessionEvent>,
    pub reboot_timeout: Option<Duration>,
}

/// Where a payload's record lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PayloadOrigin {
    Firmware(FirmwareId),
    Configuration { id: VersionId, version: u64 },
}

/// A bundle resolved to its stored bytes and the version it installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Payload {
    pub checksum: String,
    pub size: u64,
    pub version: String,
    pub origin: PayloadOrigin,
}

/// Why a retried exchange stopped early.
#[derive(Debug)]
enum Interrupt {
    Transport(TransportError),
    Aborted(String),
}

impl std::fmt::Display for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interrupt::Transport(e) => e.fmt(f),
            Interrupt::Aborted(reason) => f.write_str(reason),
        }
    }
}

/// Why restoring the previous bundle over one transport failed.
enum RestoreError {
    /// Delivery failed; the next transport may be tried
    Delivery(TransportError),
    /// The device mishandled the restored bundle
    Device(String),
}

pub(crate) struct SessionRunner {
    ctx: Arc<SessionContext>,
    session: UpdateSession,
    device: Device,
    target: Payload,
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
    transports: Vec<ResolvedTransport>,
    current: usize,
    rejection_fallback_used: bool,
    bundle: Option<Arc<[u8]>>,
    rollback: Option<Payload>,
    announced: Option<String>,
}

impl SessionRunner {
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        session: UpdateSession,
        device: Device,
        target: Payload,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            session,
            device,
            target,
            cancel,
            deadline: None,
            transports: Vec::new(),
            current: 0,
            rejection_fallback_used: false,
            bundle: None,
            rollback: None,
            announced: None,
        }
    }

    /// Run to a terminal state, settle the ledger and registry, and return
    /// the finished session.
    pub(crate) async fn run(mut self) -> UpdateSession {
        self.deadline = Instant::now().checked_add(self.session.options.update_timeout);
        info!(
            session_id = %self.session.id,
            device_id = %self.session.device_id,
            update_type = %self.session.update_type,
            target_version = %self.session.target_version,
            "Update session started"
        );

        loop {
            let state = self.session.state;
            let trigger = match state {
                SessionState::Initiated => self.initiate().await,
                SessionState::Preparing => self.prepare().await,
                SessionState::Transferring => self.transfer().await,
                SessionState::Validating => self.validate().await,
                SessionState::Applying => self.apply().await,
                SessionState::Restarting => self.restart().await,
                SessionState::Verifying => self.verify().await,
                SessionState::RollingBack => self.roll_back().await,
                SessionState::Completed
                | SessionState::Failed
                | SessionState::RolledBack
                | SessionState::CriticalFailure => break,
            };
            let trigger = self.at_boundary(state, trigger).await;
            self.fire(trigger);
        }

        self.settle().await;
        self.session
    }

    fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            session_id: self.session.id,
            device_id: self.session.device_id.clone(),
            update_type: self.session.update_type,
            timestamp: Utc::now(),
            kind,
        };
        if self.ctx.events.send(event).is_err() {
            debug!(session_id = %self.session.id, "No event subscribers");
        }
    }

    fn fail(&mut self, failure: SessionFailure) {
        warn!(
            session_id = %self.session.id,
            device_id = %self.session.device_id,
            class = %failure.class,
            stage = %failure.stage,
            detail = %failure.detail,
            "Session step failed"
        );
        self.session.failure = Some(failure);
    }

    fn abort_reason(&self) -> Option<String> {
        if *self.cancel.borrow() {
            return Some("cancelled by operator".to_string());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(format!(
                "update timeout of {}s exceeded",
                self.session.options.update_timeout.as_secs()
            )),
            _ => None,
        }
    }

    /// Cancellation and rollback availability are decided here, between a
    /// step's result and the transition it asks for.
    async fn at_boundary(&mut self, state: SessionState, trigger: Trigger) -> Trigger {
        let mut trigger = trigger;

        if let Some(reason) = self.abort_reason() {
            let progressing = matches!(
                state.on(trigger),
                Ok(next) if !matches!(
                    next,
                    SessionState::Failed
                        | SessionState::CriticalFailure
                        | SessionState::RollingBack
                        | SessionState::RolledBack
                )
            );
            if progressing {
                self.fail(SessionFailure::new(FailureClass::Cancelled, state, reason));
                trigger = Trigger::Abort;
            }
        }

        if state != SessionState::RollingBack && state.on(trigger) == Ok(SessionState::RollingBack) {
            match self.rollback_target().await {
                Ok(target) => {
                    info!(
                        session_id = %self.session.id,
                        rollback_version = %target.version,
                        "Rolling back"
                    );
                    self.rollback = Some(target);
                }
                Err(detail) => {
                    let failure = SessionFailure::new(FailureClass::RollbackFailure, state, detail)
                        .caused_by(self.session.failure.as_ref());
                    self.fail(failure);
                    trigger = Trigger::RollbackUnavailable;
                }
            }
        }

        trigger
    }

    fn fire(&mut self, trigger: Trigger) {
        match self.session.apply(trigger) {
            Ok(change) => {
                info!(
                    session_id = %self.session.id,
                    device_id = %self.session.device_id,
                    from = %change.from,
                    to = %change.to,
                    trigger = ?trigger,
                    "Session transition"
                );
                if change.to == SessionState::Completed {
                    self.session.failure = None;
                }
                let failure = if change.to.is_terminal() {
                    self.session.failure.clone()
                } else {
                    None
                };
                self.emit(SessionEventKind::StateChanged {
                    from: change.from,
                    to: change.to,
                    trigger,
                    transport: self.session.transport,
                    failure,
                });
            }
            Err(fault) => {
                error!(session_id = %self.session.id, error = %fault, "Session machine refused trigger");
                let from = self.session.state;
                self.session.escalate(fault);
                self.emit(SessionEventKind::StateChanged {
                    from,
                    to: SessionState::CriticalFailure,
                    trigger,
                    transport: self.session.transport,
                    failure: self.session.failure.clone(),
                });
            }
        }
    }

    fn active(&self) -> Option<ResolvedTransport> {
        self.transports.get(self.current).cloned()
    }

    async fn initiate(&mut self) -> Trigger {
        if let Some(reason) = self.abort_reason() {
            self.fail(SessionFailure::new(
                FailureClass::Cancelled,
                SessionState::Initiated,
                reason,
            ));
            return Trigger::Abort;
        }

        // A session queued behind another one for the same device must see
        // the pointers that session left behind.
        match self.ctx.registry.get(&self.session.device_id).await {
            Ok(Some(device)) => self.device = device,
            Ok(None) => {
                self.fail(SessionFailure::new(
                    FailureClass::Configuration,
                    SessionState::Initiated,
                    format!("device {} is no longer registered", self.session.device_id),
                ));
                return Trigger::SetupFailed;
            }
            Err(e) => {
                self.fail(SessionFailure::new(
                    FailureClass::Configuration,
                    SessionState::Initiated,
                    format!("device registry lookup failed: {e}"),
                ));
                return Trigger::SetupFailed;
            }
        }

        if let PayloadOrigin::Configuration { id, .. } = &self.target.origin
            && let Err(e) = self.ctx.ledger.mark_deploying(*id).await
        {
            self.fail(SessionFailure::new(
                e.class(),
                SessionState::Initiated,
                e.to_string(),
            ));
            return Trigger::SetupFailed;
        }

        match self.ctx.resolver.resolve(&self.session.device_id) {
            Ok(transports) => {
                self.transports = transports;
                self.current = 0;
                self.session.transport = self.active().map(|t| t.kind);
                Trigger::TransportSelected
            }
            Err(e) => {
                self.fail(SessionFailure::new(
                    FailureClass::Configuration,
                    SessionState::Initiated,
                    e.to_string(),
                ));
                Trigger::SetupFailed
            }
        }
    }

    async fn fetch(&self, checksum: &str) -> Result<Arc<[u8]>, String> {
        match self.ctx.store.get(checksum).await {
            Ok(Some(bytes)) => {
                let actual = sha256_hex(&bytes);
                if actual == checksum {
                    Ok(Arc::from(bytes))
                } else {
                    Err(format!("bundle {checksum} hashes to {actual}"))
                }
            }
            Ok(None) => Err(format!("bundle {checksum} is not in the store")),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn prepare(&mut self) -> Trigger {
        if self.bundle.is_some() {
            return Trigger::BundleDispatched;
        }
        match self.fetch(&self.target.checksum).await {
            Ok(bytes) => {
                debug!(session_id = %self.session.id, bytes = bytes.len(), "Bundle fetched");
                self.bundle = Some(bytes);
                Trigger::BundleDispatched
            }
            Err(detail) => {
                self.fail(SessionFailure::new(
                    FailureClass::Integrity,
                    SessionState::Preparing,
                    detail,
                ));
                Trigger::BundleMissing
            }
        }
    }

    async fn transfer(&mut self) -> Trigger {
        let (Some(transport), Some(bytes)) = (self.active(), self.bundle.clone()) else {
            self.fail(SessionFailure::new(
                FailureClass::Configuration,
                SessionState::Transferring,
                "no transport or bundle at transfer",
            ));
            return Trigger::TransportsExhausted;
        };
        let target = self.target.clone();

        let err = match self.deliver(&transport, &target, &bytes, false).await {
            Ok(()) => {
                self.session.failure = None;
                return Trigger::TransferAcknowledged;
            }
            Err(Interrupt::Aborted(reason)) => {
                self.fail(SessionFailure::new(
                    FailureClass::Cancelled,
                    SessionState::Transferring,
                    reason,
                ));
                return Trigger::Abort;
            }
            Err(Interrupt::Transport(err)) => err,
        };

        self.fail(SessionFailure::new(
            err.class(),
            SessionState::Transferring,
            format!("{} transfer failed: {err}", transport.kind),
        ));

        if err.class() == FailureClass::ProtocolRejection {
            if self.rejection_fallback_used {
                return Trigger::TransportsExhausted;
            }
            self.rejection_fallback_used = true;
        }

        let next = self.current.saturating_add(1);
        match self.transports.get(next) {
            Some(fallback) => {
                info!(
                    session_id = %self.session.id,
                    from = %transport.kind,
                    to = %fallback.kind,
                    "Falling back to next transport"
                );
                self.current = next;
                self.session.transport = Some(fallback.kind);
                Trigger::TransportSelected
            }
            None => Trigger::TransportsExhausted,
        }
    }

    async fn validate(&mut self) -> Trigger {
        let Some(transport) = self.active() else {
            return Trigger::ValidationRejected;
        };
        let command = DeviceCommand::Validate {
            checksum: self.target.checksum.clone(),
        };
        let stage = SessionState::Validating;
        match self.exchange_retrying(&transport, command, true).await {
            Ok(DeviceAck::Validated) => Trigger::ValidationPassed,
            Ok(DeviceAck::ValidationFailed { reason }) => {
                self.fail(SessionFailure::new(FailureClass::ProtocolRejection, stage, reason));
                Trigger::ValidationRejected
            }
            Ok(other) => {
                self.fail(SessionFailure::new(
                    FailureClass::ProtocolRejection,
                    stage,
                    unexpected("validate", &other),
                ));
                Trigger::ValidationRejected
            }
            Err(Interrupt::Aborted(reason)) => {
                self.fail(SessionFailure::new(FailureClass::Cancelled, stage, reason));
                Trigger::Abort
            }
            Err(Interrupt::Transport(e)) => {
                self.fail(SessionFailure::new(e.class(), stage, e.to_string()));
                Trigger::ValidationRejected
            }
        }
    }

    async fn apply(&mut self) -> Trigger {
        let Some(transport) = self.active() else {
            return Trigger::ApplyFailed;
        };
        let stage = SessionState::Applying;
        self.session.count_attempt();
        let timeout = transport.policy.connection_timeout;
        match self.exchange(&transport, DeviceCommand::Apply, timeout).await {
            Ok(DeviceAck::Applied) => Trigger::Applied,
            Ok(DeviceAck::ApplyFailed { reason }) => {
                self.fail(SessionFailure::new(FailureClass::DeviceState, stage, reason));
                Trigger::ApplyFailed
            }
            Ok(other) => {
                self.fail(SessionFailure::new(
                    FailureClass::DeviceState,
                    stage,
                    unexpected("apply", &other),
                ));
                Trigger::ApplyFailed
            }
            Err(e) => {
                self.fail(SessionFailure::new(
                    FailureClass::DeviceState,
                    stage,
                    format!("apply unconfirmed: {e}"),
                ));
                Trigger::ApplyFailed
            }
        }
    }

    async fn restart(&mut self) -> Trigger {
        let Some(transport) = self.active() else {
            return Trigger::ReannounceTimedOut;
        };
        let stage = SessionState::Restarting;
        self.session.count_attempt();
        let timeout = self
            .ctx
            .reboot_timeout
            .unwrap_or(transport.policy.connection_timeout);
        match self.exchange(&transport, DeviceCommand::Restart, timeout).await {
            Ok(DeviceAck::Announced {
                firmware_version,
                configuration_version,
            }) => {
                self.announced = match &self.target.origin {
                    PayloadOrigin::Firmware(_) => firmware_version,
                    PayloadOrigin::Configuration { .. } => {
                        configuration_version.map(|v| v.to_string())
                    }
                };
                Trigger::Reannounced
            }
            Ok(other) => {
                self.fail(SessionFailure::new(
                    FailureClass::DeviceState,
                    stage,
                    unexpected("restart", &other),
                ));
                Trigger::ReannounceTimedOut
            }
            Err(e) => {
                self.fail(SessionFailure::new(
                    FailureClass::DeviceState,
                    stage,
                    format!("device did not re-announce: {e}"),
                ));
                Trigger::ReannounceTimedOut
            }
        }
    }

    async fn verify(&mut self) -> Trigger {
        let expected = self.target.version.clone();
        if self.session.options.skip_verification && self.announced.as_deref() == Some(&expected) {
            debug!(session_id = %self.session.id, "Announced version accepted without verify");
            return Trigger::VerificationPassed;
        }

        let Some(transport) = self.active() else {
            return Trigger::VerificationFailed;
        };
        let stage = SessionState::Verifying;
        let command = DeviceCommand::Verify {
            expected_version: expected.clone(),
        };
        match self.exchange_retrying(&transport, command, true).await {
            Ok(ack) => match health_check(&ack, &expected) {
                Ok(()) => Trigger::VerificationPassed,
                Err(detail) => {
                    self.fail(SessionFailure::new(FailureClass::DeviceState, stage, detail));
                    Trigger::VerificationFailed
                }
            },
            Err(Interrupt::Aborted(reason)) => {
                self.fail(SessionFailure::new(FailureClass::Cancelled, stage, reason));
                Trigger::Abort
            }
            Err(Interrupt::Transport(e)) => {
                self.fail(SessionFailure::new(
                    FailureClass::DeviceState,
                    stage,
                    format!("verification unanswered: {e}"),
                ));
                Trigger::VerificationFailed
            }
        }
    }

    async fn rollback_target(&self) -> Result<Payload, String> {
        match &self.target.origin {
            PayloadOrigin::Configuration { .. } => {
                let row = self
                    .ctx
                    .ledger
                    .latest_deployed(&self.session.device_id)
                    .await
                    .ok_or_else(|| "no deployed configuration to roll back to".to_string())?;
                Ok(Payload {
                    size: u64::try_from(fleetline_ledger::bundle_bytes(&row.bundle).len())
                        .unwrap_or(u64::MAX),
                    checksum: row.checksum.clone(),
                    version: row.label(),
                    origin: PayloadOrigin::Configuration {
                        id: row.id,
                        version: row.version,
                    },
                })
            }
            PayloadOrigin::Firmware(_) => {
                let previous = self
                    .device
                    .firmware_id
                    .clone()
                    .ok_or_else(|| "device has no recorded firmware to roll back to".to_string())?;
                let firmware = self
                    .ctx
                    .catalog
                    .get(&previous)
                    .await
                    .map_err(|e| format!("firmware catalog lookup failed: {e}"))?
                    .ok_or_else(|| format!("previous firmware {previous} is not in the catalog"))?;
                Ok(Payload {
                    checksum: firmware.checksum,
                    size: firmware.size,
                    version: firmware.version.to_string(),
                    origin: PayloadOrigin::Firmware(firmware.id),
                })
            }
        }
    }

    async fn roll_back(&mut self) -> Trigger {
        let cause = self.session.failure.clone();
        let stage = SessionState::RollingBack;

        let Some(target) = self.rollback.clone() else {
            self.fail(
                SessionFailure::new(FailureClass::RollbackFailure, stage, "no rollback target")
                    .caused_by(cause.as_ref()),
            );
            return Trigger::RollbackFailed;
        };
        let bytes = match self.fetch(&target.checksum).await {
            Ok(bytes) => bytes,
            Err(detail) => {
                self.fail(
                    SessionFailure::new(FailureClass::RollbackFailure, stage, detail)
                        .caused_by(cause.as_ref()),
                );
                return Trigger::RollbackFailed;
            }
        };

        let mut last_error = String::from("no transport available");
        for transport in self.transports.clone() {
            self.session.transport = Some(transport.kind);
            match self.restore_over(&transport, &target, &bytes).await {
                Ok(()) => {
                    info!(
                        session_id = %self.session.id,
                        version = %target.version,
                        transport = %transport.kind,
                        "Rollback verified"
                    );
                    return Trigger::RollbackSucceeded;
                }
                Err(RestoreError::Delivery(e)) => {
                    warn!(session_id = %self.session.id, transport = %transport.kind, error = %e, "Rollback delivery failed");
                    last_error = format!("{} delivery failed: {e}", transport.kind);
                }
                Err(RestoreError::Device(detail)) => {
                    last_error = detail;
                    break;
                }
            }
        }

        self.fail(
            SessionFailure::new(
                FailureClass::RollbackFailure,
                stage,
                format!("rollback to {} failed: {last_error}", target.version),
            )
            .caused_by(cause.as_ref()),
        );
        Trigger::RollbackFailed
    }

    async fn restore_over(
        &mut self,
        transport: &ResolvedTransport,
        target: &Payload,
        bytes: &[u8],
    ) -> Result<(), RestoreError> {
        match self.deliver(transport, target, bytes, true).await {
            Ok(()) => {}
            Err(Interrupt::Transport(e)) => return Err(RestoreError::Delivery(e)),
            Err(Interrupt::Aborted(reason)) => return Err(RestoreError::Device(reason)),
        }

        let validate = DeviceCommand::Validate {
            checksum: target.checksum.clone(),
        };
        match self.exchange_retrying(transport, validate, false).await {
            Ok(DeviceAck::Validated) => {}
            Ok(other) => return Err(RestoreError::Device(unexpected("validate", &other))),
            Err(e) => return Err(RestoreError::Device(format!("validate: {e}"))),
        }

        let timeout = transport.policy.connection_timeout;
        match self.exchange(transport, DeviceCommand::Apply, timeout).await {
            Ok(DeviceAck::Applied) => {}
            Ok(other) => return Err(RestoreError::Device(unexpected("apply", &other))),
            Err(e) => return Err(RestoreError::Device(format!("apply: {e}"))),
        }

        let reboot = self.ctx.reboot_timeout.unwrap_or(timeout);
        match self.exchange(transport, DeviceCommand::Restart, reboot).await {
            Ok(DeviceAck::Announced { .. }) => {}
            Ok(other) => return Err(RestoreError::Device(unexpected("restart", &other))),
            Err(e) => {
                return Err(RestoreError::Device(format!(
                    "device did not re-announce: {e}"
                )));
            }
        }

        let verify = DeviceCommand::Verify {
            expected_version: target.version.clone(),
        };
        match self.exchange_retrying(transport, verify, false).await {
            Ok(ack) => health_check(&ack, &target.version).map_err(RestoreError::Device),
            Err(e) => Err(RestoreError::Device(format!("verify: {e}"))),
        }
    }

    /// Transfer `bytes` over one transport, retrying transient failures per
    /// its policy. Cancellation is honoured between attempts unless
    /// `rollback` is set.
    async fn deliver(
        &mut self,
        transport: &ResolvedTransport,
        payload: &Payload,
        bytes: &[u8],
        rollback: bool,
    ) -> Result<(), Interrupt> {
        let max_attempts = transport.policy.attempts();
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            if !rollback && let Some(reason) = self.abort_reason() {
                return Err(Interrupt::Aborted(reason));
            }
            self.session.count_attempt();

            match self.transfer_once(transport, payload, bytes, rollback).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    self.pause_before_retry(transport, attempt, &e, !rollback)
                        .await;
                }
                Err(e) => return Err(Interrupt::Transport(e)),
            }
        }
    }

    /// Send one command, retrying transient failures. Only used for
    /// commands that do not change device state.
    async fn exchange_retrying(
        &mut self,
        transport: &ResolvedTransport,
        command: DeviceCommand,
        interruptible: bool,
    ) -> Result<DeviceAck, Interrupt> {
        let max_attempts = transport.policy.attempts();
        let timeout = transport.policy.connection_timeout;
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            if interruptible && let Some(reason) = self.abort_reason() {
                return Err(Interrupt::Aborted(reason));
            }
            self.session.count_attempt();

            match self.exchange(transport, command.clone(), timeout).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    self.pause_before_retry(transport, attempt, &e, interruptible)
                        .await;
                }
                Err(e) => return Err(Interrupt::Transport(e)),
            }
        }
    }

    async fn pause_before_retry(
        &self,
        transport: &ResolvedTransport,
        attempt: u32,
        err: &TransportError,
        interruptible: bool,
    ) {
        let max_attempts = transport.policy.attempts();
        warn!(
            session_id = %self.session.id,
            transport = %transport.kind,
            attempt,
            max_attempts,
            error = %err,
            "Transient failure, retrying"
        );
        self.emit(SessionEventKind::RetryScheduled {
            transport: transport.kind,
            attempt,
            max_attempts,
            error: err.to_string(),
        });

        let pause = tokio::time::sleep(transport.policy.retry_interval);
        if interruptible {
            let mut cancel = self.cancel.clone();
            let expiry = async {
                match self.deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = pause => {}
                () = cancelled(&mut cancel) => {}
                () = expiry => {}
            }
        } else {
            pause.await;
        }
    }

    async fn transfer_once(
        &self,
        transport: &ResolvedTransport,
        payload: &Payload,
        bytes: &[u8],
        rollback: bool,
    ) -> Result<(), TransportError> {
        let chunk_size = self.session.options.chunk_size.max(1);
        let total_chunks = chunk_count(bytes.len(), chunk_size);
        let total_bytes = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let timeout = transport.policy.connection_timeout;

        let prepare = DeviceCommand::Prepare {
            update: self.session.update_type,
            version: payload.version.clone(),
            total_size: payload.size,
            total_chunks,
            checksum: payload.checksum.clone(),
        };
        match self.exchange(transport, prepare, timeout).await? {
            DeviceAck::Ready => {}
            other => return Err(TransportError::Rejected(unexpected("prepare", &other))),
        }

        let mut bytes_sent: u64 = 0;
        for (index, chunk) in bytes.chunks(chunk_size).enumerate() {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            let command = DeviceCommand::Chunk {
                index,
                data: chunk.to_vec(),
                checksum: sha256_hex(chunk),
            };
            match self.exchange(transport, command, timeout).await? {
                DeviceAck::ChunkReceived { .. } => {}
                other => return Err(TransportError::Rejected(unexpected("chunk", &other))),
            }
            bytes_sent = bytes_sent.saturating_add(u64::try_from(chunk.len()).unwrap_or(0));
            self.emit(SessionEventKind::TransferProgress {
                transport: transport.kind,
                chunks_sent: index.saturating_add(1),
                total_chunks,
                bytes_sent,
                total_bytes,
                rollback,
            });
        }

        let finalize = DeviceCommand::Finalize {
            checksum: payload.checksum.clone(),
        };
        match self.exchange(transport, finalize, timeout).await? {
            DeviceAck::TransferComplete { checksum } => {
                if checksum.eq_ignore_ascii_case(&payload.checksum) {
                    Ok(())
                } else {
                    Err(TransportError::ChecksumMismatch {
                        expected: payload.checksum.clone(),
                        actual: checksum,
                    })
                }
            }
            other => Err(TransportError::Rejected(unexpected("finalize", &other))),
        }
    }

    async fn exchange(
        &self,
        transport: &ResolvedTransport,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<DeviceAck, TransportError> {
        let name = command.name();
        let envelope = CommandEnvelope::new(self.session.id.to_string(), command);
        let receipt = transport
            .adapter
            .send(&self.session.device_id, &envelope)
            .await?;
        let ack = transport.adapter.await_ack(&receipt, timeout).await?;
        debug!(
            session_id = %self.session.id,
            transport = %transport.kind,
            command = name,
            "Command acknowledged"
        );
        Ok(ack)
    }

    /// Write the outcome back to the ledger and registry. Each terminal state
    /// moves at most one version pointer and one ledger status.
    async fn settle(&mut self) {
        let device_id = self.session.device_id.clone();
        let reason = self
            .session
            .failure
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        let result = match (&self.target.origin, self.session.state) {
            (PayloadOrigin::Configuration { id, version }, SessionState::Completed) => {
                match self.ctx.ledger.commit_deployed(*id).await {
                    Ok(_) => self
                        .ctx
                        .registry
                        .record_configuration(&device_id, *version)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
            (
                PayloadOrigin::Configuration { id, .. },
                SessionState::Failed | SessionState::CriticalFailure,
            ) => self
                .ctx
                .ledger
                .commit_failed(*id, reason.clone())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            (PayloadOrigin::Configuration { id, .. }, SessionState::RolledBack) => {
                match self.rollback.as_ref().map(|r| &r.origin) {
                    Some(PayloadOrigin::Configuration {
                        id: restored,
                        version: restored_version,
                    }) => match self.ctx.ledger.commit_rolled_back(*id, *restored).await {
                        Ok(_) => self
                            .ctx
                            .registry
                            .record_configuration(&device_id, *restored_version)
                            .await
                            .map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    },
                    _ => Err("rolled back without a configuration target".to_string()),
                }
            }
            (PayloadOrigin::Firmware(firmware_id), SessionState::Completed) => self
                .ctx
                .registry
                .record_firmware(&device_id, firmware_id, &self.target.version)
                .await
                .map_err(|e| e.to_string()),
            (PayloadOrigin::Firmware(_), SessionState::RolledBack) => {
                match self.rollback.as_ref() {
                    Some(Payload {
                        origin: PayloadOrigin::Firmware(restored),
                        version,
                        ..
                    }) => self
                        .ctx
                        .registry
                        .record_firmware(&device_id, restored, version)
                        .await
                        .map_err(|e| e.to_string()),
                    _ => Err("rolled back without a firmware target".to_string()),
                }
            }
            (PayloadOrigin::Firmware(_), SessionState::Failed | SessionState::CriticalFailure) => {
                Ok(())
            }
            (_, state) => Err(format!("settle called in non-terminal state {state}")),
        };

        if let Err(e) = result {
            error!(session_id = %self.session.id, device_id = %device_id, error = %e, "Failed to record session outcome");
        }

        match self.session.state {
            SessionState::CriticalFailure => error!(
                session_id = %self.session.id,
                device_id = %device_id,
                failure = %reason,
                "Session ended in CRITICAL_FAILURE, operator intervention required"
            ),
            state => info!(
                session_id = %self.session.id,
                device_id = %device_id,
                state = %state,
                "Update session finished"
            ),
        }
    }
}

/// Resolves once the cancel flag is raised. Never resolves if the sender is
/// gone without raising it.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn unexpected(command: &str, ack: &DeviceAck) -> String {
    format!("unexpected reply to {command}: {ack:?}")
}

fn health_check(ack: &DeviceAck, expected: &str) -> Result<(), String> {
    match ack {
        DeviceAck::Health {
            version, healthy, ..
        } if version == expected && *healthy => Ok(()),
        DeviceAck::Health { version, .. } if version != expected => Err(format!(
            "version mismatch: expected {expected}, device reports {version}"
        )),
        DeviceAck::Health { detail, .. } => Err(format!(
            "device reports unhealthy: {}",
            detail.as_deref().unwrap_or("no detail")
        )),
        other => Err(unexpected("verify", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check() {
        let healthy = DeviceAck::Health {
            version: "2.0.0".to_string(),
            healthy: true,
            detail: None,
        };
        assert_eq!(health_check(&healthy, "2.0.0"), Ok(()));

        let mismatch = health_check(&healthy, "3.0.0");
        assert!(matches!(mismatch, Err(m) if m.contains("version mismatch")));

        let sick = DeviceAck::Health {
            version: "2.0.0".to_string(),
            healthy: false,
            detail: Some("watchdog reset".to_string()),
        };
        assert!(matches!(health_check(&sick, "2.0.0"), Err(m) if m.contains("watchdog reset")));

        assert!(matches!(health_check(&DeviceAck::Applied, "2.0.0"), Err(_)));
    }
}
