//! # Binding state machine of a return service instance
//!
//! A [ServiceInstance] owns three threads:
//!
//!  - the session executor, which exclusively owns the [Session] with the binding state,
//!    the pending returns, the transport channel and the PDU codec,
//!  - the notification executor, which owns the registered listeners,
//!  - the timer thread used for the return timeouts and the side specific timers.
//!
//! All public operations and all channel events are queued as tasks on the session
//! executor. Operations invoked in the wrong state or role never fail the caller. They are
//! recorded as the last error of the instance and reported with a state update.
//!
//! The session is generic over its [SessionSide]. The user side (see [crate::user]) and the
//! provider side (see [crate::provider]) register the handlers of the PDUs they accept and
//! may keep their own state in [Session::side].
use crate::config::{InitiatorSide, PeerConfiguration, ServiceInstanceConfiguration};
use crate::credentials::{AuthenticationError, AuthenticationGate};
use crate::dispatch::{ExecutorHandle, SerialExecutor, TaskOrigin, TimerHandle, TimerId, TimerService};
use crate::pdu::{
    BindDiagnostic, BindInvocation, BindReturn, InvokeId, ParameterValue, PduCodec, PduKind,
    PeerAbortDiagnostic, SlePdu, StatusReportInvocation, UnbindInvocation, UnbindReason,
    UnbindReturn,
};
use crate::config::ConfigError;
use crate::credentials::Credentials;
use crate::transport::{ChannelObserver, DisconnectReason, TransportChannel};
use crate::BindingState;
use listener::{ListenerEvent, ListenerSet, Notifier};
use parking_lot::Mutex;
use rate::RateCounter;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod listener;
mod rate;

pub use listener::ServiceInstanceListener;
pub use rate::DataRate;

const DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("spawning service instance thread failed: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Answer of the responder to the next BIND invocation.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum BindResponse {
    /// Accept a valid BIND invocation.
    #[default]
    Accept,
    /// Reject the next BIND invocation with the given diagnostic, even if it is valid.
    Reject(BindDiagnostic),
}

/// Observable state of a service instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    pub binding_state: BindingState,
    /// Negotiated SLE version of the current association.
    pub version: Option<u16>,
    pub last_error: Option<String>,
    pub last_pdu_sent: Option<Vec<u8>>,
    pub last_pdu_received: Option<Vec<u8>>,
    pub last_status_report: Option<StatusReportInvocation>,
    pub last_parameter: Option<ParameterValue>,
}

/// Side specific part of a [Session].
pub trait SessionSide: Sized + Send + 'static {
    const IS_USER: bool;
    const NAME: &'static str;

    /// State shared between the session and the public handle of the instance.
    type Shared: Clone + Send + Sync + 'static;

    fn shared(&self) -> Self::Shared;

    fn register_handlers(handlers: &mut HandlerRegistry<Self>);

    /// Called once while the session is constructed, before any task runs.
    #[allow(unused_variables)]
    fn attach(&mut self, si: &Arc<str>, executor: &ExecutorHandle<Session<Self>>, timers: &TimerHandle) {}

    /// Clear the session scoped side state. Called whenever the association ends.
    #[allow(unused_variables)]
    fn on_reset(session: &mut Session<Self>) {}
}

pub type Handler<S> = fn(&mut Session<S>, SlePdu);

/// Handlers of the received PDU kinds. Each kind has at most one handler.
pub struct HandlerRegistry<S: SessionSide> {
    handlers: HashMap<PduKind, Handler<S>>,
}

impl<S: SessionSide> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S: SessionSide> HandlerRegistry<S> {
    pub fn register(&mut self, kind: PduKind, handler: Handler<S>) {
        if self.handlers.insert(kind, handler).is_some() {
            warn!(%kind, "pdu handler replaced");
        }
    }

    fn get(&self, kind: PduKind) -> Option<Handler<S>> {
        self.handlers.get(&kind).copied()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ReturnKey {
    Bind,
    Unbind,
    Invoke(InvokeId),
}

#[derive(Debug)]
struct PendingReturn {
    operation: PduKind,
    expected: PduKind,
    token: u64,
    timer: Option<TimerId>,
}

struct SessionObserver<S: SessionSide> {
    executor: ExecutorHandle<Session<S>>,
}

impl<S: SessionSide> ChannelObserver for SessionObserver<S> {
    fn on_connected(&self) {
        self.executor
            .submit(TaskOrigin::FromProvider, |session| session.on_connected());
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        self.executor.submit(TaskOrigin::FromProvider, move |session| {
            session.on_channel_disconnected(reason)
        });
    }

    fn on_pdu_received(&self, raw: Vec<u8>) {
        self.executor.submit(TaskOrigin::FromProvider, move |session| {
            session.on_pdu_received(raw)
        });
    }
}

/// Protocol state of a service instance, owned by the session executor.
pub struct Session<S: SessionSide> {
    pub(crate) si: Arc<str>,
    pub(crate) peers: Arc<PeerConfiguration>,
    pub(crate) config: Arc<ServiceInstanceConfiguration>,
    state: BindingState,
    version: Option<u16>,
    next_invoke_id: InvokeId,
    pending: HashMap<ReturnKey, PendingReturn>,
    next_token: u64,
    gate: Option<AuthenticationGate>,
    bind_response: BindResponse,
    channel: Box<dyn TransportChannel>,
    codec: Box<dyn PduCodec>,
    handlers: HandlerRegistry<S>,
    snapshot: Arc<Mutex<StateSnapshot>>,
    rate: Arc<Mutex<RateCounter>>,
    notifier: Notifier,
    pub(crate) executor: ExecutorHandle<Session<S>>,
    pub(crate) timers: TimerHandle,
    pub(crate) side: S,
}

impl<S: SessionSide> Session<S> {
    #[inline]
    pub fn state(&self) -> BindingState {
        self.state
    }

    #[inline]
    pub fn version(&self) -> Option<u16> {
        self.version
    }

    /// Whether the local side sends the BIND invocation of the association.
    pub fn is_initiator(&self) -> bool {
        (self.config.initiator == InitiatorSide::User) == S::IS_USER
    }

    pub(crate) fn update_snapshot(&self, update: impl FnOnce(&mut StateSnapshot)) {
        update(&mut self.snapshot.lock());
    }

    pub(crate) fn publish_state(&self) {
        let snapshot = {
            let mut snapshot = self.snapshot.lock();
            snapshot.binding_state = self.state;
            snapshot.version = self.version;
            snapshot.clone()
        };
        self.notifier.emit(ListenerEvent::StateUpdated(snapshot));
    }

    pub(crate) fn set_state(&mut self, state: BindingState) {
        if self.state != state {
            debug!(si = %self.si, from = ?self.state, to = ?state, "binding state changed");
        }
        self.state = state;
        self.publish_state();
    }

    pub(crate) fn record_error(&self, message: String) {
        self.update_snapshot(|snapshot| snapshot.last_error = Some(message));
    }

    /// Operation invoked in the wrong state or role: report it and leave the state alone.
    pub(crate) fn sequencing_error(&mut self, message: String) {
        warn!(si = %self.si, state = ?self.state, "{message}");
        self.record_error(message);
        self.publish_state();
    }

    pub(crate) fn next_invoke_id(&mut self) -> InvokeId {
        let invoke_id = self.next_invoke_id;
        self.next_invoke_id = self.next_invoke_id.wrapping_add(1);
        invoke_id
    }

    fn stamp(&self, pdu: &mut SlePdu) -> Result<(), AuthenticationError> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };
        let kind = pdu.kind();
        match pdu {
            SlePdu::TransferBuffer(buffer) => {
                for entry in &mut buffer.entries {
                    *entry.credentials_mut() = gate.stamp(kind)?;
                }
            }
            other => {
                if let Some(credentials) = other.credentials_mut() {
                    *credentials = gate.stamp(kind)?;
                }
            }
        }
        Ok(())
    }

    fn check_credentials(&self, pdu: &SlePdu) -> Result<(), AuthenticationError> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };
        let kind = pdu.kind();
        match pdu {
            SlePdu::TransferBuffer(buffer) => buffer
                .entries
                .iter()
                .try_for_each(|entry| gate.check(kind, entry.credentials())),
            other => gate.check(kind, other.credentials().unwrap_or(&Credentials::Unused)),
        }
    }

    fn report_send_failure(&self, pdu: SlePdu, message: String) {
        error!(si = %self.si, pdu = pdu.name(), "{message}");
        self.record_error(message.clone());
        self.notifier.emit(ListenerEvent::PduSentError(pdu, message));
    }

    /// Stamp, encode and send a PDU. A failure of the transport ends the association.
    /// Returns whether the PDU was sent.
    pub(crate) fn send_pdu(&mut self, mut pdu: SlePdu) -> bool {
        if let Err(error) = self.stamp(&mut pdu) {
            let message = format!("generating credentials for {} failed: {error}", pdu.name());
            self.report_send_failure(pdu, message);
            return false;
        }
        let raw = match self.codec.encode(&pdu) {
            Ok(raw) => raw,
            Err(error) => {
                let message = format!("encoding {} failed: {error}", pdu.name());
                self.report_send_failure(pdu, message);
                return false;
            }
        };
        if let Err(error) = self.channel.send_pdu(&raw) {
            let message = format!("sending {} failed: {error}", pdu.name());
            self.report_send_failure(pdu, message);
            self.channel.disconnect();
            self.reset_state();
            return false;
        }
        debug!(si = %self.si, pdu = pdu.name(), len = raw.len(), "pdu sent");
        self.rate.lock().record_out(raw.len());
        self.update_snapshot(|snapshot| snapshot.last_pdu_sent = Some(raw));
        self.notifier.emit(ListenerEvent::PduSent(pdu));
        true
    }

    /// Send a confirmed operation invocation and arm its return timer.
    pub(crate) fn send_confirmed(&mut self, pdu: SlePdu, key: ReturnKey) -> bool {
        let operation = pdu.kind();
        let Some(expected) = operation.return_kind() else {
            error!(si = %self.si, %operation, "not a confirmed operation");
            return false;
        };
        if !self.send_pdu(pdu) {
            return false;
        }
        let token = self.next_token;
        self.next_token += 1;
        let executor = self.executor.clone();
        let timer = self.timers.schedule(self.config.return_timeout(), move || {
            executor.submit(TaskOrigin::FromProvider, move |session: &mut Session<S>| {
                session.on_return_timeout(key, token)
            });
        });
        self.pending.insert(
            key,
            PendingReturn {
                operation,
                expected,
                token,
                timer,
            },
        );
        true
    }

    /// Match a received return against the pending operations and stop its timer. Returns
    /// false if no operation awaits this return.
    pub(crate) fn take_pending_return(&mut self, pdu: &SlePdu) -> bool {
        let kind = pdu.kind();
        let key = match kind {
            PduKind::BindReturn => ReturnKey::Bind,
            PduKind::UnbindReturn => ReturnKey::Unbind,
            _ => match pdu.invoke_id() {
                Some(invoke_id) => ReturnKey::Invoke(invoke_id),
                None => return false,
            },
        };
        if !matches!(self.pending.get(&key), Some(pending) if pending.expected == kind) {
            return false;
        }
        if let Some(timer) = self.pending.remove(&key).and_then(|pending| pending.timer) {
            self.timers.cancel(timer);
        }
        true
    }

    fn on_return_timeout(&mut self, key: ReturnKey, token: u64) {
        match self.pending.get(&key) {
            Some(pending) if pending.token == token => (),
            // answered or association already gone
            _ => return,
        }
        let Some(pending) = self.pending.remove(&key) else {
            return;
        };
        let message = format!(
            "return timeout: no {} received within {} s",
            pending.expected, self.config.return_timeout_period
        );
        debug!(si = %self.si, operation = %pending.operation, "return timer expired");
        self.abort_association(PeerAbortDiagnostic::ReturnTimeout, message);
    }

    /// Abort the association with the given diagnostic and record the cause.
    pub(crate) fn abort_association(&mut self, diagnostic: PeerAbortDiagnostic, message: String) {
        warn!(si = %self.si, ?diagnostic, "aborting association: {message}");
        self.record_error(message);
        self.channel.abort(diagnostic.into());
        self.reset_state();
    }

    /// Release the connection without an abort.
    pub(crate) fn release_association(&mut self) {
        self.channel.disconnect();
        self.reset_state();
    }

    pub(crate) fn protocol_violation(&mut self, pdu: SlePdu, message: String) {
        self.notifier
            .emit(ListenerEvent::PduHandlingError(pdu, message.clone()));
        self.abort_association(PeerAbortDiagnostic::ProtocolError, message);
    }

    /// Clear all session scoped state and go back to [BindingState::Unbound].
    fn reset_state(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let Some(timer) = pending.timer {
                self.timers.cancel(timer);
            }
        }
        self.gate = None;
        self.version = None;
        self.next_invoke_id = 0;
        self.bind_response = BindResponse::Accept;
        S::on_reset(self);
        self.set_state(BindingState::Unbound);
    }

    pub(crate) fn bind(&mut self, version: u16) {
        if !self.is_initiator() {
            return self.sequencing_error("BIND invoked by the responder of the association".into());
        }
        if self.state != BindingState::Unbound {
            return self.sequencing_error(format!("BIND invoked in state {:?}", self.state));
        }
        if !self.config.service_type.supports_version(version) {
            return self.sequencing_error(format!(
                "SLE version {version} not supported by {:?}",
                self.config.service_type
            ));
        }
        let responder = self.config.remote_id(S::IS_USER).to_string();
        let gate = match AuthenticationGate::new(&self.peers, &responder) {
            Ok(gate) => gate,
            Err(error) => return self.sequencing_error(format!("BIND not possible: {error}")),
        };
        if let Err(error) = self.channel.connect() {
            let message = format!("connecting to {responder} failed: {error}");
            error!(si = %self.si, "{message}");
            self.record_error(message);
            return self.publish_state();
        }
        self.gate = Some(gate);
        self.version = Some(version);
        self.codec.use_protocol_version(version);
        self.next_invoke_id = 0;
        self.set_state(BindingState::BindPending);
        let invocation = SlePdu::BindInvocation(BindInvocation {
            invoker_credentials: Credentials::Unused,
            initiator_identifier: self.config.initiator_id.clone(),
            responder_port_identifier: self.config.responder_port_id.clone(),
            service_type: self.config.service_type,
            version_number: version,
            service_instance_identifier: self.config.service_instance_identifier.clone(),
        });
        if !self.send_confirmed(invocation, ReturnKey::Bind) && self.state == BindingState::BindPending
        {
            self.release_association();
        }
    }

    pub(crate) fn wait_for_bind(&mut self, response: BindResponse) {
        if self.is_initiator() {
            return self.sequencing_error("wait for BIND invoked by the initiator".into());
        }
        if self.state != BindingState::Unbound {
            return self.sequencing_error(format!("wait for BIND invoked in state {:?}", self.state));
        }
        if let Err(error) = self.channel.listen() {
            let message = format!("listening for BIND failed: {error}");
            error!(si = %self.si, "{message}");
            self.record_error(message);
            return self.publish_state();
        }
        self.bind_response = response;
        self.set_state(BindingState::UnboundWait);
    }

    pub(crate) fn unbind(&mut self, reason: UnbindReason) {
        if !self.is_initiator() {
            return self.sequencing_error("UNBIND invoked by the responder of the association".into());
        }
        if self.state != BindingState::Ready {
            return self.sequencing_error(format!("UNBIND invoked in state {:?}", self.state));
        }
        let invocation = SlePdu::UnbindInvocation(UnbindInvocation {
            invoker_credentials: Credentials::Unused,
            reason,
        });
        if self.send_confirmed(invocation, ReturnKey::Unbind) {
            self.set_state(BindingState::UnbindPending);
        }
    }

    pub(crate) fn peer_abort(&mut self, diagnostic: PeerAbortDiagnostic) {
        if self.state == BindingState::Unbound {
            return self.sequencing_error("PEER-ABORT invoked without association".into());
        }
        info!(si = %self.si, ?diagnostic, "aborting association");
        self.channel.abort(diagnostic.into());
        self.reset_state();
    }

    fn dispose(&mut self) {
        if self.state != BindingState::Unbound {
            info!(si = %self.si, state = ?self.state, "disposing bound service instance");
            self.channel.abort(PeerAbortDiagnostic::OtherReason.into());
            self.reset_state();
        }
    }

    fn on_connected(&mut self) {
        debug!(si = %self.si, "channel connected");
    }

    fn on_channel_disconnected(&mut self, reason: DisconnectReason) {
        if self.state == BindingState::Unbound {
            debug!(si = %self.si, ?reason, "channel closed");
            return;
        }
        let message = match reason {
            DisconnectReason::Regular => "connection released by the peer".to_string(),
            DisconnectReason::PeerAbort(diagnostic) => {
                format!("peer abort received with diagnostic {diagnostic:?}")
            }
            DisconnectReason::CommunicationFailure => "communication failure".to_string(),
        };
        warn!(si = %self.si, state = ?self.state, "{message}");
        self.record_error(message);
        self.reset_state();
    }

    fn on_pdu_received(&mut self, raw: Vec<u8>) {
        self.rate.lock().record_in(raw.len());
        self.update_snapshot(|snapshot| snapshot.last_pdu_received = Some(raw.clone()));
        let pdu = match self.codec.decode(&raw) {
            Ok(pdu) => pdu,
            Err(error) => {
                let message = format!("decoding received pdu failed: {error}");
                self.notifier.emit(ListenerEvent::PduDecodingError(raw));
                if self.state == BindingState::Unbound {
                    warn!(si = %self.si, "{message}");
                    return self.record_error(message);
                }
                return self.abort_association(PeerAbortDiagnostic::EncodingError, message);
            }
        };
        if self.state == BindingState::Unbound {
            warn!(si = %self.si, pdu = pdu.name(), "pdu received without association, ignored");
            return;
        }
        debug!(si = %self.si, pdu = pdu.name(), len = raw.len(), "pdu received");
        self.notifier.emit(ListenerEvent::PduReceived(pdu.clone()));
        let kind = pdu.kind();
        let Some(handler) = self.handlers.get(kind) else {
            let message = format!("{kind} not expected by the {} side", S::NAME);
            return self.protocol_violation(pdu, message);
        };
        // The credentials of a BIND invocation are checked once the peer is identified.
        if kind != PduKind::BindInvocation {
            if let Err(error) = self.check_credentials(&pdu) {
                let message = format!("authentication of {kind} failed: {error}");
                self.notifier
                    .emit(ListenerEvent::PduHandlingError(pdu, message.clone()));
                return self.abort_association(PeerAbortDiagnostic::AccessDenied, message);
            }
        }
        handler(self, pdu);
    }

    fn validate_bind(&self, invocation: &BindInvocation) -> Option<BindDiagnostic> {
        if invocation.initiator_identifier != self.config.initiator_id {
            return Some(BindDiagnostic::SiNotAccessibleToThisInitiator);
        }
        if invocation.service_instance_identifier != self.config.service_instance_identifier {
            return Some(BindDiagnostic::NoSuchServiceInstance);
        }
        if invocation.responder_port_identifier != self.config.responder_port_id {
            return Some(BindDiagnostic::OtherReason);
        }
        if invocation.service_type != self.config.service_type {
            return Some(BindDiagnostic::InconsistentServiceType);
        }
        if !invocation
            .service_type
            .supports_version(invocation.version_number)
        {
            return Some(BindDiagnostic::VersionNotSupported);
        }
        match self.bind_response {
            BindResponse::Accept => None,
            BindResponse::Reject(diagnostic) => Some(diagnostic),
        }
    }

    fn handle_bind_invocation(&mut self, pdu: SlePdu) {
        if self.is_initiator() || self.state != BindingState::UnboundWait {
            let message = format!("BIND received in state {:?}", self.state);
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::BindInvocation(invocation) = pdu else {
            return;
        };
        let initiator = invocation.initiator_identifier.as_str();
        let gate = AuthenticationGate::new(&self.peers, initiator).and_then(|gate| {
            gate.check(PduKind::BindInvocation, &invocation.invoker_credentials)
                .map(|_| gate)
        });
        let gate = match gate {
            Ok(gate) => gate,
            Err(error) => {
                // No BIND-RETURN for an unauthenticated initiator.
                let message = format!("BIND from {initiator} not authenticated: {error}");
                warn!(si = %self.si, "{message}");
                self.record_error(message);
                return self.release_association();
            }
        };
        self.gate = Some(gate);
        let responder_identifier = self.config.responder_id.clone();
        if let Some(diagnostic) = self.validate_bind(&invocation) {
            let message = format!("BIND from {initiator} rejected with {diagnostic:?}");
            info!(si = %self.si, "{message}");
            self.record_error(message);
            self.send_pdu(SlePdu::BindReturn(BindReturn {
                performer_credentials: Credentials::Unused,
                responder_identifier,
                result: Err(diagnostic),
            }));
            if self.state != BindingState::Unbound {
                self.release_association();
            }
            return;
        }
        let version = invocation.version_number;
        self.version = Some(version);
        self.codec.use_protocol_version(version);
        self.next_invoke_id = 0;
        let positive = SlePdu::BindReturn(BindReturn {
            performer_credentials: Credentials::Unused,
            responder_identifier,
            result: Ok(version),
        });
        if self.send_pdu(positive) {
            info!(si = %self.si, initiator, version, "association established");
            self.set_state(BindingState::Ready);
        } else if self.state != BindingState::Unbound {
            self.release_association();
        }
    }

    fn handle_bind_return(&mut self, pdu: SlePdu) {
        if !self.is_initiator()
            || self.state != BindingState::BindPending
            || !self.take_pending_return(&pdu)
        {
            let message = format!("BIND-RETURN received in state {:?}", self.state);
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::BindReturn(bind_return) = pdu else {
            return;
        };
        if bind_return.responder_identifier != self.config.responder_id {
            let message = format!(
                "BIND-RETURN from unexpected responder {}",
                bind_return.responder_identifier
            );
            return self.abort_association(PeerAbortDiagnostic::UnexpectedResponderId, message);
        }
        match bind_return.result {
            Ok(version) if Some(version) == self.version => {
                info!(si = %self.si, version, "association established");
                self.set_state(BindingState::Ready);
            }
            Ok(version) => {
                let message = format!(
                    "BIND-RETURN with version {version}, requested {:?}",
                    self.version
                );
                self.abort_association(PeerAbortDiagnostic::ProtocolError, message);
            }
            Err(diagnostic) => {
                let message = format!("BIND rejected by the responder with {diagnostic:?}");
                warn!(si = %self.si, "{message}");
                self.record_error(message);
                self.release_association();
            }
        }
    }

    fn handle_unbind_invocation(&mut self, pdu: SlePdu) {
        if self.is_initiator() || self.state != BindingState::Ready {
            let message = format!("UNBIND received in state {:?}", self.state);
            return self.protocol_violation(pdu, message);
        }
        if let SlePdu::UnbindInvocation(invocation) = &pdu {
            info!(si = %self.si, reason = ?invocation.reason, "UNBIND received");
        }
        self.send_pdu(SlePdu::UnbindReturn(UnbindReturn {
            responder_credentials: Credentials::Unused,
        }));
        if self.state != BindingState::Unbound {
            self.release_association();
        }
    }

    fn handle_unbind_return(&mut self, pdu: SlePdu) {
        if !self.is_initiator()
            || self.state != BindingState::UnbindPending
            || !self.take_pending_return(&pdu)
        {
            let message = format!("UNBIND-RETURN received in state {:?}", self.state);
            return self.protocol_violation(pdu, message);
        }
        info!(si = %self.si, "association released");
        self.release_association();
    }

    fn register_common_handlers(handlers: &mut HandlerRegistry<S>) {
        handlers.register(PduKind::BindInvocation, Self::handle_bind_invocation);
        handlers.register(PduKind::BindReturn, Self::handle_bind_return);
        handlers.register(PduKind::UnbindInvocation, Self::handle_unbind_invocation);
        handlers.register(PduKind::UnbindReturn, Self::handle_unbind_return);
    }
}

/// Public handle of a service instance.
pub struct ServiceInstance<S: SessionSide> {
    si: Arc<str>,
    config: Arc<ServiceInstanceConfiguration>,
    snapshot: Arc<Mutex<StateSnapshot>>,
    rate: Arc<Mutex<RateCounter>>,
    pub(crate) shared: S::Shared,
    executor: SerialExecutor<Session<S>>,
    notifications: SerialExecutor<ListenerSet>,
    timers: TimerService,
}

impl<S: SessionSide> ServiceInstance<S> {
    pub(crate) fn with_side(
        peers: Arc<PeerConfiguration>,
        config: Arc<ServiceInstanceConfiguration>,
        mut channel: Box<dyn TransportChannel>,
        codec: Box<dyn PduCodec>,
        mut side: S,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let si: Arc<str> = Arc::from(config.service_instance_identifier.as_str());
        let snapshot = Arc::new(Mutex::new(StateSnapshot::default()));
        let rate = Arc::new(Mutex::new(RateCounter::default()));
        let timers = TimerService::new("sle-timer")?;
        let notifications = SerialExecutor::new("sle-notify", ListenerSet::new(si.clone()))?;
        let shared = side.shared();
        let session_si = si.clone();
        let session_config = config.clone();
        let session_snapshot = snapshot.clone();
        let session_rate = rate.clone();
        let notifier = Notifier::new(notifications.handle());
        let timer_handle = timers.handle();
        let executor = SerialExecutor::new_with(
            "sle-session",
            move |executor: ExecutorHandle<Session<S>>| {
                channel.register_observer(Arc::new(SessionObserver {
                    executor: executor.clone(),
                }));
                side.attach(&session_si, &executor, &timer_handle);
                let mut handlers = HandlerRegistry::default();
                Session::register_common_handlers(&mut handlers);
                S::register_handlers(&mut handlers);
                Session {
                    si: session_si,
                    peers,
                    config: session_config,
                    state: BindingState::Unbound,
                    version: None,
                    next_invoke_id: 0,
                    pending: HashMap::new(),
                    next_token: 0,
                    gate: None,
                    bind_response: BindResponse::Accept,
                    channel,
                    codec,
                    handlers,
                    snapshot: session_snapshot,
                    rate: session_rate,
                    notifier,
                    executor,
                    timers: timer_handle,
                    side,
                }
            },
        )?;
        info!(si = %si, side = S::NAME, service = ?config.service_type, "service instance created");
        Ok(Self {
            si,
            config,
            snapshot,
            rate,
            shared,
            executor,
            notifications,
            timers,
        })
    }

    /// Queue an operation of the local application on the session executor.
    pub(crate) fn submit(&self, task: impl FnOnce(&mut Session<S>) + Send + 'static) {
        if !self.executor.submit(TaskOrigin::FromUser, task) {
            warn!(si = %self.si, "operation ignored, service instance disposed");
        }
    }

    #[inline]
    pub fn service_instance_identifier(&self) -> &str {
        &self.si
    }

    #[inline]
    pub fn configuration(&self) -> &ServiceInstanceConfiguration {
        &self.config
    }

    /// Initiate the association with the given SLE version.
    pub fn bind(&self, version: u16) {
        self.submit(move |session| session.bind(version));
    }

    /// Accept the next BIND invocation of the initiator.
    pub fn wait_for_bind(&self, response: BindResponse) {
        self.submit(move |session| session.wait_for_bind(response));
    }

    pub fn unbind(&self, reason: UnbindReason) {
        self.submit(move |session| session.unbind(reason));
    }

    pub fn peer_abort(&self, diagnostic: PeerAbortDiagnostic) {
        self.submit(move |session| session.peer_abort(diagnostic));
    }

    pub fn register(&self, listener: Arc<dyn ServiceInstanceListener>) {
        self.notifications
            .submit(TaskOrigin::FromUser, move |set| set.register(listener));
    }

    pub fn deregister(&self, listener: &Arc<dyn ServiceInstanceListener>) {
        let listener = listener.clone();
        self.notifications
            .submit(TaskOrigin::FromUser, move |set| set.deregister(&listener));
    }

    pub fn current_binding_state(&self) -> BindingState {
        self.snapshot.lock().binding_state
    }

    pub fn current_state(&self) -> StateSnapshot {
        self.snapshot.lock().clone()
    }

    /// Transfer rates since the previous call.
    pub fn current_rate(&self) -> DataRate {
        self.rate.lock().sample()
    }

    /// Abort any association and stop all threads of the instance. Operations invoked
    /// afterwards are ignored.
    pub fn dispose(&self) {
        if self.executor.is_shut_down() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        if self.executor.submit(TaskOrigin::FromUser, move |session| {
            session.dispose();
            let _ = tx.send(());
        }) && rx.recv_timeout(DISPOSE_TIMEOUT).is_err()
        {
            warn!(si = %self.si, "service instance did not settle before disposal");
        }
        self.executor.shutdown();
        self.timers.shutdown();
        // Deliver the notifications queued so far.
        let (tx, rx) = mpsc::channel();
        if self
            .notifications
            .submit(TaskOrigin::FromProvider, move |_| {
                let _ = tx.send(());
            })
        {
            let _ = rx.recv_timeout(DISPOSE_TIMEOUT);
        }
        self.notifications.shutdown();
        info!(si = %self.si, "service instance disposed");
    }
}

impl<S: SessionSide> Drop for ServiceInstance<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthenticationMode, DeliveryMode, HashFunction};
    use crate::credentials::generate_credentials;
    use crate::pdu::{RequestedFrameFilter, RequestedFrameQuality, StartInvocation};
    use crate::provider::ReturnServiceProvider;
    use crate::test_util::{
        peer_config, raf_config, wait_for, MockChannel, PostcardCodec, PROVIDER_ID, USER_ID,
    };
    use crate::user::ReturnServiceUser;

    fn user_with(
        channel: &MockChannel,
        mode: AuthenticationMode,
        config: ServiceInstanceConfiguration,
    ) -> ReturnServiceUser {
        ReturnServiceUser::new(
            Arc::new(peer_config(USER_ID, mode)),
            Arc::new(config),
            channel.boxed(),
            Box::new(PostcardCodec::default()),
        )
        .unwrap()
    }

    fn provider_with(channel: &MockChannel, mode: AuthenticationMode) -> ReturnServiceProvider {
        ReturnServiceProvider::new(
            Arc::new(peer_config(PROVIDER_ID, mode)),
            Arc::new(raf_config(DeliveryMode::TimelyOnline)),
            channel.boxed(),
            Box::new(PostcardCodec::default()),
        )
        .unwrap()
    }

    fn bind_return(result: Result<u16, BindDiagnostic>) -> SlePdu {
        SlePdu::BindReturn(BindReturn {
            performer_credentials: Credentials::Unused,
            responder_identifier: PROVIDER_ID.to_string(),
            result,
        })
    }

    fn bind_invocation(credentials: Credentials, version: u16) -> SlePdu {
        let config = raf_config(DeliveryMode::TimelyOnline);
        SlePdu::BindInvocation(BindInvocation {
            invoker_credentials: credentials,
            initiator_identifier: USER_ID.to_string(),
            responder_port_identifier: config.responder_port_id,
            service_type: config.service_type,
            version_number: version,
            service_instance_identifier: config.service_instance_identifier,
        })
    }

    fn bound_user(channel: &MockChannel) -> ReturnServiceUser {
        let user = user_with(
            channel,
            AuthenticationMode::None,
            raf_config(DeliveryMode::TimelyOnline),
        );
        user.bind(5);
        assert!(wait_for(|| user.current_binding_state() == BindingState::BindPending));
        channel.inject(&bind_return(Ok(5)));
        assert!(wait_for(|| user.current_binding_state() == BindingState::Ready));
        user
    }

    fn last_error(snapshot: &StateSnapshot) -> &str {
        snapshot.last_error.as_deref().unwrap_or_default()
    }

    #[test]
    fn test_bind_and_unbind_as_initiator() {
        let channel = MockChannel::default();
        let user = bound_user(&channel);
        assert_eq!(channel.connects(), 1);
        assert_eq!(user.current_state().version, Some(5));
        assert!(matches!(
            channel.sent().first(),
            Some(SlePdu::BindInvocation(BindInvocation { version_number: 5, .. }))
        ));

        user.unbind(UnbindReason::End);
        assert!(wait_for(|| user.current_binding_state() == BindingState::UnbindPending));
        assert!(matches!(
            channel.last_sent(),
            Some(SlePdu::UnbindInvocation(UnbindInvocation { reason: UnbindReason::End, .. }))
        ));
        channel.inject(&SlePdu::UnbindReturn(UnbindReturn {
            responder_credentials: Credentials::Unused,
        }));
        assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
        assert_eq!(channel.disconnects(), 1);
        assert!(channel.aborts().is_empty());
        assert_eq!(user.current_state().version, None);
    }

    #[test]
    fn test_bind_return_timeout() {
        let channel = MockChannel::default();
        let mut config = raf_config(DeliveryMode::TimelyOnline);
        config.return_timeout_period = 1;
        let user = user_with(&channel, AuthenticationMode::None, config);
        user.bind(5);
        assert!(wait_for(|| user.current_binding_state() == BindingState::BindPending));
        assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
        assert_eq!(
            channel.aborts(),
            vec![u8::from(PeerAbortDiagnostic::ReturnTimeout)]
        );
        assert_eq!(
            last_error(&user.current_state()),
            "return timeout: no BIND-RETURN received within 1 s"
        );
    }

    #[test]
    fn test_answered_operation_does_not_time_out() {
        let channel = MockChannel::default();
        let mut config = raf_config(DeliveryMode::TimelyOnline);
        config.return_timeout_period = 1;
        let user = user_with(&channel, AuthenticationMode::None, config);
        user.bind(5);
        assert!(wait_for(|| user.current_binding_state() == BindingState::BindPending));
        channel.inject(&bind_return(Ok(5)));
        assert!(wait_for(|| user.current_binding_state() == BindingState::Ready));
        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(user.current_binding_state(), BindingState::Ready);
        assert!(channel.aborts().is_empty());
    }

    #[test]
    fn test_operations_in_wrong_state_keep_state() {
        let channel = MockChannel::default();
        let user = user_with(
            &channel,
            AuthenticationMode::None,
            raf_config(DeliveryMode::TimelyOnline),
        );
        user.unbind(UnbindReason::End);
        assert!(wait_for(|| user.current_state().last_error.is_some()));
        assert_eq!(last_error(&user.current_state()), "UNBIND invoked in state Unbound");
        assert_eq!(user.current_binding_state(), BindingState::Unbound);

        user.wait_for_bind(BindResponse::Accept);
        assert!(wait_for(|| last_error(&user.current_state())
            == "wait for BIND invoked by the initiator"));
        user.bind(6);
        assert!(wait_for(|| last_error(&user.current_state()).contains("version 6")));
        assert_eq!(channel.sent_count(), 0);
        assert_eq!(channel.connects(), 0);
    }

    #[test]
    fn test_bind_rejected_by_responder() {
        let channel = MockChannel::default();
        let user = user_with(
            &channel,
            AuthenticationMode::None,
            raf_config(DeliveryMode::TimelyOnline),
        );
        user.bind(5);
        assert!(wait_for(|| user.current_binding_state() == BindingState::BindPending));
        channel.inject(&bind_return(Err(BindDiagnostic::OutOfService)));
        assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
        assert_eq!(channel.disconnects(), 1);
        assert!(channel.aborts().is_empty());
        assert!(last_error(&user.current_state()).contains("OutOfService"));
    }

    #[test]
    fn test_unexpected_responder_aborts() {
        let channel = MockChannel::default();
        let user = user_with(
            &channel,
            AuthenticationMode::None,
            raf_config(DeliveryMode::TimelyOnline),
        );
        user.bind(5);
        assert!(wait_for(|| user.current_binding_state() == BindingState::BindPending));
        channel.inject(&SlePdu::BindReturn(BindReturn {
            performer_credentials: Credentials::Unused,
            responder_identifier: "OTHER-GS".to_string(),
            result: Ok(5),
        }));
        assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
        assert_eq!(
            channel.aborts(),
            vec![u8::from(PeerAbortDiagnostic::UnexpectedResponderId)]
        );
    }

    #[test]
    fn test_responder_accepts_bind() {
        let channel = MockChannel::default();
        let provider = provider_with(&channel, AuthenticationMode::None);
        provider.wait_for_bind(BindResponse::Accept);
        assert!(wait_for(|| provider.current_binding_state() == BindingState::UnboundWait));
        assert_eq!(channel.listens(), 1);
        channel.inject(&bind_invocation(Credentials::Unused, 4));
        assert!(wait_for(|| provider.current_binding_state() == BindingState::Ready));
        assert_eq!(
            channel.last_sent(),
            Some(SlePdu::BindReturn(BindReturn {
                performer_credentials: Credentials::Unused,
                responder_identifier: PROVIDER_ID.to_string(),
                result: Ok(4),
            }))
        );
        assert_eq!(provider.current_state().version, Some(4));
    }

    #[test]
    fn test_responder_rejects_bind() {
        let channel = MockChannel::default();
        let provider = provider_with(&channel, AuthenticationMode::None);
        provider.wait_for_bind(BindResponse::Reject(BindDiagnostic::OutOfService));
        assert!(wait_for(|| provider.current_binding_state() == BindingState::UnboundWait));
        channel.inject(&bind_invocation(Credentials::Unused, 5));
        assert!(wait_for(|| channel.sent_count() == 1));
        assert!(matches!(
            channel.last_sent(),
            Some(SlePdu::BindReturn(BindReturn {
                result: Err(BindDiagnostic::OutOfService),
                ..
            }))
        ));
        assert!(wait_for(|| provider.current_binding_state() == BindingState::Unbound));

        provider.wait_for_bind(BindResponse::Accept);
        assert!(wait_for(|| provider.current_binding_state() == BindingState::UnboundWait));
        channel.inject(&bind_invocation(Credentials::Unused, 6));
        assert!(wait_for(|| channel.sent_count() == 2));
        assert!(matches!(
            channel.last_sent(),
            Some(SlePdu::BindReturn(BindReturn {
                result: Err(BindDiagnostic::VersionNotSupported),
                ..
            }))
        ));
        assert!(wait_for(|| provider.current_binding_state() == BindingState::Unbound));
    }

    #[test]
    fn test_unauthenticated_bind_gets_no_answer() {
        let channel = MockChannel::default();
        let provider = provider_with(&channel, AuthenticationMode::All);
        provider.wait_for_bind(BindResponse::Accept);
        assert!(wait_for(|| provider.current_binding_state() == BindingState::UnboundWait));
        channel.inject(&bind_invocation(Credentials::Unused, 5));
        assert!(wait_for(|| provider.current_binding_state() == BindingState::Unbound));
        assert_eq!(channel.sent_count(), 0);
        assert_eq!(channel.disconnects(), 1);
        assert!(last_error(&provider.current_state()).contains("not authenticated"));
    }

    #[test]
    fn test_authenticated_association() {
        let channel = MockChannel::default();
        let provider = provider_with(&channel, AuthenticationMode::All);
        provider.wait_for_bind(BindResponse::Accept);
        assert!(wait_for(|| provider.current_binding_state() == BindingState::UnboundWait));
        let credentials = generate_credentials(USER_ID, b"MCS-pw", HashFunction::Sha256).unwrap();
        channel.inject(&bind_invocation(Credentials::Used(credentials), 5));
        assert!(wait_for(|| provider.current_binding_state() == BindingState::Ready));
        let Some(SlePdu::BindReturn(positive)) = channel.last_sent() else {
            panic!("BIND-RETURN expected");
        };
        assert!(positive.performer_credentials.is_used());

        // Every operation is authenticated in this mode.
        channel.inject(&SlePdu::StartInvocation(StartInvocation {
            invoker_credentials: Credentials::Unused,
            invoke_id: 0,
            start_time: None,
            stop_time: None,
            filter: RequestedFrameFilter::Raf(RequestedFrameQuality::AllFrames),
        }));
        assert!(wait_for(|| provider.current_binding_state() == BindingState::Unbound));
        assert_eq!(
            channel.aborts(),
            vec![u8::from(PeerAbortDiagnostic::AccessDenied)]
        );
    }

    #[test]
    fn test_undecodable_pdu_aborts() {
        let channel = MockChannel::default();
        let user = bound_user(&channel);
        channel.inject_raw(vec![0xff, 0xff, 0xff]);
        assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
        assert_eq!(
            channel.aborts(),
            vec![u8::from(PeerAbortDiagnostic::EncodingError)]
        );
        assert!(last_error(&user.current_state()).starts_with("decoding received pdu failed"));
    }

    #[test]
    fn test_send_failure_ends_association() {
        let channel = MockChannel::default();
        let user = bound_user(&channel);
        channel.set_fail_send(true);
        user.start(
            None,
            None,
            RequestedFrameFilter::Raf(RequestedFrameQuality::GoodFramesOnly),
        );
        assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
        assert_eq!(channel.disconnects(), 1);
        assert!(last_error(&user.current_state()).starts_with("sending START failed"));
    }

    #[test]
    fn test_peer_abort_from_transport() {
        let channel = MockChannel::default();
        let user = bound_user(&channel);
        channel.inject_disconnect(DisconnectReason::PeerAbort(
            PeerAbortDiagnostic::OperationalRequirement,
        ));
        assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
        assert_eq!(
            last_error(&user.current_state()),
            "peer abort received with diagnostic OperationalRequirement"
        );
        assert!(channel.aborts().is_empty());
    }

    #[derive(Default)]
    struct StateRecorder {
        states: Mutex<Vec<BindingState>>,
        received: Mutex<Vec<PduKind>>,
    }

    impl ServiceInstanceListener for StateRecorder {
        fn on_state_updated(&self, _si: &str, state: &StateSnapshot) {
            self.states.lock().push(state.binding_state);
        }

        fn on_pdu_received(&self, _si: &str, pdu: &SlePdu) {
            self.received.lock().push(pdu.kind());
        }
    }

    #[test]
    fn test_listener_sees_binding_states() {
        let channel = MockChannel::default();
        let user = user_with(
            &channel,
            AuthenticationMode::None,
            raf_config(DeliveryMode::TimelyOnline),
        );
        let recorder = Arc::new(StateRecorder::default());
        let listener: Arc<dyn ServiceInstanceListener> = recorder.clone();
        user.register(listener.clone());
        user.bind(5);
        assert!(wait_for(|| user.current_binding_state() == BindingState::BindPending));
        channel.inject(&bind_return(Ok(5)));
        assert!(wait_for(|| recorder.states.lock().last() == Some(&BindingState::Ready)));
        assert_eq!(
            *recorder.states.lock(),
            vec![BindingState::BindPending, BindingState::Ready]
        );
        assert_eq!(*recorder.received.lock(), vec![PduKind::BindReturn]);

        user.deregister(&listener);
        user.peer_abort(PeerAbortDiagnostic::OtherReason);
        assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(recorder.states.lock().len(), 2);
    }

    #[test]
    fn test_dispose_aborts_association() {
        let channel = MockChannel::default();
        let user = bound_user(&channel);
        user.dispose();
        assert_eq!(user.current_binding_state(), BindingState::Unbound);
        assert_eq!(
            channel.aborts(),
            vec![u8::from(PeerAbortDiagnostic::OtherReason)]
        );
        let sent = channel.sent_count();
        user.bind(5);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(channel.sent_count(), sent);
    }
}
