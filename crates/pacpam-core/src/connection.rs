//! Transport-level connection machine (L2)
//!
//! Owns the physical link lifecycle and the authenticated handshake:
//!
//! ```text
//! IDLE → INITIALIZING → READY → CONNECTING → AUTHENTICATING → CONNECTED
//! ```
//!
//! Dials are guarded by the target peer's circuit breaker and report their
//! outcome back to it. Authentication failures resolve to READY and never
//! count against the breaker. Transport faults are folded into machine events.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{AppEvent, Outbox, TransportCommand, TransportEvent};
use crate::circuit_breaker::{BreakerInfo, BreakerRegistry};
use crate::config::{CircuitBreakerConfig, ConnectionConfig};
use crate::engine::{impl_label, Definition, Hooks, Label, Machine, StateEngine, TransitionDef, TransitionRecord};
use crate::errors::PolicyError;
use crate::protocol::{AuthMessage, Credentials, Frame};
use crate::timers::Timers;
use crate::types::{duration_millis, Identity, PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Machine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    Initializing,
    Ready,
    Connecting,
    Authenticating,
    Connected,
}

impl_label!(ConnectionState {
    Idle => "IDLE",
    Initializing => "INITIALIZING",
    Ready => "READY",
    Connecting => "CONNECTING",
    Authenticating => "AUTHENTICATING",
    Connected => "CONNECTED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Init,
    PeerOpen,
    IdUnavailable,
    PeerCreationError,
    SignalingError,
    SignalingLost,
    ConnectTo,
    ConnectionOpen,
    ConnectionError,
    PeerUnavailable,
    Timeout,
    AuthSuccess,
    AuthFailed,
    AuthTimeout,
    Close,
    PingTimeout,
    Disconnect,
}

impl_label!(ConnectionEvent {
    Init => "INIT",
    PeerOpen => "PEER_OPEN",
    IdUnavailable => "ID_UNAVAILABLE",
    PeerCreationError => "PEER_CREATION_ERROR",
    SignalingError => "SIGNALING_ERROR",
    SignalingLost => "SIGNALING_LOST",
    ConnectTo => "CONNECT_TO",
    ConnectionOpen => "CONNECTION_OPEN",
    ConnectionError => "CONNECTION_ERROR",
    PeerUnavailable => "PEER_UNAVAILABLE",
    Timeout => "TIMEOUT",
    AuthSuccess => "AUTH_SUCCESS",
    AuthFailed => "AUTH_FAILED",
    AuthTimeout => "AUTH_TIMEOUT",
    Close => "CLOSE",
    PingTimeout => "PING_TIMEOUT",
    Disconnect => "DISCONNECT",
});

/// Dial admission by the target's circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionGuard {
    BreakerNotOpen,
}

impl_label!(ConnectionGuard { BreakerNotOpen => "cb not OPEN" });

/// Dial outcome reported to the active circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEmit {
    BreakerSuccess,
    BreakerFailure,
}

impl_label!(ConnectionEmit {
    BreakerSuccess => "cb.SUCCESS",
    BreakerFailure => "cb.FAILURE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionAction {
    ReconnectSignaling,
}

impl_label!(ConnectionAction { ReconnectSignaling => "reconnect signaling" });

/// L2 connection machine
#[derive(Debug)]
pub struct ConnectionMachine;

impl Machine for ConnectionMachine {
    type State = ConnectionState;
    type Event = ConnectionEvent;
    type Guard = ConnectionGuard;
    type Emit = ConnectionEmit;
    type Action = ConnectionAction;

    const NAME: &'static str = "connection";

    fn definition() -> &'static Definition<Self> {
        use ConnectionEmit::*;
        use ConnectionEvent::*;
        use ConnectionState::*;

        static DEFINITION: OnceLock<Definition<ConnectionMachine>> = OnceLock::new();
        DEFINITION.get_or_init(|| {
            Definition::new(
                Idle,
                &[Idle, Initializing, Ready, Connecting, Authenticating, Connected],
            )
            .with(TransitionDef::new("c1", Idle, Init, Initializing))
            .with(TransitionDef::new("c2", Initializing, PeerOpen, Ready))
            .with(TransitionDef::new("c3", Initializing, IdUnavailable, Idle))
            .with(TransitionDef::new("c4", Initializing, PeerCreationError, Idle))
            .with(TransitionDef::new("c5", Initializing, SignalingError, Idle))
            .with(TransitionDef::new("c6", Ready, ConnectTo, Connecting).guard(ConnectionGuard::BreakerNotOpen))
            .with(TransitionDef::new("c7", Ready, ConnectionOpen, Authenticating))
            .with(TransitionDef::new("c8", Ready, SignalingLost, Idle))
            .with(TransitionDef::new("c9", Ready, SignalingError, Idle))
            .with(TransitionDef::new("c10", Ready, ConnectionError, Idle))
            .with(TransitionDef::new("c11", Ready, Disconnect, Idle))
            .with(TransitionDef::new("c12", Connecting, ConnectionOpen, Authenticating).emit(BreakerSuccess))
            .with(TransitionDef::new("c13", Connecting, Timeout, Ready).emit(BreakerFailure))
            .with(TransitionDef::new("c14", Connecting, PeerUnavailable, Ready).emit(BreakerFailure))
            .with(TransitionDef::new("c15", Connecting, SignalingError, Ready).emit(BreakerFailure))
            .with(TransitionDef::new("c16", Connecting, ConnectionError, Ready).emit(BreakerFailure))
            .with(TransitionDef::new("c17", Connecting, Disconnect, Idle))
            .with(TransitionDef::new("c18", Authenticating, AuthSuccess, Connected))
            .with(TransitionDef::new("c19", Authenticating, AuthFailed, Ready))
            .with(TransitionDef::new("c20", Authenticating, AuthTimeout, Ready))
            .with(TransitionDef::new("c21", Authenticating, Close, Ready))
            .with(TransitionDef::new("c22", Authenticating, SignalingError, Ready))
            .with(TransitionDef::new("c23", Authenticating, ConnectionError, Ready))
            .with(TransitionDef::new("c24", Authenticating, Disconnect, Idle))
            .with(TransitionDef::new("c25", Connected, Close, Ready))
            .with(TransitionDef::new("c26", Connected, PingTimeout, Ready))
            .with(TransitionDef::new("c27", Connected, SignalingLost, Connected).action(ConnectionAction::ReconnectSignaling))
            .with(TransitionDef::new("c28", Connected, SignalingError, Ready))
            .with(TransitionDef::new("c29", Connected, ConnectionError, Ready))
            .with(TransitionDef::new("c30", Connected, Disconnect, Idle))
        })
    }
}

// ----------------------------------------------------------------------------
// Outcome Types
// ----------------------------------------------------------------------------

/// Why an established link went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// The remote side closed the link
    PeerLeft,
    /// Keepalive timeout, link or signaling error
    Network,
    /// Local `disconnect()`
    Local,
}

/// Why a handshake attempt ended without reaching CONNECTED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    /// The peer's digest did not match ours
    Mismatch,
    Timeout,
    /// The link closed mid-handshake
    PeerClosed,
    Network,
}

/// What the caller should do with an inbound frame after L2 saw it
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Fully handled at L2 (or dropped)
    Consumed,
    /// Handled at L2 and counts as evidence of peer presence
    Presence,
    /// Session-layer frame to route upward (also counts as presence)
    Deliver(Frame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTimer {
    Connect,
    Auth,
    Keepalive,
    SignalingRetry,
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ConnectionCore {
    config: ConnectionConfig,
    credentials: Credentials,
    identity: Option<Identity>,
    local_id: Option<PeerId>,
    remote: Option<PeerId>,
    is_host: bool,
    link_active: bool,
    breakers: BreakerRegistry,
    active_breaker: Option<PeerId>,
    last_rejection: Option<u64>,
    timers: Timers<ConnectionTimer>,
    last_pong: Timestamp,
    pending_auth: Option<AuthMessage>,
    transitions: Vec<TransitionRecord<ConnectionMachine>>,
}

impl ConnectionCore {
    fn close_link(&mut self, out: &mut Outbox) {
        if self.link_active {
            out.command(TransportCommand::CloseLink);
            self.link_active = false;
        }
    }
}

struct ConnectionHooks<'a> {
    core: &'a mut ConnectionCore,
    out: &'a mut Outbox,
    now: Timestamp,
}

impl Hooks<ConnectionMachine> for ConnectionHooks<'_> {
    fn check_guard(&mut self, guard: ConnectionGuard) -> bool {
        match guard {
            ConnectionGuard::BreakerNotOpen => {
                let Some(peer) = self.core.active_breaker.clone() else {
                    return true;
                };
                match self.core.breakers.admit(&peer, self.now) {
                    Ok(()) => true,
                    Err(retry_in) => {
                        self.core.last_rejection = Some(retry_in);
                        false
                    }
                }
            }
        }
    }

    fn on_exit(&mut self, state: ConnectionState, record: &TransitionRecord<ConnectionMachine>) {
        match state {
            ConnectionState::Connecting => {
                self.core.timers.cancel(ConnectionTimer::Connect);
            }
            ConnectionState::Authenticating => {
                self.core.timers.cancel(ConnectionTimer::Auth);
                self.core.pending_auth = None;
                if record.to != ConnectionState::Connected {
                    let reason = match record.event {
                        ConnectionEvent::AuthFailed => Some(AuthFailure::Mismatch),
                        ConnectionEvent::AuthTimeout => Some(AuthFailure::Timeout),
                        ConnectionEvent::Close => Some(AuthFailure::PeerClosed),
                        ConnectionEvent::Disconnect => None,
                        _ => Some(AuthFailure::Network),
                    };
                    if let Some(reason) = reason {
                        warn!(peer = ?self.core.remote, ?reason, "authentication failed");
                        self.out.event(AppEvent::AuthFailed {
                            peer_id: self.core.remote.clone(),
                            reason,
                        });
                    }
                    self.core.close_link(self.out);
                }
            }
            ConnectionState::Connected => {
                self.core.timers.cancel(ConnectionTimer::Keepalive);
                self.core.timers.cancel(ConnectionTimer::SignalingRetry);
                let cause = match record.event {
                    ConnectionEvent::Close => DisconnectCause::PeerLeft,
                    ConnectionEvent::Disconnect => DisconnectCause::Local,
                    _ => DisconnectCause::Network,
                };
                info!(peer = ?self.core.remote, ?cause, "link lost");
                self.out.event(AppEvent::Disconnected {
                    peer_id: self.core.remote.clone(),
                    cause,
                });
                self.core.close_link(self.out);
            }
            _ => {}
        }
    }

    fn on_transition(&mut self, record: &TransitionRecord<ConnectionMachine>) {
        self.core.transitions.push(*record);
        self.out.event(AppEvent::ConnectionStateChanged {
            from: record.from,
            to: record.to,
            event: record.event.label(),
            transition_id: record.id,
        });
    }

    fn on_action(&mut self, action: ConnectionAction, _record: &TransitionRecord<ConnectionMachine>) {
        match action {
            ConnectionAction::ReconnectSignaling => {
                let at = self.now + self.core.config.signaling_retry_delay;
                self.core.timers.arm(ConnectionTimer::SignalingRetry, at);
            }
        }
    }

    fn on_entry(&mut self, state: ConnectionState, record: &TransitionRecord<ConnectionMachine>) {
        match state {
            ConnectionState::Idle => {
                self.core.timers.cancel_all();
                self.core.close_link(self.out);
                self.out.command(TransportCommand::Destroy);
                self.core.remote = None;
                self.core.is_host = false;
                self.core.pending_auth = None;
            }
            ConnectionState::Ready => {
                self.core.close_link(self.out);
                self.core.remote = None;
                if record.from == ConnectionState::Initializing {
                    if let Some(local_id) = self.core.local_id.clone() {
                        self.out.event(AppEvent::IdReady { local_id });
                    }
                }
            }
            ConnectionState::Authenticating => {
                self.core.timers.cancel_all();
                let at = self.now + self.core.config.auth_timeout;
                self.core.timers.arm(ConnectionTimer::Auth, at);
                let message = self.core.credentials.message(self.now);
                self.out.send_frame(Frame::Auth(message));
                self.out.event(AppEvent::AuthStarted {
                    peer_id: self.core.remote.clone(),
                    is_host: self.core.is_host,
                });
            }
            ConnectionState::Connected => {
                self.core.timers.cancel_all();
                self.core.last_pong = self.now;
                let at = self.now + self.core.config.ping_interval;
                self.core.timers.arm(ConnectionTimer::Keepalive, at);
                if let Some(peer_id) = self.core.remote.clone() {
                    info!(peer = %peer_id, is_host = self.core.is_host, "authenticated link established");
                    self.out.event(AppEvent::Connected {
                        peer_id,
                        is_host: self.core.is_host,
                    });
                }
            }
            ConnectionState::Initializing | ConnectionState::Connecting => {}
        }
    }

    fn on_emit(&mut self, emit: ConnectionEmit, record: &TransitionRecord<ConnectionMachine>) {
        let Some(peer) = self.core.active_breaker.clone() else {
            return;
        };
        let Some(breaker) = self.core.breakers.get_mut(&peer) else {
            return;
        };
        match emit {
            ConnectionEmit::BreakerSuccess => breaker.on_success(self.now),
            ConnectionEmit::BreakerFailure => {
                breaker.on_failure(record.event.label(), self.now);
                let status = breaker.status(self.now);
                self.out.event(AppEvent::ConnectFailed {
                    peer_id: peer,
                    reason: record.event.label(),
                    status,
                });
            }
        }
    }
}

/// One local transport endpoint
#[derive(Debug)]
pub struct Connection {
    engine: StateEngine<ConnectionMachine>,
    core: ConnectionCore,
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        breaker_config: CircuitBreakerConfig,
        credentials: Credentials,
    ) -> Self {
        Self {
            engine: StateEngine::new(),
            core: ConnectionCore {
                config,
                credentials,
                identity: None,
                local_id: None,
                remote: None,
                is_host: false,
                link_active: false,
                breakers: BreakerRegistry::new(breaker_config),
                active_breaker: None,
                last_rejection: None,
                timers: Timers::new(),
                last_pong: Timestamp::default(),
                pending_auth: None,
                transitions: Vec::new(),
            },
        }
    }

    fn send(&mut self, event: ConnectionEvent, now: Timestamp, out: &mut Outbox) -> bool {
        let mut hooks = ConnectionHooks {
            core: &mut self.core,
            out,
            now,
        };
        self.engine.send(event, &mut hooks)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    pub fn is(&self, state: ConnectionState) -> bool {
        self.engine.is(state)
    }

    pub fn is_host(&self) -> bool {
        self.core.is_host
    }

    pub fn remote(&self) -> Option<&PeerId> {
        self.core.remote.as_ref()
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.core.local_id.as_ref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.core.identity.as_ref()
    }

    pub fn namespace(&self) -> &str {
        &self.core.config.namespace
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.core.breakers
    }

    pub fn breakers_mut(&mut self) -> &mut BreakerRegistry {
        &mut self.core.breakers
    }

    /// `{state, nextAttemptTime}` of a peer's breaker, if one exists
    pub fn breaker_info(&self, peer_id: &PeerId) -> Option<BreakerInfo> {
        self.core.breakers.info(peer_id)
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.core.timers.next_deadline()
    }

    /// Committed transitions since the last call, in order
    pub fn take_transitions(&mut self) -> Vec<TransitionRecord<ConnectionMachine>> {
        std::mem::take(&mut self.core.transitions)
    }

    /// A data link is dialing, open, or accepted
    pub fn has_link(&self) -> bool {
        self.core.link_active
    }

    /// Whether frames may be sent on the link right now
    pub fn can_send(&self) -> bool {
        self.core.link_active
            && matches!(
                self.state(),
                ConnectionState::Authenticating | ConnectionState::Connected
            )
    }

    // ------------------------------------------------------------------------
    // User Intent
    // ------------------------------------------------------------------------

    /// Register the local endpoint as `<namespace>-<identity>`
    pub fn init(&mut self, identity: &str, now: Timestamp, out: &mut Outbox) -> Result<PeerId, PolicyError> {
        if !self.is(ConnectionState::Idle) {
            return Err(PolicyError::InvalidState {
                operation: "init",
                state: self.state().label().to_string(),
            });
        }
        let identity = Identity::parse(identity)?;
        let local_id = PeerId::namespaced(&self.core.config.namespace, identity.as_str());
        self.core.identity = Some(identity);
        self.core.local_id = Some(local_id.clone());

        self.send(ConnectionEvent::Init, now, out);
        out.command(TransportCommand::Open {
            local_id: local_id.clone(),
        });
        Ok(local_id)
    }

    /// Dial a remote peer, subject to its circuit breaker
    pub fn connect_to(&mut self, peer_id: &PeerId, now: Timestamp, out: &mut Outbox) -> Result<(), PolicyError> {
        if peer_id.trim().is_empty() {
            return Err(PolicyError::EmptyPeerId);
        }
        if !self.is(ConnectionState::Ready) {
            return Err(PolicyError::InvalidState {
                operation: "connect",
                state: self.state().label().to_string(),
            });
        }

        self.core.breakers.get_or_create(peer_id, now);
        self.core.active_breaker = Some(peer_id.clone());
        self.core.last_rejection = None;
        debug!(peer = %peer_id, "dialing");

        if !self.send(ConnectionEvent::ConnectTo, now, out) {
            let retry_in_ms = self.core.last_rejection.take().unwrap_or(0);
            warn!(peer = %peer_id, retry_in_ms, "dial rejected by circuit breaker");
            return Err(PolicyError::CircuitOpen {
                peer_id: peer_id.to_string(),
                retry_in_ms,
            });
        }

        self.core.remote = Some(peer_id.clone());
        self.core.is_host = true;
        self.core.link_active = true;
        out.command(TransportCommand::Dial {
            peer_id: peer_id.clone(),
        });
        let at = now + self.core.config.connect_timeout;
        self.core.timers.arm(ConnectionTimer::Connect, at);
        Ok(())
    }

    /// Tear everything down; a no-op when already idle
    pub fn disconnect(&mut self, now: Timestamp, out: &mut Outbox) -> bool {
        if self.is(ConnectionState::Idle) {
            return false;
        }
        self.send(ConnectionEvent::Disconnect, now, out)
    }

    /// Queue a frame on the link
    pub fn send_frame(&mut self, frame: Frame, out: &mut Outbox) -> Result<(), PolicyError> {
        if !self.can_send() {
            return Err(PolicyError::NotConnected);
        }
        out.send_frame(frame);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transport Events
    // ------------------------------------------------------------------------

    /// Fold a transport event into the machine
    pub fn handle_event(&mut self, event: TransportEvent, now: Timestamp, out: &mut Outbox) -> Inbound {
        match event {
            TransportEvent::PeerOpened => {
                self.send(ConnectionEvent::PeerOpen, now, out);
            }
            TransportEvent::IdUnavailable => {
                out.event(AppEvent::Error {
                    message: "identity already in use".to_string(),
                });
                self.send(ConnectionEvent::IdUnavailable, now, out);
            }
            TransportEvent::PeerCreationError { reason } => {
                out.event(AppEvent::Error { message: reason });
                self.send(ConnectionEvent::PeerCreationError, now, out);
            }
            TransportEvent::SignalingError { reason } => {
                out.event(AppEvent::Error { message: reason });
                self.send(ConnectionEvent::SignalingError, now, out);
            }
            TransportEvent::SignalingLost => {
                self.send(ConnectionEvent::SignalingLost, now, out);
            }
            TransportEvent::PeerUnavailable { peer_id } => {
                debug!(peer = %peer_id, "dial target unavailable");
                self.send(ConnectionEvent::PeerUnavailable, now, out);
            }
            TransportEvent::InboundConnection { peer_id } => {
                self.accept_inbound(peer_id, out);
            }
            TransportEvent::LinkOpened => {
                self.core.timers.cancel(ConnectionTimer::Connect);
                self.send(ConnectionEvent::ConnectionOpen, now, out);
                self.verify_pending_auth(now, out);
            }
            TransportEvent::LinkClosed => {
                self.core.link_active = false;
                let event = if self.is(ConnectionState::Connecting) {
                    ConnectionEvent::ConnectionError
                } else {
                    ConnectionEvent::Close
                };
                self.send(event, now, out);
            }
            TransportEvent::LinkError { reason } => {
                warn!(%reason, "link error");
                out.event(AppEvent::Error { message: reason });
                self.send(ConnectionEvent::ConnectionError, now, out);
            }
            TransportEvent::Data(frame) => return self.handle_frame(frame, now, out),
        }
        Inbound::Consumed
    }

    fn accept_inbound(&mut self, peer_id: PeerId, out: &mut Outbox) {
        if self.core.link_active || !self.is(ConnectionState::Ready) {
            debug!(peer = %peer_id, "refusing inbound link");
            out.command(TransportCommand::RefuseInbound { peer_id });
            return;
        }
        debug!(peer = %peer_id, "accepting inbound link");
        self.core.remote = Some(peer_id);
        self.core.is_host = false;
        self.core.link_active = true;
    }

    fn verify_pending_auth(&mut self, now: Timestamp, out: &mut Outbox) {
        if !self.is(ConnectionState::Authenticating) {
            return;
        }
        if let Some(message) = self.core.pending_auth.take() {
            self.verify_auth(&message, now, out);
        }
    }

    fn verify_auth(&mut self, message: &AuthMessage, now: Timestamp, out: &mut Outbox) {
        if self.core.credentials.verify(message) {
            debug!(name = %message.name, "peer authenticated");
            self.send(ConnectionEvent::AuthSuccess, now, out);
        } else {
            self.send(ConnectionEvent::AuthFailed, now, out);
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Timestamp, out: &mut Outbox) -> Inbound {
        if !self.core.link_active {
            return Inbound::Consumed;
        }
        match frame {
            Frame::Auth(message) => match self.state() {
                ConnectionState::Authenticating => {
                    self.verify_auth(&message, now, out);
                    Inbound::Presence
                }
                ConnectionState::Ready | ConnectionState::Connecting => {
                    self.core.pending_auth = Some(message);
                    Inbound::Consumed
                }
                _ => Inbound::Presence,
            },
            Frame::Ping { timestamp } => {
                if self.can_send() {
                    out.send_frame(Frame::Pong { timestamp });
                }
                Inbound::Consumed
            }
            Frame::Pong { timestamp } => {
                self.core.last_pong = now;
                let millis = now.as_millis().saturating_sub(timestamp);
                out.event(AppEvent::Latency { millis });
                Inbound::Presence
            }
            other if self.is(ConnectionState::Connected) => Inbound::Deliver(other),
            other => {
                debug!(frame = other.type_name(), "dropping frame before authentication");
                Inbound::Consumed
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Fire every due timer; returns whether any fired
    pub fn poll_timers(&mut self, now: Timestamp, out: &mut Outbox) -> bool {
        let mut fired = false;
        while let Some(timer) = self.core.timers.pop_due(now) {
            fired = true;
            self.fire(timer, now, out);
        }
        fired
    }

    fn fire(&mut self, timer: ConnectionTimer, now: Timestamp, out: &mut Outbox) {
        match timer {
            ConnectionTimer::Connect => {
                if self.is(ConnectionState::Connecting) {
                    debug!(peer = ?self.core.remote, "dial timed out");
                    self.core.close_link(out);
                    self.send(ConnectionEvent::Timeout, now, out);
                }
            }
            ConnectionTimer::Auth => {
                if self.is(ConnectionState::Authenticating) {
                    self.send(ConnectionEvent::AuthTimeout, now, out);
                }
            }
            ConnectionTimer::Keepalive => {
                if !self.is(ConnectionState::Connected) {
                    return;
                }
                let silence = now - self.core.last_pong;
                if silence > duration_millis(self.core.config.pong_timeout) {
                    warn!(silence_ms = silence, "keepalive timeout");
                    self.send(ConnectionEvent::PingTimeout, now, out);
                } else {
                    out.send_frame(Frame::Ping {
                        timestamp: now.as_millis(),
                    });
                    let at = now + self.core.config.ping_interval;
                    self.core.timers.arm(ConnectionTimer::Keepalive, at);
                }
            }
            ConnectionTimer::SignalingRetry => {
                if self.is(ConnectionState::Connected) {
                    out.command(TransportCommand::ReconnectSignaling);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Effect;
    use crate::circuit_breaker::BreakerState;

    fn connection() -> Connection {
        Connection::new(
            ConnectionConfig::default(),
            CircuitBreakerConfig::default(),
            Credentials::new("secret", "alice"),
        )
    }

    fn ready(conn: &mut Connection, out: &mut Outbox) {
        conn.init("alice", Timestamp::new(0), out).unwrap();
        conn.handle_event(TransportEvent::PeerOpened, Timestamp::new(1), out);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    fn bob() -> PeerId {
        PeerId::namespaced("pacpam", "bob")
    }

    fn sent_frames(out: &Outbox) -> Vec<&Frame> {
        out.iter()
            .filter_map(|effect| match effect {
                Effect::Transport(TransportCommand::Send { frame }) => Some(frame),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_definition_is_valid() {
        let definition = ConnectionMachine::definition();
        assert!(definition.validate().is_ok());
        assert_eq!(definition.transitions().len(), 30);
        assert_eq!(definition.by_id("c27").map(|t| t.is_self_loop()), Some(true));
    }

    #[test]
    fn test_unknown_events_are_ignored() {
        let mut conn = connection();
        let mut out = Outbox::new();
        for event in [
            ConnectionEvent::PeerOpen,
            ConnectionEvent::ConnectTo,
            ConnectionEvent::AuthSuccess,
            ConnectionEvent::Close,
            ConnectionEvent::Disconnect,
        ] {
            assert!(!conn.send(event, Timestamp::new(0), &mut out));
            assert_eq!(conn.state(), ConnectionState::Idle);
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalid_identity_does_not_touch_machine() {
        let mut conn = connection();
        let mut out = Outbox::new();
        assert!(matches!(
            conn.init("x", Timestamp::new(0), &mut out),
            Err(PolicyError::InvalidIdentity { .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(out.is_empty());
    }

    #[test]
    fn test_init_opens_namespaced_endpoint() {
        let mut conn = connection();
        let mut out = Outbox::new();
        let id = conn.init("alice", Timestamp::new(0), &mut out).unwrap();
        assert_eq!(id.as_str(), "pacpam-alice");
        assert!(out
            .iter()
            .any(|e| *e == Effect::Transport(TransportCommand::Open { local_id: id.clone() })));
        assert_eq!(conn.state(), ConnectionState::Initializing);
    }

    #[test]
    fn test_connect_rejections() {
        let mut conn = connection();
        let mut out = Outbox::new();
        assert!(matches!(
            conn.connect_to(&bob(), Timestamp::new(0), &mut out),
            Err(PolicyError::InvalidState { .. })
        ));
        ready(&mut conn, &mut out);
        assert_eq!(
            conn.connect_to(&PeerId::new("  "), Timestamp::new(2), &mut out),
            Err(PolicyError::EmptyPeerId)
        );
    }

    #[test]
    fn test_dial_timeout_counts_against_breaker() {
        let mut conn = connection();
        let mut out = Outbox::new();
        ready(&mut conn, &mut out);

        conn.connect_to(&bob(), Timestamp::new(10), &mut out).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.next_deadline(), Some(Timestamp::new(10_010)));

        assert!(!conn.poll_timers(Timestamp::new(10_009), &mut out));
        assert!(conn.poll_timers(Timestamp::new(10_010), &mut out));
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.breakers().get(&bob()).map(|b| b.failures()), Some(1));
    }

    #[test]
    fn test_breaker_opens_and_blocks_dial() {
        let mut conn = connection();
        let mut out = Outbox::new();
        ready(&mut conn, &mut out);

        for attempt in 0..3u64 {
            let now = Timestamp::new(100 + attempt);
            conn.connect_to(&bob(), now, &mut out).unwrap();
            conn.handle_event(TransportEvent::PeerUnavailable { peer_id: bob() }, now, &mut out);
        }
        assert_eq!(
            conn.breaker_info(&bob()).map(|info| info.state),
            Some(BreakerState::Open)
        );

        let err = conn.connect_to(&bob(), Timestamp::new(5_102), &mut out).unwrap_err();
        assert_eq!(
            err,
            PolicyError::CircuitOpen {
                peer_id: bob().to_string(),
                retry_in_ms: 25_000,
            }
        );
        assert_eq!(conn.state(), ConnectionState::Ready);

        // after the reset timeout the guard itself advances the breaker
        conn.connect_to(&bob(), Timestamp::new(30_102), &mut out).unwrap();
        assert_eq!(
            conn.breaker_info(&bob()).map(|info| info.state),
            Some(BreakerState::HalfOpen)
        );
    }

    #[test]
    fn test_host_handshake_reaches_connected() {
        let mut conn = connection();
        let mut out = Outbox::new();
        ready(&mut conn, &mut out);
        conn.connect_to(&bob(), Timestamp::new(10), &mut out).unwrap();
        out.take();

        conn.handle_event(TransportEvent::LinkOpened, Timestamp::new(20), &mut out);
        assert_eq!(conn.state(), ConnectionState::Authenticating);
        assert!(matches!(sent_frames(&out).as_slice(), [Frame::Auth(_)]));
        assert_eq!(conn.next_deadline(), Some(Timestamp::new(5_020)));

        let reply = Credentials::new("secret", "bob").message(Timestamp::new(21));
        let inbound = conn.handle_event(TransportEvent::Data(Frame::Auth(reply)), Timestamp::new(22), &mut out);
        assert_eq!(inbound, Inbound::Presence);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.is_host());
        // auth timer cancelled, keepalive armed
        assert_eq!(conn.next_deadline(), Some(Timestamp::new(3_022)));
        assert_eq!(conn.breakers().get(&bob()).map(|b| b.state()), Some(BreakerState::Closed));
    }

    #[test]
    fn test_auth_mismatch_returns_to_ready_without_penalty() {
        let mut conn = connection();
        let mut out = Outbox::new();
        ready(&mut conn, &mut out);
        conn.connect_to(&bob(), Timestamp::new(10), &mut out).unwrap();
        conn.handle_event(TransportEvent::LinkOpened, Timestamp::new(20), &mut out);
        out.take();

        let wrong = Credentials::new("nope", "bob").message(Timestamp::new(21));
        conn.handle_event(TransportEvent::Data(Frame::Auth(wrong)), Timestamp::new(22), &mut out);
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(out.iter().any(|e| matches!(
            e,
            Effect::App(AppEvent::AuthFailed { reason: AuthFailure::Mismatch, .. })
        )));
        assert!(out
            .iter()
            .any(|e| *e == Effect::Transport(TransportCommand::CloseLink)));
        let breaker = conn.breakers().get(&bob()).unwrap();
        assert_eq!(breaker.failures(), 0);
        assert_eq!(breaker.metrics(Timestamp::new(22)).total_failures, 0);
    }

    #[test]
    fn test_auth_timeout_fires_once() {
        let mut conn = connection();
        let mut out = Outbox::new();
        ready(&mut conn, &mut out);
        conn.handle_event(TransportEvent::InboundConnection { peer_id: bob() }, Timestamp::new(5), &mut out);
        conn.handle_event(TransportEvent::LinkOpened, Timestamp::new(6), &mut out);
        assert_eq!(conn.state(), ConnectionState::Authenticating);
        assert!(!conn.is_host());

        assert!(conn.poll_timers(Timestamp::new(5_006), &mut out));
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(!conn.poll_timers(Timestamp::new(20_000), &mut out));
    }

    #[test]
    fn test_early_auth_is_verified_on_entry() {
        let mut conn = connection();
        let mut out = Outbox::new();
        ready(&mut conn, &mut out);
        conn.handle_event(TransportEvent::InboundConnection { peer_id: bob() }, Timestamp::new(5), &mut out);
        let early = Credentials::new("secret", "bob").message(Timestamp::new(5));
        assert_eq!(
            conn.handle_event(TransportEvent::Data(Frame::Auth(early)), Timestamp::new(6), &mut out),
            Inbound::Consumed
        );
        conn.handle_event(TransportEvent::LinkOpened, Timestamp::new(7), &mut out);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_second_inbound_is_refused() {
        let mut conn = connection();
        let mut out = Outbox::new();
        ready(&mut conn, &mut out);
        conn.handle_event(TransportEvent::InboundConnection { peer_id: bob() }, Timestamp::new(5), &mut out);
        let eve = PeerId::namespaced("pacpam", "eve");
        conn.handle_event(TransportEvent::InboundConnection { peer_id: eve.clone() }, Timestamp::new(6), &mut out);
        assert!(out
            .iter()
            .any(|e| *e == Effect::Transport(TransportCommand::RefuseInbound { peer_id: eve.clone() })));
        assert_eq!(conn.remote(), Some(&bob()));
    }

    fn connected(conn: &mut Connection, out: &mut Outbox) {
        ready(conn, out);
        conn.connect_to(&bob(), Timestamp::new(10), out).unwrap();
        conn.handle_event(TransportEvent::LinkOpened, Timestamp::new(20), out);
        let reply = Credentials::new("secret", "bob").message(Timestamp::new(21));
        conn.handle_event(TransportEvent::Data(Frame::Auth(reply)), Timestamp::new(22), out);
        assert_eq!(conn.state(), ConnectionState::Connected);
        out.take();
    }

    #[test]
    fn test_keepalive_ping_and_timeout() {
        let mut conn = connection();
        let mut out = Outbox::new();
        connected(&mut conn, &mut out);

        conn.poll_timers(Timestamp::new(3_022), &mut out);
        assert_eq!(sent_frames(&out), vec![&Frame::Ping { timestamp: 3_022 }]);
        out.take();

        let inbound = conn.handle_event(
            TransportEvent::Data(Frame::Pong { timestamp: 3_022 }),
            Timestamp::new(3_072),
            &mut out,
        );
        assert_eq!(inbound, Inbound::Presence);
        assert!(out
            .iter()
            .any(|e| *e == Effect::App(AppEvent::Latency { millis: 50 })));

        // no pong for more than ten seconds
        let mut now = Timestamp::new(3_072);
        while conn.is(ConnectionState::Connected) {
            now = now + 3_000;
            conn.poll_timers(now, &mut out);
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(out.iter().any(|e| matches!(
            e,
            Effect::App(AppEvent::Disconnected { cause: DisconnectCause::Network, .. })
        )));
    }

    #[test]
    fn test_ping_is_answered_with_pong() {
        let mut conn = connection();
        let mut out = Outbox::new();
        connected(&mut conn, &mut out);
        let inbound = conn.handle_event(
            TransportEvent::Data(Frame::Ping { timestamp: 77 }),
            Timestamp::new(100),
            &mut out,
        );
        assert_eq!(inbound, Inbound::Consumed);
        assert_eq!(sent_frames(&out), vec![&Frame::Pong { timestamp: 77 }]);
    }

    #[test]
    fn test_remote_close_reports_peer_left() {
        let mut conn = connection();
        let mut out = Outbox::new();
        connected(&mut conn, &mut out);
        conn.handle_event(TransportEvent::LinkClosed, Timestamp::new(50), &mut out);
        assert_eq!(conn.state(), ConnectionState::Ready);
        let transitions = conn.take_transitions();
        assert_eq!(transitions.last().map(|t| t.id), Some("c25"));
        assert!(out.iter().any(|e| matches!(
            e,
            Effect::App(AppEvent::Disconnected { cause: DisconnectCause::PeerLeft, .. })
        )));
    }

    #[test]
    fn test_signaling_lost_while_connected_is_self_loop() {
        let mut conn = connection();
        let mut out = Outbox::new();
        connected(&mut conn, &mut out);
        conn.take_transitions();

        conn.handle_event(TransportEvent::SignalingLost, Timestamp::new(100), &mut out);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.take_transitions().is_empty());

        conn.poll_timers(Timestamp::new(3_100), &mut out);
        assert!(out
            .iter()
            .any(|e| *e == Effect::Transport(TransportCommand::ReconnectSignaling)));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut conn = connection();
        let mut out = Outbox::new();
        connected(&mut conn, &mut out);
        assert!(conn.disconnect(Timestamp::new(100), &mut out));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(out
            .iter()
            .any(|e| *e == Effect::Transport(TransportCommand::Destroy)));
        assert!(conn.next_deadline().is_none());
        assert!(conn.remote().is_none());
        out.take();
        assert!(!conn.disconnect(Timestamp::new(101), &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn test_sends_require_link() {
        let mut conn = connection();
        let mut out = Outbox::new();
        assert_eq!(
            conn.send_frame(Frame::Ping { timestamp: 0 }, &mut out),
            Err(PolicyError::NotConnected)
        );
        connected(&mut conn, &mut out);
        assert!(conn.send_frame(Frame::Ping { timestamp: 0 }, &mut out).is_ok());
    }
}
