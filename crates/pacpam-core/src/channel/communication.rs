//! Channel Communication Protocol Types
//!
//! The core is pure: components never perform I/O. Everything they want done
//! outside is pushed into an [`Outbox`] as an [`Effect`], in causal order.
//! - `TransportEvent`: transport adapter → core
//! - `TransportCommand`: core → transport adapter
//! - `AppEvent`: core → application observers

use crate::circuit_breaker::BreakerStatus;
use crate::connection::{AuthFailure, ConnectionState, DisconnectCause};
use crate::errors::{ReconnectRejection, SessionError};
use crate::presence::PresenceState;
use crate::protocol::Frame;
use crate::session::{HandlerMethod, SessionState};
use crate::sync_layer::SyncState;
use crate::types::{PeerId, SessionId};

// ----------------------------------------------------------------------------
// Event: Transport → Core
// ----------------------------------------------------------------------------

/// Events reported by the transport adapter
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Local endpoint registered with signaling
    PeerOpened,
    /// Requested local id is already taken
    IdUnavailable,
    PeerCreationError { reason: String },
    SignalingError { reason: String },
    /// Signaling channel dropped (the data link may survive)
    SignalingLost,
    /// Dial target does not exist
    PeerUnavailable { peer_id: PeerId },
    /// A remote peer dialed us
    InboundConnection { peer_id: PeerId },
    /// The data link is open
    LinkOpened,
    LinkClosed,
    LinkError { reason: String },
    /// A validated inbound frame
    Data(Frame),
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::PeerOpened => "peer_opened",
            TransportEvent::IdUnavailable => "id_unavailable",
            TransportEvent::PeerCreationError { .. } => "peer_creation_error",
            TransportEvent::SignalingError { .. } => "signaling_error",
            TransportEvent::SignalingLost => "signaling_lost",
            TransportEvent::PeerUnavailable { .. } => "peer_unavailable",
            TransportEvent::InboundConnection { .. } => "inbound_connection",
            TransportEvent::LinkOpened => "link_opened",
            TransportEvent::LinkClosed => "link_closed",
            TransportEvent::LinkError { .. } => "link_error",
            TransportEvent::Data(_) => "data",
        }
    }
}

// ----------------------------------------------------------------------------
// Command: Core → Transport
// ----------------------------------------------------------------------------

/// Side effects the transport adapter must carry out
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// Register the local endpoint with signaling
    Open { local_id: PeerId },
    /// Dial a remote peer
    Dial { peer_id: PeerId },
    /// Send a frame over the active link
    Send { frame: Frame },
    /// Close the active data link
    CloseLink,
    /// Reject an inbound link
    RefuseInbound { peer_id: PeerId },
    /// Best-effort reconnection of the signaling channel
    ReconnectSignaling,
    /// Tear down the local endpoint
    Destroy,
}

// ----------------------------------------------------------------------------
// AppEvent: Core → Application
// ----------------------------------------------------------------------------

/// Observable notifications for the application
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// Connection (L2) transition
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
        event: &'static str,
        transition_id: &'static str,
    },
    /// Local endpoint registered under this id
    IdReady { local_id: PeerId },
    /// Handshake started with the remote peer
    AuthStarted { peer_id: Option<PeerId>, is_host: bool },
    AuthFailed {
        peer_id: Option<PeerId>,
        reason: AuthFailure,
    },
    Connected { peer_id: PeerId, is_host: bool },
    Disconnected {
        peer_id: Option<PeerId>,
        cause: DisconnectCause,
    },
    /// Dial attempt failed; carries the breaker summary afterwards
    ConnectFailed {
        peer_id: PeerId,
        reason: &'static str,
        status: BreakerStatus,
    },
    /// Round-trip keepalive latency
    Latency { millis: u64 },
    /// Sync layer (L3) transition
    SyncStateChanged {
        from: SyncState,
        to: SyncState,
        event: &'static str,
        transition_id: &'static str,
    },
    PresenceChanged {
        from: PresenceState,
        to: PresenceState,
        transition_id: &'static str,
    },
    PeerAbsent,
    PeerBack,
    ReconnectResult {
        peer_id: Option<PeerId>,
        outcome: Result<(), ReconnectRejection>,
    },
    SessionStateChanged { id: SessionId, state: SessionState },
    /// A session handler failed or panicked
    HandlerError {
        session: SessionId,
        method: HandlerMethod,
        message: String,
    },
    /// A controller command was refused
    SessionCommandRejected { error: SessionError },
    /// Transport-level error surfaced for display
    Error { message: String },
}

// ----------------------------------------------------------------------------
// Effect
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Transport(TransportCommand),
    App(AppEvent),
}

/// Ordered effect sink shared by all components of one endpoint
#[derive(Debug, Default)]
pub struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(&mut self, command: TransportCommand) {
        self.effects.push(Effect::Transport(command));
    }

    pub fn event(&mut self, event: AppEvent) {
        self.effects.push(Effect::App(event));
    }

    /// Queue a frame for the active link
    pub fn send_frame(&mut self, frame: Frame) {
        self.command(TransportCommand::Send { frame });
    }

    pub fn take(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Effect> {
        self.effects.iter()
    }
}
