//! Sync layer (L3)
//!
//! A coarse IDLE/CONNECTING/CONNECTED/DISCONNECTED projection of the
//! connection machine, computed purely from its committed transitions. The
//! layer owns the presence guard for the duration of each CONNECTED period and
//! the reconnection policy, which remembers the last authenticated peer.

use std::convert::Infallible;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channel::{AppEvent, Outbox};
use crate::config::PresenceConfig;
use crate::connection::{Connection, ConnectionMachine, ConnectionState};
use crate::engine::{impl_label, Definition, Hooks, Label, Machine, StateEngine, TransitionDef, TransitionRecord};
use crate::errors::ReconnectRejection;
use crate::presence::{PresenceChange, PresenceGuard, PresenceState};
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Machine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl_label!(SyncState {
    Idle => "IDLE",
    Connecting => "CONNECTING",
    Connected => "CONNECTED",
    Disconnected => "DISCONNECTED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEvent {
    Connect,
    TransportConnected,
    TransportFailed,
    TransportLost,
    Reconnect,
    RedialFailed,
    Reset,
}

impl_label!(SyncEvent {
    Connect => "CONNECT",
    TransportConnected => "TRANSPORT_CONNECTED",
    TransportFailed => "TRANSPORT_FAILED",
    TransportLost => "TRANSPORT_LOST",
    Reconnect => "RECONNECT",
    RedialFailed => "REDIAL_FAILED",
    Reset => "RESET",
});

#[derive(Debug)]
pub struct SyncMachine;

impl Machine for SyncMachine {
    type State = SyncState;
    type Event = SyncEvent;
    type Guard = Infallible;
    type Emit = Infallible;
    type Action = Infallible;

    const NAME: &'static str = "sync";

    fn definition() -> &'static Definition<Self> {
        use SyncEvent::*;
        use SyncState::*;

        static DEFINITION: OnceLock<Definition<SyncMachine>> = OnceLock::new();
        DEFINITION.get_or_init(|| {
            Definition::new(Idle, &[Idle, Connecting, Connected, Disconnected])
                .with(TransitionDef::new("p1", Idle, Connect, Connecting))
                .with(TransitionDef::new("p2", Connecting, TransportConnected, Connected))
                .with(TransitionDef::new("p3", Connecting, TransportFailed, Idle))
                .with(TransitionDef::new("p4", Connected, TransportLost, Disconnected))
                .with(TransitionDef::new("p5", Disconnected, Reconnect, Connecting))
                .with(TransitionDef::new("p6", Disconnected, Reset, Idle))
                .with(TransitionDef::new("p7", Connecting, RedialFailed, Disconnected))
        })
    }
}

// ----------------------------------------------------------------------------
// Signals
// ----------------------------------------------------------------------------

/// Notifications the session registry reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    Connected,
    Disconnected,
    PeerAbsent,
    PeerBack,
}

impl From<PresenceChange> for SyncSignal {
    fn from(change: PresenceChange) -> Self {
        match change {
            PresenceChange::Absent => SyncSignal::PeerAbsent,
            PresenceChange::Back => SyncSignal::PeerBack,
        }
    }
}

/// Read-only view of the transport consulted by the reconnection check
pub trait TransportView {
    /// Whether a fresh dial would be accepted
    fn accepts_dial(&self) -> bool;

    /// Remaining wait imposed by `peer`'s breaker, if it is OPEN and unexpired
    fn breaker_wait(&self, peer: &PeerId, now: Timestamp) -> Option<u64>;
}

impl TransportView for Connection {
    fn accepts_dial(&self) -> bool {
        self.is(ConnectionState::Ready)
    }

    fn breaker_wait(&self, peer: &PeerId, now: Timestamp) -> Option<u64> {
        let breaker = self.breakers().get(peer)?;
        if breaker.is_available(now) {
            None
        } else {
            Some(breaker.retry_in(now))
        }
    }
}

// ----------------------------------------------------------------------------
// Sync Layer
// ----------------------------------------------------------------------------

struct SyncHooks<'a> {
    presence: &'a mut Option<PresenceGuard>,
    presence_config: &'a PresenceConfig,
    signals: &'a mut Vec<SyncSignal>,
    out: &'a mut Outbox,
    now: Timestamp,
}

impl Hooks<SyncMachine> for SyncHooks<'_> {
    fn on_exit(&mut self, state: SyncState, _record: &TransitionRecord<SyncMachine>) {
        if state == SyncState::Connected {
            *self.presence = None;
            self.signals.push(SyncSignal::Disconnected);
        }
    }

    fn on_transition(&mut self, record: &TransitionRecord<SyncMachine>) {
        self.out.event(AppEvent::SyncStateChanged {
            from: record.from,
            to: record.to,
            event: record.event.label(),
            transition_id: record.id,
        });
    }

    fn on_entry(&mut self, state: SyncState, _record: &TransitionRecord<SyncMachine>) {
        if state == SyncState::Connected {
            *self.presence = Some(PresenceGuard::start(self.presence_config.clone(), self.now));
            self.signals.push(SyncSignal::Connected);
        }
    }
}

/// Session-layer projection of one connection
#[derive(Debug)]
pub struct SyncLayer {
    engine: StateEngine<SyncMachine>,
    presence_config: PresenceConfig,
    presence: Option<PresenceGuard>,
    last_peer: Option<PeerId>,
    /// CONNECTING was entered through `reconnect`
    redialing: bool,
    signals: Vec<SyncSignal>,
}

impl SyncLayer {
    pub fn new(presence_config: PresenceConfig) -> Self {
        Self {
            engine: StateEngine::new(),
            presence_config,
            presence: None,
            last_peer: None,
            redialing: false,
            signals: Vec::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.engine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is(SyncState::Connected)
    }

    /// Presence guard state; `None` outside CONNECTED
    pub fn presence(&self) -> Option<PresenceState> {
        self.presence.as_ref().map(PresenceGuard::state)
    }

    /// Last authenticated peer, kept across disconnects
    pub fn last_peer(&self) -> Option<&PeerId> {
        self.last_peer.as_ref()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.presence.as_ref().and_then(PresenceGuard::next_deadline)
    }

    /// Pending signals for the session registry, in order
    pub fn take_signals(&mut self) -> Vec<SyncSignal> {
        std::mem::take(&mut self.signals)
    }

    fn send(&mut self, event: SyncEvent, now: Timestamp, out: &mut Outbox) -> bool {
        let mut hooks = SyncHooks {
            presence: &mut self.presence,
            presence_config: &self.presence_config,
            signals: &mut self.signals,
            out,
            now,
        };
        let committed = self.engine.send(event, &mut hooks);
        self.redialing &= self.state() == SyncState::Connecting;
        committed
    }

    /// Project one committed connection transition
    pub fn observe(
        &mut self,
        record: &TransitionRecord<ConnectionMachine>,
        remote: Option<&PeerId>,
        now: Timestamp,
        out: &mut Outbox,
    ) {
        use ConnectionState as L2;

        let to = record.to;
        let from = record.from;

        if to == L2::Connected {
            if let Some(peer) = remote {
                self.last_peer = Some(peer.clone());
            }
            match self.state() {
                SyncState::Connecting => {
                    self.send(SyncEvent::TransportConnected, now, out);
                }
                // the remote side redialed us, or the application dialed
                // without going through reconnect()
                SyncState::Disconnected => {
                    self.send(SyncEvent::Reconnect, now, out);
                    self.send(SyncEvent::TransportConnected, now, out);
                }
                _ => {}
            }
            return;
        }

        if from == L2::Connected && self.is_connected() {
            self.send(SyncEvent::TransportLost, now, out);
            if to == L2::Idle {
                self.send(SyncEvent::Reset, now, out);
            }
            return;
        }

        // a redial that timed out or was refused falls back to READY
        if to == L2::Ready && self.redialing {
            self.abandon_redial(now, out);
            return;
        }

        if from == L2::Idle && self.state() == SyncState::Idle {
            self.send(SyncEvent::Connect, now, out);
            return;
        }

        if to == L2::Idle {
            match self.state() {
                SyncState::Connecting => {
                    self.send(SyncEvent::TransportFailed, now, out);
                }
                SyncState::Disconnected => {
                    self.send(SyncEvent::Reset, now, out);
                }
                _ => {}
            }
        }
    }

    /// Inbound evidence of the peer (application data or pong)
    pub fn feed_presence(&mut self, now: Timestamp, out: &mut Outbox) {
        let Some(guard) = self.presence.as_mut() else {
            return;
        };
        if let Some(change) = guard.feed(now, out) {
            self.signals.push(change.into());
        }
    }

    pub fn poll_timers(&mut self, now: Timestamp, out: &mut Outbox) {
        let Some(guard) = self.presence.as_mut() else {
            return;
        };
        if let Some(change) = guard.poll(now, out) {
            self.signals.push(change.into());
        }
    }

    /// Check whether a reconnect may be attempted and, if so, move to CONNECTING
    ///
    /// Returns the remembered peer the caller must dial.
    pub fn reconnect<T: TransportView + ?Sized>(
        &mut self,
        transport: &T,
        now: Timestamp,
        out: &mut Outbox,
    ) -> Result<PeerId, ReconnectRejection> {
        let peer = self.last_peer.clone().ok_or(ReconnectRejection::NoPeer)?;
        if self.state() != SyncState::Disconnected {
            return Err(ReconnectRejection::NotDisconnected);
        }
        if !transport.accepts_dial() {
            return Err(ReconnectRejection::TransportNotReady);
        }
        if let Some(retry_in_ms) = transport.breaker_wait(&peer, now) {
            debug!(peer = %peer, retry_in_ms, "reconnect blocked by circuit breaker");
            return Err(ReconnectRejection::CircuitBreaker { retry_in_ms });
        }
        info!(peer = %peer, "reconnecting");
        self.send(SyncEvent::Reconnect, now, out);
        self.redialing = true;
        Ok(peer)
    }

    /// Return a failed redial to DISCONNECTED so it can be retried
    pub fn abandon_redial(&mut self, now: Timestamp, out: &mut Outbox) {
        if self.redialing && self.send(SyncEvent::RedialFailed, now, out) {
            debug!(peer = ?self.last_peer, "redial failed");
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
