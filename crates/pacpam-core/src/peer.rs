//! Peer endpoint facade
//!
//! Wires the connection (L2), the sync layer (L3) and the session registry
//! together on one thread of control. Every entry point follows the same
//! cycle: feed the owning component, project the committed connection
//! transitions into the sync layer, hand the resulting signals to the
//! registry, then drain the commands queued by session controllers. Effects
//! accumulate in one outbox and are collected with [`Peer::take_effects`].

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{AppEvent, Effect, Outbox, TransportEvent};
use crate::circuit_breaker::BreakerInfo;
use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionState, Inbound};
use crate::errors::{PolicyError, ReconnectRejection, Result, SessionError};
use crate::presence::PresenceState;
use crate::protocol::Credentials;
use crate::session::{
    ControlQueue, SessionConfig, SessionController, SessionFactory, SessionHandler, SessionRegistry,
    SessionSnapshot, SessionState,
};
use crate::sync_layer::{SyncLayer, SyncState};
use crate::types::{PeerId, SessionId, SystemTimeSource, TimeSource, Timestamp};

/// One local endpoint of the session layer
pub struct Peer {
    clock: Arc<dyn TimeSource>,
    config: PeerConfig,
    connection: Connection,
    sync: SyncLayer,
    sessions: SessionRegistry,
    outbox: Outbox,
}

impl Peer {
    pub fn new(config: PeerConfig, credentials: Credentials, clock: Arc<dyn TimeSource>) -> Self {
        let connection = Connection::new(
            config.connection.clone(),
            config.circuit_breaker.clone(),
            credentials,
        );
        let sync = SyncLayer::new(config.presence.clone());
        Self {
            clock,
            config,
            connection,
            sync,
            sessions: SessionRegistry::new(),
            outbox: Outbox::new(),
        }
    }

    pub fn with_system_clock(config: PeerConfig, credentials: Credentials) -> Self {
        Self::new(config, credentials, Arc::new(SystemTimeSource::new()))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn sync(&self) -> &SyncLayer {
        &self.sync
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn presence(&self) -> Option<PresenceState> {
        self.sync.presence()
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.connection.local_id()
    }

    pub fn remote(&self) -> Option<&PeerId> {
        self.connection.remote()
    }

    pub fn is_host(&self) -> bool {
        self.connection.is_host()
    }

    pub fn breaker_info(&self, peer_id: &PeerId) -> Option<BreakerInfo> {
        self.connection.breaker_info(peer_id)
    }

    pub fn session_state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.state(id)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.snapshots()
    }

    pub fn controller(&self, id: &SessionId) -> Option<SessionController> {
        self.sessions.controller(id)
    }

    /// Queue shared by every session controller of this endpoint
    pub fn control_queue(&self) -> &Arc<ControlQueue> {
        self.sessions.queue()
    }

    /// Qualify a bare identity with this endpoint's namespace
    pub fn peer_id_for(&self, identity: &str) -> PeerId {
        PeerId::namespaced(self.connection.namespace(), identity)
    }

    // ------------------------------------------------------------------------
    // Connection Surface
    // ------------------------------------------------------------------------

    /// Validate the identity and register `<namespace>-<identity>` with signaling
    pub fn init(&mut self, identity: &str) -> Result<PeerId> {
        let now = self.now();
        let local_id = self.connection.init(identity, now, &mut self.outbox)?;
        info!(local_id = %local_id, "endpoint initializing");
        self.settle(now);
        Ok(local_id)
    }

    /// Dial the endpoint registered under `identity` in this namespace
    pub fn connect_to(&mut self, identity: &str) -> Result<()> {
        if identity.trim().is_empty() {
            return Err(PolicyError::EmptyPeerId.into());
        }
        let peer_id = self.peer_id_for(identity);
        self.connect_to_peer(&peer_id)
    }

    /// Dial a fully qualified peer id
    pub fn connect_to_peer(&mut self, peer_id: &PeerId) -> Result<()> {
        let now = self.now();
        let result = self.connection.connect_to(peer_id, now, &mut self.outbox);
        self.settle(now);
        Ok(result?)
    }

    /// Tear the endpoint down; safe to call repeatedly
    pub fn disconnect(&mut self) -> bool {
        let now = self.now();
        let changed = self.connection.disconnect(now, &mut self.outbox);
        self.settle(now);
        changed
    }

    /// Redial the last authenticated peer
    ///
    /// The outcome is also published as [`AppEvent::ReconnectResult`].
    pub fn reconnect(&mut self) -> core::result::Result<PeerId, ReconnectRejection> {
        let now = self.now();
        let outcome = self.sync.reconnect(&self.connection, now, &mut self.outbox);
        self.settle(now);

        match outcome {
            Ok(peer_id) => {
                self.outbox.event(AppEvent::ReconnectResult {
                    peer_id: Some(peer_id.clone()),
                    outcome: Ok(()),
                });
                let dial = self.connection.connect_to(&peer_id, now, &mut self.outbox);
                self.settle(now);
                if let Err(error) = dial {
                    warn!(peer = %peer_id, %error, "reconnect dial refused");
                    self.sync.abandon_redial(now, &mut self.outbox);
                    self.outbox.event(AppEvent::Error {
                        message: error.to_string(),
                    });
                }
                Ok(peer_id)
            }
            Err(rejection) => {
                debug!(%rejection, "reconnect rejected");
                self.outbox.event(AppEvent::ReconnectResult {
                    peer_id: self.sync.last_peer().cloned(),
                    outcome: Err(rejection),
                });
                Err(rejection)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Session Surface
    // ------------------------------------------------------------------------

    pub fn set_factory(&mut self, factory: impl SessionFactory + 'static) {
        self.sessions.set_factory(factory);
    }

    pub fn create_session(
        &mut self,
        id: impl Into<SessionId>,
        config: SessionConfig,
        handler: Box<dyn SessionHandler>,
    ) -> core::result::Result<(), SessionError> {
        let now = self.now();
        let result = self
            .sessions
            .create_session(id.into(), config, handler, &mut self.outbox);
        self.settle(now);
        result
    }

    pub fn end_session(&mut self, id: &SessionId) -> bool {
        let now = self.now();
        let ended = self.sessions.end_session(id, &mut self.outbox);
        self.settle(now);
        ended
    }

    pub fn send_action(&mut self, id: &SessionId, action: Value) -> core::result::Result<(), SessionError> {
        let now = self.now();
        let result = self.sessions.send_action(id, action, &mut self.outbox);
        self.settle(now);
        result
    }

    pub fn send_message(&mut self, id: &SessionId, payload: Value) -> core::result::Result<(), SessionError> {
        let now = self.now();
        let result = self.sessions.send_message(id, payload, &mut self.outbox);
        self.settle(now);
        result
    }

    pub fn broadcast_state(&mut self, id: &SessionId) -> core::result::Result<(), SessionError> {
        let now = self.now();
        let result = self.sessions.broadcast_state(id, &mut self.outbox);
        self.settle(now);
        result
    }

    pub fn set_fps(&mut self, id: &SessionId, fps: u32) -> core::result::Result<(), SessionError> {
        let now = self.now();
        let result = self.sessions.set_fps(id, fps, now, &mut self.outbox);
        self.settle(now);
        result
    }

    /// Apply commands queued by session controllers outside a peer call
    pub fn process_commands(&mut self) {
        let now = self.now();
        self.settle(now);
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Fold one transport event into the endpoint
    pub fn handle_event(&mut self, event: TransportEvent) {
        let now = self.now();
        let inbound = self.connection.handle_event(event, now, &mut self.outbox);
        self.settle(now);

        match inbound {
            Inbound::Consumed => {}
            Inbound::Presence => {
                self.sync.feed_presence(now, &mut self.outbox);
                self.settle(now);
            }
            Inbound::Deliver(frame) => {
                self.sync.feed_presence(now, &mut self.outbox);
                self.settle(now);
                self.sessions.handle_frame(frame, now, &mut self.outbox);
                self.settle(now);
            }
        }
    }

    /// Fire every timer due at the current clock reading
    pub fn tick(&mut self) {
        let now = self.now();
        self.connection.poll_timers(now, &mut self.outbox);
        self.settle(now);
        self.sync.poll_timers(now, &mut self.outbox);
        self.settle(now);
        self.sessions.poll_timers(now, &mut self.outbox);
        self.settle(now);
    }

    /// Earliest pending deadline across all components
    pub fn next_deadline(&self) -> Option<Timestamp> {
        [
            self.connection.next_deadline(),
            self.sync.next_deadline(),
            self.sessions.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Effects produced since the last call, in causal order
    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.outbox.take()
    }

    pub fn has_effects(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Propagate committed transitions and queued commands
    fn settle(&mut self, now: Timestamp) {
        for record in self.connection.take_transitions() {
            self.sync
                .observe(&record, self.connection.remote(), now, &mut self.outbox);
        }
        let is_host = self.connection.is_host();
        for signal in self.sync.take_signals() {
            debug!(?signal, "sync signal");
            self.sessions.on_signal(signal, is_host, &mut self.outbox);
        }
        self.sessions.drain_commands(now, &mut self.outbox);
    }
}

impl core::fmt::Debug for Peer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Peer")
            .field("connection", &self.connection.state())
            .field("sync", &self.sync.state())
            .field("sessions", &self.sessions.len())
            .field("pending_effects", &self.outbox.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
