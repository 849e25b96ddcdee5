//! Deterministic network simulation
//!
//! [`SimNetwork`] drives several [`Peer`] endpoints on one thread against a
//! shared [`ManualTimeSource`]. It plays the signaling server and the data
//! links by routing each endpoint's transport commands, and feeds inbound data
//! through the same [`InboundGate`] the async runtime uses. Nothing happens
//! between calls: [`SimNetwork::run`] routes until quiet and
//! [`SimNetwork::advance`] walks the clock through every due deadline.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace, warn};

use pacpam_core::{
    AppEvent, ConnectionState, Credentials, Effect, Frame, ManualTimeSource, PacpamError, Peer, PeerConfig,
    PeerId, Result, TimeSource, Timestamp, TransportCommand, TransportError, TransportEvent,
};
use pacpam_runtime::InboundGate;

/// Routing rounds allowed per [`SimNetwork::run`]
const MAX_ROUNDS: usize = 10_000;

// ----------------------------------------------------------------------------
// Nodes
// ----------------------------------------------------------------------------

struct SimNode {
    peer: Peer,
    gate: InboundGate,
    events: Vec<AppEvent>,
    sent: Vec<Frame>,
}

enum Delivery {
    Event(TransportEvent),
    Data(Value),
}

/// Impairments applied while routing
#[derive(Default)]
struct Faults {
    /// Nodes whose dial attempts fail as if they never registered
    unreachable: HashSet<String>,
    /// Nodes whose outgoing frames are dropped
    silent: HashSet<String>,
    /// Probability of dropping any frame, with its seeded generator
    loss: Option<(f64, fastrand::Rng)>,
}

// ----------------------------------------------------------------------------
// Simulated Network
// ----------------------------------------------------------------------------

/// In-memory signaling plus point-to-point links for simulated endpoints
pub struct SimNetwork {
    clock: ManualTimeSource,
    nodes: BTreeMap<String, SimNode>,
    /// Signaling registrations
    registry: BTreeMap<PeerId, String>,
    /// Open links, stored in both directions
    links: BTreeMap<String, String>,
    inbox: VecDeque<(String, Delivery)>,
    faults: Faults,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            clock: ManualTimeSource::new(Timestamp::new(1_000)),
            nodes: BTreeMap::new(),
            registry: BTreeMap::new(),
            links: BTreeMap::new(),
            inbox: VecDeque::new(),
            faults: Faults::default(),
        }
    }

    /// Two endpoints sharing `secret`
    pub fn pair(host: &str, guest: &str, config: PeerConfig, secret: &str) -> Self {
        let mut net = Self::new();
        net.add_peer(host, config.clone(), secret);
        net.add_peer(guest, config, secret);
        net
    }

    /// Add an endpoint that authenticates as `name` with `secret`
    pub fn add_peer(&mut self, name: &str, config: PeerConfig, secret: &str) {
        let clock: Arc<dyn TimeSource> = Arc::new(self.clock.clone());
        let gate = InboundGate::new(&config, clock.clone());
        let peer = Peer::new(config, Credentials::new(secret, name), clock);
        self.nodes.insert(
            name.to_string(),
            SimNode {
                peer,
                gate,
                events: Vec::new(),
                sent: Vec::new(),
            },
        );
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn clock(&self) -> &ManualTimeSource {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn peer(&self, name: &str) -> Option<&Peer> {
        self.nodes.get(name).map(|node| &node.peer)
    }

    /// Mutable endpoint access; call [`SimNetwork::run`] afterwards to route its effects
    pub fn peer_mut(&mut self, name: &str) -> Option<&mut Peer> {
        self.nodes.get_mut(name).map(|node| &mut node.peer)
    }

    /// Application events `name` produced so far
    pub fn events(&self, name: &str) -> &[AppEvent] {
        self.nodes.get(name).map(|node| node.events.as_slice()).unwrap_or_default()
    }

    pub fn take_events(&mut self, name: &str) -> Vec<AppEvent> {
        self.nodes
            .get_mut(name)
            .map(|node| std::mem::take(&mut node.events))
            .unwrap_or_default()
    }

    /// Frames `name` put on the wire, delivered or not
    pub fn sent(&self, name: &str) -> &[Frame] {
        self.nodes.get(name).map(|node| node.sent.as_slice()).unwrap_or_default()
    }

    pub fn clear_sent(&mut self) {
        for node in self.nodes.values_mut() {
            node.sent.clear();
        }
    }

    pub fn is_linked(&self, name: &str) -> bool {
        self.links.contains_key(name)
    }

    /// Whether signaling currently knows `name`
    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.values().any(|node| node == name)
    }

    fn node(&mut self, name: &str) -> Result<&mut SimNode> {
        self.nodes.get_mut(name).ok_or_else(|| {
            PacpamError::Transport(TransportError::Unavailable {
                reason: format!("no simulated peer named {name}"),
            })
        })
    }

    // ------------------------------------------------------------------------
    // Scenario Helpers
    // ------------------------------------------------------------------------

    /// Register both endpoints if needed, dial `guest` from `host` and settle
    pub fn connect(&mut self, host: &str, guest: &str) -> Result<()> {
        for name in [host, guest] {
            let peer = &mut self.node(name)?.peer;
            if peer.state() == ConnectionState::Idle {
                peer.init(name)?;
            }
        }
        self.run();
        self.node(host)?.peer.connect_to(guest)?;
        self.run();
        Ok(())
    }

    /// Deliver raw data to `to` as if its linked peer had sent it
    pub fn inject(&mut self, to: &str, raw: Value) {
        self.inbox.push_back((to.to_string(), Delivery::Data(raw)));
        self.run();
    }

    // ------------------------------------------------------------------------
    // Fault Injection
    // ------------------------------------------------------------------------

    /// Dials to `name` fail with `PeerUnavailable`
    pub fn set_unreachable(&mut self, name: &str, unreachable: bool) {
        if unreachable {
            self.faults.unreachable.insert(name.to_string());
        } else {
            self.faults.unreachable.remove(name);
        }
    }

    /// Drop everything `name` sends while keeping its link up
    pub fn silence(&mut self, name: &str, silent: bool) {
        if silent {
            self.faults.silent.insert(name.to_string());
        } else {
            self.faults.silent.remove(name);
        }
    }

    /// Drop each frame with `probability`, reproducibly for a given seed
    pub fn set_loss(&mut self, probability: f64, seed: u64) {
        self.faults.loss = (probability > 0.0).then(|| (probability, fastrand::Rng::with_seed(seed)));
    }

    /// Break `name`'s link with an error on both ends
    pub fn sever(&mut self, name: &str) -> bool {
        let Some(other) = self.unlink(name) else {
            return false;
        };
        debug!(peer = name, other = %other, "severing link");
        for side in [name.to_string(), other] {
            self.deliver(
                &side,
                TransportEvent::LinkError {
                    reason: "link severed".to_string(),
                },
            );
        }
        self.run();
        true
    }

    /// Drop `name`'s signaling registration
    pub fn lose_signaling(&mut self, name: &str) {
        self.registry.retain(|_, node| node != name);
        self.deliver(name, TransportEvent::SignalingLost);
        self.run();
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Route effects and deliveries until the network is quiet; returns the rounds taken
    pub fn run(&mut self) -> usize {
        let names: Vec<String> = self.nodes.keys().cloned().collect();
        for round in 0..MAX_ROUNDS {
            let mut progressed = false;

            for name in &names {
                let effects = match self.nodes.get_mut(name) {
                    Some(node) => node.peer.take_effects(),
                    None => continue,
                };
                progressed |= !effects.is_empty();
                for effect in effects {
                    match effect {
                        Effect::Transport(command) => self.route(name, command),
                        Effect::App(event) => {
                            if let Some(node) = self.nodes.get_mut(name) {
                                if let AppEvent::Disconnected {
                                    peer_id: Some(remote),
                                    ..
                                } = &event
                                {
                                    node.gate.reset_peer(remote);
                                }
                                node.events.push(event);
                            }
                        }
                    }
                }
            }

            while let Some((to, delivery)) = self.inbox.pop_front() {
                progressed = true;
                self.receive(&to, delivery);
            }

            if !progressed {
                return round;
            }
        }
        warn!(rounds = MAX_ROUNDS, "simulated network did not settle");
        MAX_ROUNDS
    }

    /// Move the clock forward, firing every deadline on the way in order
    pub fn advance(&mut self, by: Duration) {
        let target = self.now() + by;
        self.run();
        for _ in 0..MAX_ROUNDS {
            let due = self
                .nodes
                .values()
                .filter_map(|node| node.peer.next_deadline())
                .min()
                .filter(|at| *at <= target);
            let Some(at) = due else {
                break;
            };
            if at > self.now() {
                self.clock.set(at);
            }
            self.tick_all();
        }
        self.clock.set(target);
        self.tick_all();
    }

    fn tick_all(&mut self) {
        for node in self.nodes.values_mut() {
            node.peer.tick();
        }
        self.run();
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    fn deliver(&mut self, to: &str, event: TransportEvent) {
        self.inbox.push_back((to.to_string(), Delivery::Event(event)));
    }

    fn receive(&mut self, to: &str, delivery: Delivery) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        match delivery {
            Delivery::Event(event) => {
                trace!(peer = to, event = event.name(), "delivering");
                node.peer.handle_event(event);
            }
            Delivery::Data(raw) => {
                let remote = node.peer.remote().cloned();
                match node.gate.admit(remote.as_ref(), raw) {
                    Ok(frame) => node.peer.handle_event(TransportEvent::Data(frame)),
                    Err(rejection) => debug!(peer = to, %rejection, "inbound data rejected"),
                }
            }
        }
    }

    fn unlink(&mut self, name: &str) -> Option<String> {
        let other = self.links.remove(name)?;
        self.links.remove(&other);
        Some(other)
    }

    fn route(&mut self, from: &str, command: TransportCommand) {
        trace!(peer = from, ?command, "routing");
        match command {
            TransportCommand::Open { local_id } => {
                if self.registry.get(&local_id).is_some_and(|owner| owner != from) {
                    self.deliver(from, TransportEvent::IdUnavailable);
                } else {
                    self.registry.insert(local_id, from.to_string());
                    self.deliver(from, TransportEvent::PeerOpened);
                }
            }
            TransportCommand::Dial { peer_id } => {
                let target = self
                    .registry
                    .get(&peer_id)
                    .filter(|target| !self.faults.unreachable.contains(*target))
                    .cloned();
                match target {
                    Some(target) => self.open_link(from, &target),
                    None => self.deliver(from, TransportEvent::PeerUnavailable { peer_id }),
                }
            }
            TransportCommand::Send { frame } => self.transmit(from, frame),
            TransportCommand::CloseLink => {
                if let Some(other) = self.unlink(from) {
                    self.deliver(&other, TransportEvent::LinkClosed);
                }
            }
            TransportCommand::RefuseInbound { peer_id } => {
                if let Some(dialer) = self.registry.get(&peer_id).cloned() {
                    self.deliver(
                        &dialer,
                        TransportEvent::LinkError {
                            reason: "inbound link refused".to_string(),
                        },
                    );
                }
            }
            TransportCommand::ReconnectSignaling => {
                let local_id = self.nodes.get(from).and_then(|node| node.peer.local_id().cloned());
                if let Some(local_id) = local_id {
                    self.registry.entry(local_id).or_insert_with(|| from.to_string());
                }
            }
            TransportCommand::Destroy => {
                if let Some(other) = self.unlink(from) {
                    self.deliver(&other, TransportEvent::LinkClosed);
                }
                self.registry.retain(|_, node| node != from);
            }
        }
    }

    fn open_link(&mut self, dialer: &str, target: &str) {
        let Some(dialer_id) = self.nodes.get(dialer).and_then(|node| node.peer.local_id().cloned()) else {
            return;
        };
        let Some(node) = self.nodes.get_mut(target) else {
            return;
        };
        let accepts = node.peer.state() == ConnectionState::Ready && !node.peer.connection().has_link();
        // settle acceptance before either side sees the link open
        node.peer
            .handle_event(TransportEvent::InboundConnection { peer_id: dialer_id });
        if !accepts {
            return;
        }
        self.links.insert(dialer.to_string(), target.to_string());
        self.links.insert(target.to_string(), dialer.to_string());
        self.deliver(target, TransportEvent::LinkOpened);
        self.deliver(dialer, TransportEvent::LinkOpened);
    }

    fn transmit(&mut self, from: &str, frame: Frame) {
        if let Some(node) = self.nodes.get_mut(from) {
            node.sent.push(frame.clone());
        }
        let Some(to) = self.links.get(from).cloned() else {
            trace!(peer = from, frame = frame.type_name(), "no link, frame dropped");
            return;
        };
        if self.faults.silent.contains(from) {
            return;
        }
        if let Some((probability, rng)) = self.faults.loss.as_mut() {
            if rng.f64() < *probability {
                trace!(peer = from, frame = frame.type_name(), "frame lost");
                return;
            }
        }
        match frame.to_value() {
            Ok(raw) => self.inbox.push_back((to, Delivery::Data(raw))),
            Err(e) => warn!(error = %e, "frame did not serialize"),
        }
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("now", &self.now())
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("links", &self.links)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pacpam_core::SyncState;

    #[test]
    fn test_connect_authenticates_both_sides() {
        let mut net = SimNetwork::pair("alice", "bob", PeerConfig::testing(), "secret");
        net.connect("alice", "bob").unwrap();

        let alice = net.peer("alice").unwrap();
        let bob = net.peer("bob").unwrap();
        assert_eq!(alice.state(), ConnectionState::Connected);
        assert_eq!(bob.state(), ConnectionState::Connected);
        assert!(alice.is_host());
        assert!(!bob.is_host());
        assert_eq!(bob.remote(), Some(&PeerId::new("test-alice")));
        assert_eq!(alice.sync_state(), SyncState::Connected);
        assert!(net.is_linked("alice") && net.is_linked("bob"));
    }

    #[test]
    fn test_duplicate_identity_is_refused() {
        let mut net = SimNetwork::new();
        net.add_peer("alice", PeerConfig::testing(), "secret");
        net.add_peer("alice-2", PeerConfig::testing(), "secret");
        net.peer_mut("alice").unwrap().init("alice").unwrap();
        net.peer_mut("alice-2").unwrap().init("alice").unwrap();
        net.run();

        assert_eq!(net.peer("alice").unwrap().state(), ConnectionState::Ready);
        assert_eq!(net.peer("alice-2").unwrap().state(), ConnectionState::Idle);
    }

    #[test]
    fn test_keepalive_flows_while_idle() {
        let mut net = SimNetwork::pair("alice", "bob", PeerConfig::testing(), "secret");
        net.connect("alice", "bob").unwrap();
        net.clear_sent();
        net.advance(Duration::from_millis(500));

        assert!(net.sent("alice").iter().any(|f| matches!(f, Frame::Ping { .. })));
        assert!(net.sent("bob").iter().any(|f| matches!(f, Frame::Pong { .. })));
        assert_eq!(net.peer("alice").unwrap().state(), ConnectionState::Connected);
    }

    #[test]
    fn test_total_loss_drops_the_link() {
        let mut net = SimNetwork::pair("alice", "bob", PeerConfig::testing(), "secret");
        net.connect("alice", "bob").unwrap();
        net.set_loss(1.0, 7);
        net.advance(Duration::from_millis(600));

        assert_eq!(net.peer("alice").unwrap().state(), ConnectionState::Ready);
        assert_eq!(net.peer("alice").unwrap().sync_state(), SyncState::Disconnected);
    }
}
