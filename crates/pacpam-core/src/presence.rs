//! Presence guard
//!
//! Detects a silent peer while the sync layer is CONNECTED. Every inbound
//! datum or keepalive pong feeds `DATA_RECEIVED` and restarts the silence
//! timer; expiry sends `TIMEOUT`.
//!
//! ```text
//! HALF_OPEN --DATA_RECEIVED--> CLOSED --TIMEOUT--> OPEN --DATA_RECEIVED--> HALF_OPEN
//! ```
//!
//! A guard that never saw data stays HALF_OPEN through timeouts.

use std::convert::Infallible;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::{AppEvent, Outbox};
use crate::config::PresenceConfig;
use crate::engine::{impl_label, Definition, Hooks, Machine, StateEngine, TransitionDef, TransitionRecord};
use crate::timers::Timers;
use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceState {
    /// Waiting for (renewed) evidence of the peer
    HalfOpen,
    /// Peer present
    Closed,
    /// Peer presumed absent
    Open,
}

impl_label!(PresenceState {
    HalfOpen => "HALF_OPEN",
    Closed => "CLOSED",
    Open => "OPEN",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceEvent {
    DataReceived,
    Timeout,
}

impl_label!(PresenceEvent {
    DataReceived => "DATA_RECEIVED",
    Timeout => "TIMEOUT",
});

#[derive(Debug)]
pub struct PresenceMachine;

impl Machine for PresenceMachine {
    type State = PresenceState;
    type Event = PresenceEvent;
    type Guard = Infallible;
    type Emit = Infallible;
    type Action = Infallible;

    const NAME: &'static str = "presence";

    fn definition() -> &'static Definition<Self> {
        use PresenceEvent::*;
        use PresenceState::*;

        static DEFINITION: OnceLock<Definition<PresenceMachine>> = OnceLock::new();
        DEFINITION.get_or_init(|| {
            Definition::new(HalfOpen, &[HalfOpen, Closed, Open])
                .with(TransitionDef::new("g1", HalfOpen, DataReceived, Closed))
                .with(TransitionDef::new("g2", Closed, Timeout, Open))
                .with(TransitionDef::new("g3", Open, DataReceived, HalfOpen))
                .with(TransitionDef::new("g4", Closed, DataReceived, Closed))
        })
    }
}

/// Observable presence shift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// Entered OPEN
    Absent,
    /// Left OPEN for HALF_OPEN
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PresenceTimer {
    Silence,
}

struct PresenceHooks<'a> {
    out: &'a mut Outbox,
    change: Option<PresenceChange>,
}

impl Hooks<PresenceMachine> for PresenceHooks<'_> {
    fn on_transition(&mut self, record: &TransitionRecord<PresenceMachine>) {
        self.out.event(AppEvent::PresenceChanged {
            from: record.from,
            to: record.to,
            transition_id: record.id,
        });
        if record.to == PresenceState::Open {
            info!("peer silent, presumed absent");
            self.out.event(AppEvent::PeerAbsent);
            self.change = Some(PresenceChange::Absent);
        } else if record.from == PresenceState::Open {
            info!("peer back");
            self.out.event(AppEvent::PeerBack);
            self.change = Some(PresenceChange::Back);
        }
    }
}

/// Silence detector living for one CONNECTED period
#[derive(Debug)]
pub struct PresenceGuard {
    engine: StateEngine<PresenceMachine>,
    config: PresenceConfig,
    timers: Timers<PresenceTimer>,
}

impl PresenceGuard {
    /// Fresh guard in HALF_OPEN with the silence timer running
    pub fn start(config: PresenceConfig, now: Timestamp) -> Self {
        let mut timers = Timers::new();
        timers.arm(PresenceTimer::Silence, now + config.silence_timeout);
        Self {
            engine: StateEngine::new(),
            config,
            timers,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.engine.state()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    fn send(&mut self, event: PresenceEvent, out: &mut Outbox) -> Option<PresenceChange> {
        let mut hooks = PresenceHooks { out, change: None };
        self.engine.send(event, &mut hooks);
        hooks.change
    }

    /// Evidence of the peer: feed `DATA_RECEIVED` and restart the silence timer
    pub fn feed(&mut self, now: Timestamp, out: &mut Outbox) -> Option<PresenceChange> {
        let change = self.send(PresenceEvent::DataReceived, out);
        self.timers
            .arm(PresenceTimer::Silence, now + self.config.silence_timeout);
        change
    }

    /// Fire the silence timer if due
    pub fn poll(&mut self, now: Timestamp, out: &mut Outbox) -> Option<PresenceChange> {
        match self.timers.pop_due(now) {
            Some(PresenceTimer::Silence) => self.send(PresenceEvent::Timeout, out),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Effect;

    fn guard() -> PresenceGuard {
        PresenceGuard::start(PresenceConfig::default(), Timestamp::new(0))
    }

    #[test]
    fn test_definition_is_valid() {
        assert!(PresenceMachine::definition().validate().is_ok());
    }

    #[test]
    fn test_silence_opens_exactly_once() {
        let mut g = guard();
        let mut out = Outbox::new();
        assert_eq!(g.feed(Timestamp::new(100), &mut out), None);
        assert_eq!(g.state(), PresenceState::Closed);
        assert_eq!(g.next_deadline(), Some(Timestamp::new(5_100)));

        assert_eq!(g.poll(Timestamp::new(5_099), &mut out), None);
        assert_eq!(g.poll(Timestamp::new(5_100), &mut out), Some(PresenceChange::Absent));
        assert_eq!(g.state(), PresenceState::Open);
        assert_eq!(g.poll(Timestamp::new(50_000), &mut out), None);

        let absent = out
            .iter()
            .filter(|e| **e == Effect::App(AppEvent::PeerAbsent))
            .count();
        assert_eq!(absent, 1);
    }

    #[test]
    fn test_return_needs_two_data() {
        let mut g = guard();
        let mut out = Outbox::new();
        g.feed(Timestamp::new(1), &mut out);
        g.poll(Timestamp::new(5_001), &mut out);

        assert_eq!(g.feed(Timestamp::new(6_000), &mut out), Some(PresenceChange::Back));
        assert_eq!(g.state(), PresenceState::HalfOpen);
        assert_eq!(g.feed(Timestamp::new(6_100), &mut out), None);
        assert_eq!(g.state(), PresenceState::Closed);
    }

    #[test]
    fn test_silent_from_start_stays_half_open() {
        let mut g = guard();
        let mut out = Outbox::new();
        assert_eq!(g.poll(Timestamp::new(5_000), &mut out), None);
        assert_eq!(g.state(), PresenceState::HalfOpen);
        assert!(out.is_empty());
    }

    #[test]
    fn test_steady_data_is_self_loop() {
        let mut g = guard();
        let mut out = Outbox::new();
        g.feed(Timestamp::new(1), &mut out);
        out.take();
        for t in 2..20 {
            g.feed(Timestamp::new(t * 1_000), &mut out);
            g.poll(Timestamp::new(t * 1_000 + 1), &mut out);
        }
        assert_eq!(g.state(), PresenceState::Closed);
        assert!(out.is_empty());
    }
}
