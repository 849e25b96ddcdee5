//! Per-peer circuit breaker
//!
//! A breaker tracks dial outcomes for one remote peer. Its own counters decide
//! which event to feed into the CLOSED/OPEN/HALF_OPEN machine; the engine only
//! executes the resulting transition. Recovery from OPEN is lazy: nothing
//! advances the machine on a timer, the first admission check that notices
//! the elapsed wait fires `RESET_TIMEOUT` itself.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::OnceLock;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CircuitBreakerConfig;
use crate::engine::{impl_label, Definition, Hooks, Machine, StateEngine, TransitionDef, TransitionRecord};
use crate::types::{duration_millis, PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Machine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl_label!(BreakerState {
    Closed => "CLOSED",
    Open => "OPEN",
    HalfOpen => "HALF_OPEN",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerEvent {
    Success,
    Failure,
    ThresholdReached,
    ResetTimeout,
    Reset,
    ForceOpen,
}

impl_label!(BreakerEvent {
    Success => "SUCCESS",
    Failure => "FAILURE",
    ThresholdReached => "THRESHOLD_REACHED",
    ResetTimeout => "RESET_TIMEOUT",
    Reset => "RESET",
    ForceOpen => "FORCE_OPEN",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerAction {
    /// CLOSED self-loop on success
    ResetFailures,
}

impl_label!(BreakerAction { ResetFailures => "resetFailures" });

/// CLOSED/OPEN/HALF_OPEN breaker machine
#[derive(Debug)]
pub struct BreakerMachine;

impl Machine for BreakerMachine {
    type State = BreakerState;
    type Event = BreakerEvent;
    type Guard = Infallible;
    type Emit = Infallible;
    type Action = BreakerAction;

    const NAME: &'static str = "circuit_breaker";

    fn definition() -> &'static Definition<Self> {
        use BreakerEvent::*;
        use BreakerState::*;

        static DEFINITION: OnceLock<Definition<BreakerMachine>> = OnceLock::new();
        DEFINITION.get_or_init(|| {
            Definition::new(Closed, &[Closed, Open, HalfOpen])
                .with(TransitionDef::new("cb1", Closed, Success, Closed).action(BreakerAction::ResetFailures))
                .with(TransitionDef::new("cb2", Closed, ThresholdReached, Open))
                .with(TransitionDef::new("cb3", Closed, Reset, Closed).manual())
                .with(TransitionDef::new("cb4", Closed, ForceOpen, Open).manual())
                .with(TransitionDef::new("cb5", Open, ResetTimeout, HalfOpen))
                .with(TransitionDef::new("cb6", Open, Reset, Closed).manual())
                .with(TransitionDef::new("cb7", HalfOpen, Success, Closed))
                .with(TransitionDef::new("cb8", HalfOpen, Failure, Open))
                .with(TransitionDef::new("cb9", HalfOpen, Reset, Closed).manual())
                .with(TransitionDef::new("cb10", HalfOpen, ForceOpen, Open).manual())
        })
    }
}

// ----------------------------------------------------------------------------
// Reporting Types
// ----------------------------------------------------------------------------

/// One recorded dial outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: Timestamp,
}

/// One recorded state change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: BreakerState,
    pub to: BreakerState,
    pub timestamp: Timestamp,
}

/// Snapshot of a breaker's counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    /// Percentage of successful calls inside the monitoring window (100 when idle)
    pub success_rate: u8,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub consecutive_failures: u32,
    pub recent_calls: usize,
    pub next_attempt_in_ms: Option<u64>,
    pub last_state_change: Timestamp,
    pub state_changes: Vec<StateChange>,
}

/// User-facing summary of a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BreakerStatus {
    Ok,
    Unstable { failures: u32 },
    HalfOpen,
    Open { retry_in_ms: u64 },
}

/// State and retry deadline, as exposed to the transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerInfo {
    pub state: BreakerState,
    pub next_attempt_time: Option<Timestamp>,
}

const MAX_STATE_CHANGES: usize = 10;

// ----------------------------------------------------------------------------
// Circuit Breaker
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct BreakerStats {
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    consecutive_failures: u32,
    last_state_change: Timestamp,
    state_changes: VecDeque<StateChange>,
}

#[derive(Debug)]
struct BreakerContext {
    peer_id: PeerId,
    config: CircuitBreakerConfig,
    now: Timestamp,
    failures: u32,
    last_failure_time: Option<Timestamp>,
    next_attempt_time: Option<Timestamp>,
    half_open_tests: u32,
    stats: BreakerStats,
    history: VecDeque<CallRecord>,
}

impl Hooks<BreakerMachine> for BreakerContext {
    fn on_transition(&mut self, record: &TransitionRecord<BreakerMachine>) {
        debug!(peer = %self.peer_id, "breaker {:?}", record);
        self.stats.last_state_change = self.now;
        self.stats.state_changes.push_back(StateChange {
            from: record.from,
            to: record.to,
            timestamp: self.now,
        });
        while self.stats.state_changes.len() > MAX_STATE_CHANGES {
            self.stats.state_changes.pop_front();
        }
    }

    fn on_action(&mut self, action: BreakerAction, _record: &TransitionRecord<BreakerMachine>) {
        match action {
            BreakerAction::ResetFailures => self.failures = 0,
        }
    }

    fn on_entry(&mut self, state: BreakerState, _record: &TransitionRecord<BreakerMachine>) {
        match state {
            BreakerState::Open => {
                self.next_attempt_time = Some(self.now + self.config.reset_timeout);
                self.half_open_tests = 0;
            }
            BreakerState::HalfOpen => self.half_open_tests = 0,
            BreakerState::Closed => {
                self.failures = 0;
                self.next_attempt_time = None;
            }
        }
    }
}

/// Failure tracker for one (local endpoint, remote peer) pair
#[derive(Debug)]
pub struct CircuitBreaker {
    engine: StateEngine<BreakerMachine>,
    ctx: BreakerContext,
}

impl CircuitBreaker {
    pub fn new(peer_id: PeerId, config: CircuitBreakerConfig, now: Timestamp) -> Self {
        Self {
            engine: StateEngine::new(),
            ctx: BreakerContext {
                peer_id,
                config,
                now,
                failures: 0,
                last_failure_time: None,
                next_attempt_time: None,
                half_open_tests: 0,
                stats: BreakerStats {
                    last_state_change: now,
                    ..Default::default()
                },
                history: VecDeque::new(),
            },
        }
    }

    fn send(&mut self, event: BreakerEvent, now: Timestamp) -> bool {
        self.ctx.now = now;
        self.engine.send(event, &mut self.ctx)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.ctx.peer_id
    }

    pub fn state(&self) -> BreakerState {
        self.engine.state()
    }

    /// Failures since the breaker last entered CLOSED
    pub fn failures(&self) -> u32 {
        self.ctx.failures
    }

    pub fn next_attempt_time(&self) -> Option<Timestamp> {
        self.ctx.next_attempt_time
    }

    pub fn last_failure_time(&self) -> Option<Timestamp> {
        self.ctx.last_failure_time
    }

    /// Record a successful dial
    pub fn on_success(&mut self, now: Timestamp) {
        self.ctx.stats.total_calls += 1;
        self.ctx.stats.total_successes += 1;
        self.ctx.stats.consecutive_failures = 0;
        self.record_call(true, None, now);
        self.send(BreakerEvent::Success, now);
    }

    /// Record a failed dial
    pub fn on_failure(&mut self, error: &str, now: Timestamp) {
        self.ctx.stats.total_calls += 1;
        self.ctx.stats.total_failures += 1;
        self.ctx.stats.consecutive_failures += 1;
        self.ctx.failures += 1;
        self.ctx.last_failure_time = Some(now);
        self.record_call(false, Some(error.to_string()), now);

        match self.state() {
            BreakerState::Closed if self.ctx.failures >= self.ctx.config.max_failures => {
                info!(
                    peer = %self.ctx.peer_id,
                    failures = self.ctx.failures,
                    "circuit breaker opening"
                );
                self.send(BreakerEvent::ThresholdReached, now);
            }
            BreakerState::HalfOpen => {
                self.send(BreakerEvent::Failure, now);
            }
            _ => {}
        }
    }

    fn record_call(&mut self, success: bool, error: Option<String>, now: Timestamp) {
        self.ctx.history.push_back(CallRecord {
            success,
            error,
            timestamp: now,
        });
        self.prune_history(now);
    }

    fn prune_history(&mut self, now: Timestamp) {
        let window = duration_millis(self.ctx.config.monitoring_window);
        while let Some(front) = self.ctx.history.front() {
            if now - front.timestamp >= window {
                self.ctx.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Pure availability check: CLOSED, HALF_OPEN, or OPEN with the wait elapsed
    pub fn is_available(&self, now: Timestamp) -> bool {
        match self.state() {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => self.ctx.next_attempt_time.is_some_and(|at| now >= at),
        }
    }

    /// Remaining wait before an OPEN breaker admits a trial
    pub fn retry_in(&self, now: Timestamp) -> u64 {
        match (self.state(), self.ctx.next_attempt_time) {
            (BreakerState::Open, Some(at)) => now.millis_until(at),
            _ => 0,
        }
    }

    /// Advance an expired OPEN breaker to HALF_OPEN; returns whether it moved
    pub fn poll_recovery(&mut self, now: Timestamp) -> bool {
        if self.state() == BreakerState::Open && self.is_available(now) {
            self.send(BreakerEvent::ResetTimeout, now)
        } else {
            false
        }
    }

    /// Admission check for a new dial
    ///
    /// Fires `RESET_TIMEOUT` first when the OPEN wait has elapsed. HALF_OPEN
    /// admits at most `half_open_attempts` trials. On rejection returns the
    /// remaining wait in milliseconds.
    pub fn admit(&mut self, now: Timestamp) -> Result<(), u64> {
        self.poll_recovery(now);
        match self.state() {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(self.retry_in(now)),
            BreakerState::HalfOpen => {
                if self.ctx.half_open_tests < self.ctx.config.half_open_attempts {
                    self.ctx.half_open_tests += 1;
                    Ok(())
                } else {
                    Err(0)
                }
            }
        }
    }

    /// Operator override back to CLOSED
    pub fn reset(&mut self, now: Timestamp) {
        debug!(peer = %self.ctx.peer_id, "manual breaker reset");
        self.send(BreakerEvent::Reset, now);
        self.ctx.failures = 0;
        self.ctx.stats.consecutive_failures = 0;
    }

    /// Operator override to OPEN
    pub fn force_open(&mut self, now: Timestamp) {
        debug!(peer = %self.ctx.peer_id, "forced breaker open");
        self.send(BreakerEvent::ForceOpen, now);
    }

    pub fn info(&self) -> BreakerInfo {
        BreakerInfo {
            state: self.state(),
            next_attempt_time: self.ctx.next_attempt_time,
        }
    }

    pub fn metrics(&self, now: Timestamp) -> BreakerMetrics {
        let window = duration_millis(self.ctx.config.monitoring_window);
        let recent: Vec<&CallRecord> = self
            .ctx
            .history
            .iter()
            .filter(|call| now - call.timestamp < window)
            .collect();
        let success_rate = if recent.is_empty() {
            100
        } else {
            let ok = recent.iter().filter(|call| call.success).count();
            ((ok * 100 + recent.len() / 2) / recent.len()) as u8
        };

        BreakerMetrics {
            state: self.state(),
            success_rate,
            total_calls: self.ctx.stats.total_calls,
            total_failures: self.ctx.stats.total_failures,
            total_successes: self.ctx.stats.total_successes,
            consecutive_failures: self.ctx.stats.consecutive_failures,
            recent_calls: recent.len(),
            next_attempt_in_ms: self.ctx.next_attempt_time.map(|at| now.millis_until(at)),
            last_state_change: self.ctx.stats.last_state_change,
            state_changes: self.ctx.stats.state_changes.iter().copied().collect(),
        }
    }

    pub fn status(&self, now: Timestamp) -> BreakerStatus {
        match self.state() {
            BreakerState::Open => BreakerStatus::Open {
                retry_in_ms: self.retry_in(now),
            },
            BreakerState::HalfOpen => BreakerStatus::HalfOpen,
            BreakerState::Closed if self.ctx.stats.consecutive_failures > 0 => {
                BreakerStatus::Unstable {
                    failures: self.ctx.stats.consecutive_failures,
                }
            }
            BreakerState::Closed => BreakerStatus::Ok,
        }
    }
}

// ----------------------------------------------------------------------------
// Breaker Registry
// ----------------------------------------------------------------------------

/// Per-remote-peer breakers owned by one connection
///
/// Breakers are created lazily on the first dial and kept for the lifetime of
/// the registry so failure history survives reconnect attempts.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: HashMap<PeerId, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: HashMap::new(),
        }
    }

    pub fn get_or_create(&mut self, peer_id: &PeerId, now: Timestamp) -> &mut CircuitBreaker {
        let config = &self.config;
        self.breakers
            .entry(peer_id.clone())
            .or_insert_with(|| CircuitBreaker::new(peer_id.clone(), config.clone(), now))
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&CircuitBreaker> {
        self.breakers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut CircuitBreaker> {
        self.breakers.get_mut(peer_id)
    }

    /// Admission check, creating the breaker on first use
    pub fn admit(&mut self, peer_id: &PeerId, now: Timestamp) -> Result<(), u64> {
        self.get_or_create(peer_id, now).admit(now)
    }

    pub fn info(&self, peer_id: &PeerId) -> Option<BreakerInfo> {
        self.breakers.get(peer_id).map(CircuitBreaker::info)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            PeerId::new("test-bob"),
            CircuitBreakerConfig::default(),
            Timestamp::new(0),
        )
    }

    #[test]
    fn test_definition_is_valid() {
        assert!(BreakerMachine::definition().validate().is_ok());
        assert_eq!(BreakerMachine::definition().transitions().len(), 10);
    }

    #[test]
    fn test_opens_after_max_failures() {
        let mut cb = breaker();
        cb.on_failure("timeout", Timestamp::new(10));
        cb.on_failure("timeout", Timestamp::new(20));
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.status(Timestamp::new(20)), BreakerStatus::Unstable { failures: 2 });
        cb.on_failure("timeout", Timestamp::new(30));
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.next_attempt_time(), Some(Timestamp::new(30_030)));
        assert_eq!(cb.admit(Timestamp::new(25_030)), Err(5_000));
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let mut cb = breaker();
        cb.on_failure("x", Timestamp::new(1));
        cb.on_failure("x", Timestamp::new(2));
        cb.on_success(Timestamp::new(3));
        assert_eq!(cb.failures(), 0);
        cb.on_failure("x", Timestamp::new(4));
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_lazy_recovery_and_half_open_trial() {
        let mut cb = breaker();
        for t in 1..=3 {
            cb.on_failure("x", Timestamp::new(t));
        }
        let expiry = Timestamp::new(3) + Duration::from_secs(30);
        assert!(!cb.is_available(Timestamp::new(100)));
        assert!(cb.is_available(expiry));
        assert_eq!(cb.state(), BreakerState::Open);

        assert_eq!(cb.admit(expiry), Ok(()));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.admit(expiry), Err(0));

        cb.on_success(expiry + 10);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.next_attempt_time(), None);
    }

    #[test]
    fn test_failure_in_half_open_reopens() {
        let mut cb = breaker();
        for t in 1..=3 {
            cb.on_failure("x", Timestamp::new(t));
        }
        let expiry = Timestamp::new(30_003);
        assert!(cb.poll_recovery(expiry));
        cb.on_failure("still down", expiry + 5);
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.next_attempt_time(), Some(expiry + 5 + 30_000));
    }

    #[test]
    fn test_manual_overrides() {
        let mut cb = breaker();
        cb.force_open(Timestamp::new(5));
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.status(Timestamp::new(5)), BreakerStatus::Open { retry_in_ms: 30_000 });
        cb.reset(Timestamp::new(6));
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.status(Timestamp::new(6)), BreakerStatus::Ok);
    }

    #[test]
    fn test_metrics_window() {
        let mut cb = breaker();
        cb.on_success(Timestamp::new(0));
        cb.on_failure("x", Timestamp::new(1_000));
        let metrics = cb.metrics(Timestamp::new(2_000));
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.total_successes, 1);
        assert_eq!(metrics.total_failures, 1);
        assert_eq!(metrics.recent_calls, 2);
        assert_eq!(metrics.success_rate, 50);

        let later = cb.metrics(Timestamp::new(60_500));
        assert_eq!(later.recent_calls, 1);
        assert_eq!(later.success_rate, 0);
        assert_eq!(later.total_calls, 2);
    }

    #[test]
    fn test_state_change_log_is_bounded() {
        let mut cb = breaker();
        for i in 0..8u64 {
            cb.force_open(Timestamp::new(i * 2));
            cb.reset(Timestamp::new(i * 2 + 1));
        }
        let metrics = cb.metrics(Timestamp::new(100));
        assert_eq!(metrics.state_changes.len(), MAX_STATE_CHANGES);
        assert_eq!(metrics.last_state_change, Timestamp::new(15));
    }

    #[test]
    fn test_registry_keeps_history_per_peer() {
        let mut registry = BreakerRegistry::new(CircuitBreakerConfig::default());
        let bob = PeerId::new("test-bob");
        let eve = PeerId::new("test-eve");
        for t in 0..3 {
            registry.get_or_create(&bob, Timestamp::new(t)).on_failure("x", Timestamp::new(t));
        }
        assert!(registry.admit(&bob, Timestamp::new(10)).is_err());
        assert!(registry.admit(&eve, Timestamp::new(10)).is_ok());
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.info(&bob).map(|info| info.state),
            Some(BreakerState::Open)
        );
    }
}
