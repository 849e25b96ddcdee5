//! Inbound rate limiting
//!
//! Fixed windows keyed by (peer, message type). Every rejected message is a
//! violation; a peer collecting `max_violations` inside the violation window
//! is blocked outright for `block_duration`.

use hashbrown::HashMap;
use tracing::{error, warn};

use crate::config::RateLimitConfig;
use crate::errors::ValidationError;
use crate::types::{duration_millis, PeerId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Rate Limiter State
// ----------------------------------------------------------------------------

/// Message count inside the current window
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u32,
    window_start: Timestamp,
}

/// Violation history of one peer
#[derive(Debug, Clone, Default)]
struct PeerViolations {
    recent: Vec<(Timestamp, String)>,
    blocked_until: Option<Timestamp>,
}

// ----------------------------------------------------------------------------
// Rate Limiter
// ----------------------------------------------------------------------------

/// Rate limiter for inbound frames
pub struct RateLimiter<T: TimeSource> {
    config: RateLimitConfig,
    counters: HashMap<(PeerId, String), WindowCounter>,
    violations: HashMap<PeerId, PeerViolations>,
    time_source: T,
}

impl<T: TimeSource> RateLimiter<T> {
    /// Create a new rate limiter with default configuration
    pub fn new(time_source: T) -> Self {
        Self::with_config(RateLimitConfig::default(), time_source)
    }

    /// Create a new rate limiter with custom configuration
    pub fn with_config(config: RateLimitConfig, time_source: T) -> Self {
        Self {
            config,
            counters: HashMap::new(),
            violations: HashMap::new(),
            time_source,
        }
    }

    /// Count one message of `message_type` from `peer_id`, rejecting it when over the limit
    pub fn check(&mut self, peer_id: &PeerId, message_type: &str) -> Result<(), ValidationError> {
        let now = self.time_source.now();

        if let Some(retry_in_ms) = self.blocked_for(peer_id, now) {
            warn!(peer = %peer_id, retry_in_ms, "message from blocked peer");
            return Err(ValidationError::PeerBlocked {
                peer_id: peer_id.to_string(),
                retry_in_ms,
            });
        }

        let limit = self.config.limit_for(message_type);
        let window = duration_millis(limit.window);
        let counter = self
            .counters
            .entry((peer_id.clone(), message_type.to_string()))
            .or_insert(WindowCounter {
                count: 0,
                window_start: now,
            });

        if now - counter.window_start >= window {
            counter.count = 0;
            counter.window_start = now;
        }

        if counter.count >= limit.max {
            let count = counter.count;
            warn!(peer = %peer_id, message_type, count, max = limit.max, "rate limit reached");
            self.record_violation(peer_id, message_type, now);
            return Err(ValidationError::RateLimited {
                message_type: message_type.to_string(),
            });
        }

        counter.count += 1;
        Ok(())
    }

    fn record_violation(&mut self, peer_id: &PeerId, message_type: &str, now: Timestamp) {
        let window = duration_millis(self.config.violation_window);
        let entry = self.violations.entry(peer_id.clone()).or_default();
        entry.recent.push((now, message_type.to_string()));
        entry.recent.retain(|(at, _)| now - *at < window);

        if entry.recent.len() >= self.config.max_violations {
            let until = now + self.config.block_duration;
            error!(peer = %peer_id, until = %until, "peer blocked for spam");
            entry.recent.clear();
            entry.blocked_until = Some(until);
        }
    }

    /// Remaining block time, lifting expired blocks
    fn blocked_for(&mut self, peer_id: &PeerId, now: Timestamp) -> Option<u64> {
        let entry = self.violations.get(peer_id)?;
        match entry.blocked_until {
            Some(until) if now < until => Some(now.millis_until(until)),
            Some(_) => {
                self.violations.remove(peer_id);
                None
            }
            None => None,
        }
    }

    pub fn is_blocked(&mut self, peer_id: &PeerId) -> bool {
        let now = self.time_source.now();
        self.blocked_for(peer_id, now).is_some()
    }

    /// Forget every counter and violation of a peer
    pub fn reset_peer(&mut self, peer_id: &PeerId) {
        self.counters.retain(|(peer, _), _| peer != peer_id);
        self.violations.remove(peer_id);
    }

    /// Drop stale counters and expired violations
    pub fn cleanup(&mut self) {
        let now = self.time_source.now();
        let max_age = duration_millis(self.config.violation_window);

        self.counters
            .retain(|_, counter| now - counter.window_start <= max_age);

        for entry in self.violations.values_mut() {
            entry.recent.retain(|(at, _)| now - *at < max_age);
            if entry.blocked_until.is_some_and(|until| now >= until) {
                entry.blocked_until = None;
            }
        }
        self.violations
            .retain(|_, entry| !entry.recent.is_empty() || entry.blocked_until.is_some());
    }

    /// Get current configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Get statistics about current usage
    pub fn stats(&self) -> RateLimitStats {
        let now = self.time_source.now();
        RateLimitStats {
            active_counters: self.counters.len(),
            blocked_peers: self
                .violations
                .values()
                .filter(|entry| entry.blocked_until.is_some_and(|until| now < until))
                .count(),
            total_violations: self.violations.values().map(|entry| entry.recent.len()).sum(),
        }
    }
}

impl<T: TimeSource> core::fmt::Debug for RateLimiter<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("counters", &self.counters.len())
            .field("violations", &self.violations.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Rate Limit Statistics
// ----------------------------------------------------------------------------

/// Statistics about current rate limiting state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStats {
    /// Live (peer, type) windows
    pub active_counters: usize,
    pub blocked_peers: usize,
    /// Violations not yet aged out
    pub total_violations: usize,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
