//! Centralized Configuration Management
//!
//! Every tunable of the session layer lives here with its documented default.
//! Durations serialize as integer milliseconds so configuration files stay readable.

use std::collections::BTreeMap;
use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, PacpamError, Result};

// ----------------------------------------------------------------------------
// Duration Serialization
// ----------------------------------------------------------------------------

pub(crate) mod duration_ms {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::types::duration_millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ----------------------------------------------------------------------------
// Circuit Breaker Configuration
// ----------------------------------------------------------------------------

/// Configuration for per-peer circuit breakers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub max_failures: u32,
    /// Time spent OPEN before a trial is allowed
    #[serde(with = "duration_ms")]
    pub reset_timeout: Duration,
    /// Dials admitted while HALF_OPEN
    pub half_open_attempts: u32,
    /// Rolling window of call history kept for reporting
    #[serde(with = "duration_ms")]
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_attempts: 1,
            monitoring_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Short timeouts for tests
    pub fn testing() -> Self {
        Self {
            max_failures: 2,
            reset_timeout: Duration::from_millis(500),
            half_open_attempts: 1,
            monitoring_window: Duration::from_secs(5),
        }
    }

    /// Open quickly and stay open longer
    pub fn strict() -> Self {
        Self {
            max_failures: 1,
            reset_timeout: Duration::from_secs(60),
            half_open_attempts: 1,
            monitoring_window: Duration::from_secs(120),
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Configuration for the transport-level connection machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Application namespace prefixed to every peer id
    pub namespace: String,
    /// Dial attempts that do not open within this window time out
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Authentication handshake deadline
    #[serde(with = "duration_ms")]
    pub auth_timeout: Duration,
    /// Keepalive ping interval while connected
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    /// Silence after the last pong that drops the link
    #[serde(with = "duration_ms")]
    pub pong_timeout: Duration,
    /// Delay before retrying a lost signaling channel while connected
    #[serde(with = "duration_ms")]
    pub signaling_retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            namespace: "pacpam".to_string(),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(3),
            pong_timeout: Duration::from_secs(10),
            signaling_retry_delay: Duration::from_secs(3),
        }
    }
}

impl ConnectionConfig {
    /// Short timeouts for tests
    pub fn testing() -> Self {
        Self {
            namespace: "test".to_string(),
            connect_timeout: Duration::from_millis(200),
            auth_timeout: Duration::from_millis(100),
            ping_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_millis(200),
            signaling_retry_delay: Duration::from_millis(50),
        }
    }
}

// ----------------------------------------------------------------------------
// Presence Configuration
// ----------------------------------------------------------------------------

/// Configuration for the presence guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Silence after which the peer is presumed absent
    #[serde(with = "duration_ms")]
    pub silence_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(5),
        }
    }
}

impl PresenceConfig {
    pub fn testing() -> Self {
        Self {
            silence_timeout: Duration::from_millis(150),
        }
    }
}

// ----------------------------------------------------------------------------
// Rate Limiting Configuration
// ----------------------------------------------------------------------------

/// Fixed-window allowance for one message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    /// Messages allowed per window
    pub max: u32,
    /// Window length
    #[serde(with = "duration_ms")]
    pub window: Duration,
}

impl WindowLimit {
    pub const fn new(max: u32, window_ms: u64) -> Self {
        Self {
            max,
            window: Duration::from_millis(window_ms),
        }
    }
}

/// Configuration for inbound rate limiting keyed by (peer, message type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per message type limits
    pub limits: BTreeMap<String, WindowLimit>,
    /// Limit applied to types without an entry
    pub default_limit: WindowLimit,
    /// Violations tolerated inside `violation_window` before blocking
    pub max_violations: usize,
    #[serde(with = "duration_ms")]
    pub violation_window: Duration,
    /// How long a peer stays blocked
    #[serde(with = "duration_ms")]
    pub block_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let limits = [
            ("localState", WindowLimit::new(35, 1_000)),
            ("fullState", WindowLimit::new(35, 1_000)),
            ("action", WindowLimit::new(10, 1_000)),
            ("message", WindowLimit::new(20, 1_000)),
            ("_ctrl", WindowLimit::new(20, 1_000)),
            ("auth", WindowLimit::new(5, 10_000)),
            ("ping", WindowLimit::new(2, 3_000)),
            ("pong", WindowLimit::new(2, 3_000)),
        ]
        .into_iter()
        .map(|(name, limit)| (name.to_string(), limit))
        .collect();

        Self {
            limits,
            default_limit: WindowLimit::new(10, 1_000),
            max_violations: 10,
            violation_window: Duration::from_secs(60),
            block_duration: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Large allowances for tests that push many frames
    pub fn permissive() -> Self {
        let mut config = Self::default();
        for limit in config.limits.values_mut() {
            limit.max = 10_000;
        }
        config.default_limit.max = 10_000;
        config
    }

    /// Limit for a message type, falling back to the default
    pub fn limit_for(&self, message_type: &str) -> WindowLimit {
        self.limits
            .get(message_type)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

// ----------------------------------------------------------------------------
// Validation Limits
// ----------------------------------------------------------------------------

/// Structural ceilings applied to every inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    /// Serialized size ceiling in bytes
    pub max_message_size: usize,
    pub max_string_length: usize,
    pub max_array_length: usize,
    pub max_object_depth: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_message_size: 50_000,
            max_string_length: 1_000,
            max_array_length: 1_000,
            max_object_depth: 10,
        }
    }
}

// ----------------------------------------------------------------------------
// Peer Configuration
// ----------------------------------------------------------------------------

/// Aggregated configuration for one local endpoint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub connection: ConnectionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub presence: PresenceConfig,
    pub rate_limit: RateLimitConfig,
    pub validation: ValidationLimits,
}

impl PeerConfig {
    /// Short timeouts across the board
    pub fn testing() -> Self {
        Self {
            connection: ConnectionConfig::testing(),
            circuit_breaker: CircuitBreakerConfig::testing(),
            presence: PresenceConfig::testing(),
            rate_limit: RateLimitConfig::permissive(),
            validation: ValidationLimits::default(),
        }
    }

    /// Reject configurations the machines cannot run with
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("connection.connect_timeout", self.connection.connect_timeout),
            ("connection.auth_timeout", self.connection.auth_timeout),
            ("connection.ping_interval", self.connection.ping_interval),
            ("connection.pong_timeout", self.connection.pong_timeout),
            ("presence.silence_timeout", self.presence.silence_timeout),
        ];
        for (field, value) in nonzero {
            if value.is_zero() {
                return Err(PacpamError::config_error(field, "must be greater than zero"));
            }
        }
        if self.circuit_breaker.max_failures == 0 {
            return Err(ConfigError::InvalidValue {
                field: "circuit_breaker.max_failures",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.connection.pong_timeout <= self.connection.ping_interval {
            return Err(PacpamError::config_error(
                "connection.pong_timeout",
                "must exceed ping_interval",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Runtime Configuration
// ----------------------------------------------------------------------------

/// Channel sizing for the async driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pending commands from handles before senders wait
    pub command_buffer: usize,
    /// Events a lagging subscriber may fall behind by
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_buffer == 0 {
            return Err(PacpamError::config_error("runtime.command_buffer", "must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(PacpamError::config_error("runtime.event_buffer", "must be at least 1"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
