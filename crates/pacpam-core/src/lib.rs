//! pacpam Session Layer Core
//!
//! This crate provides the protocol core of the pacpam peer-to-peer session
//! layer: the reusable state engine, the circuit breaker, the transport
//! connection (L2), the sync layer projection (L3) with its presence guard,
//! and the multiplexed session protocol. It performs no I/O; drivers feed it
//! transport events and a clock, and execute the effects it emits.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod engine;
pub mod errors;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod security;
pub mod session;
pub mod sync_layer;
pub mod timers;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{AppEvent, Effect, Outbox, TransportCommand, TransportEvent};
pub use circuit_breaker::{BreakerInfo, BreakerMetrics, BreakerRegistry, BreakerState, BreakerStatus, CircuitBreaker};
pub use config::{
    CircuitBreakerConfig, ConnectionConfig, PeerConfig, PresenceConfig, RateLimitConfig, RuntimeConfig, ValidationLimits,
    WindowLimit,
};
pub use connection::{AuthFailure, Connection, ConnectionState, DisconnectCause};
pub use engine::{Definition, Hooks, Machine, StateEngine, TransitionDef, TransitionRecord};
pub use errors::{
    ConfigError, PacpamError, PolicyError, ReconnectRejection, Result, SessionError, TransportError,
    ValidationError,
};
pub use peer::Peer;
pub use presence::{PresenceGuard, PresenceState};
pub use protocol::{hash_secret, AuthMessage, ControlMessage, Credentials, Frame, SessionMode};
pub use security::{sanitize_string, sanitize_value, MessageValidator, RateLimiter};
pub use session::{
    HandlerError, HandlerMethod, HandlerResult, SessionConfig, SessionController, SessionFactory,
    SessionHandler, SessionRegistry, SessionSnapshot, SessionState,
};
pub use sync_layer::{SyncLayer, SyncState};
pub use types::{Identity, ManualTimeSource, PeerId, SessionId, SystemTimeSource, TimeSource, Timestamp};
