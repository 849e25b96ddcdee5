//! Error types for the pacpam session layer
//!
//! Faults never cross a state-machine boundary as errors; they are folded into
//! machine events. The types here are what callers of the application surface
//! receive when a request is rejected synchronously.

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Requests rejected by local policy before any state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid identity '{identity}': expected 3-10 characters of [A-Za-z0-9_-]")]
    InvalidIdentity { identity: String },
    #[error("Remote peer id must not be empty")]
    EmptyPeerId,
    #[error("Cannot {operation} while connection is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error("Circuit breaker open for peer {peer_id}, retry in {retry_in_ms}ms")]
    CircuitOpen { peer_id: String, retry_in_ms: u64 },
    #[error("No authenticated link to send on")]
    NotConnected,
}

/// Session registry and controller rejections
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {id}")]
    NotFound { id: String },
    #[error("Session already exists: {id}")]
    AlreadyExists { id: String },
    #[error("Session {id} is not connected")]
    NotActive { id: String },
    #[error("Operation {operation} is not available in {mode} mode (session {id})")]
    WrongMode {
        id: String,
        operation: &'static str,
        mode: &'static str,
    },
    #[error("Operation {operation} is reserved to the {required} side (session {id})")]
    WrongRole {
        id: String,
        operation: &'static str,
        required: &'static str,
    },
}

/// Inbound message rejections raised by the security boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Message too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Message is not valid JSON: {reason}")]
    Malformed { reason: String },
    #[error("Message is not a JSON object")]
    NotAnObject,
    #[error("Message has no type field")]
    MissingType,
    #[error("Unknown message type: {message_type}")]
    UnknownType { message_type: String },
    #[error("Missing required field: {field}")]
    MissingField { field: String },
    #[error("Field {field} has wrong type (expected {expected})")]
    WrongType { field: String, expected: &'static str },
    #[error("Field {field} exceeds maximum length {max}")]
    TooLong { field: String, max: usize },
    #[error("Field {field} is nested deeper than {max}")]
    TooDeep { field: String, max: usize },
    #[error("Field {field} does not match its pattern")]
    PatternMismatch { field: String },
    #[error("Field {field} is below minimum {min}")]
    BelowMinimum { field: String, min: i64 },
    #[error("Unexpected field: {field}")]
    UnexpectedField { field: String },
    #[error("Rate limit exceeded for {message_type}")]
    RateLimited { message_type: String },
    #[error("Peer {peer_id} is blocked for {retry_in_ms}ms")]
    PeerBlocked { peer_id: String, retry_in_ms: u64 },
}

/// Transport adapter failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send failed to peer {peer_id}: {reason}")]
    SendFailed { peer_id: String, reason: String },
    #[error("Transport is not available: {reason}")]
    Unavailable { reason: String },
    #[error("Transport channel closed")]
    ChannelClosed,
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
}

/// Invalid or unreadable configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Core error type for the pacpam session layer
#[derive(Debug, thiserror::Error)]
pub enum PacpamError {
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Reconnect rejected: {0}")]
    Reconnect(#[from] ReconnectRejection),

    /// Channel communication error between runtime tasks
    #[error("Channel error: {message}")]
    Channel { message: String },
}

// ----------------------------------------------------------------------------
// Reconnect Rejections
// ----------------------------------------------------------------------------

/// Reason a reconnect request was refused
///
/// Serialized with the reason names applications match on:
/// `not_disconnected`, `no_peer`, `transport_not_ready`, `circuit_breaker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ReconnectRejection {
    #[error("sync layer is not disconnected")]
    NotDisconnected,
    #[error("no previous peer to reconnect to")]
    NoPeer,
    #[error("transport is not ready for a new dial")]
    TransportNotReady,
    #[error("circuit breaker open, retry in {retry_in_ms}ms")]
    CircuitBreaker { retry_in_ms: u64 },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl PacpamError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        PacpamError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error for a field
    pub fn config_error<T: Into<String>>(field: &'static str, reason: T) -> Self {
        PacpamError::Config(ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        })
    }

    /// Create a session not found error
    pub fn session_not_found<S: Into<String>>(id: S) -> Self {
        PacpamError::Session(SessionError::NotFound { id: id.into() })
    }

    /// Create a circuit open error
    pub fn circuit_open<P: Into<String>>(peer_id: P, retry_in_ms: u64) -> Self {
        PacpamError::Policy(PolicyError::CircuitOpen {
            peer_id: peer_id.into(),
            retry_in_ms,
        })
    }

    /// Whether the error is a synchronous policy rejection
    pub fn is_policy(&self) -> bool {
        matches!(self, PacpamError::Policy(_) | PacpamError::Reconnect(_))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, PacpamError>;
pub type PacpamResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
