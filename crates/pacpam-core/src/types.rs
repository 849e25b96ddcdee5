//! Core types for the pacpam session layer
//!
//! This module defines the fundamental identifiers and time primitives used
//! throughout the protocol, using newtype patterns for validation and type safety.

use core::fmt;
use core::ops::{Add, Deref, Sub};
use core::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::PolicyError;

// ----------------------------------------------------------------------------
// Local Identity
// ----------------------------------------------------------------------------

/// Minimum length of a local identity
pub const IDENTITY_MIN_LEN: usize = 3;
/// Maximum length of a local identity
pub const IDENTITY_MAX_LEN: usize = 10;

/// Human-chosen identity of the local endpoint (alphanumeric plus `-`/`_`, 3–10 chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Validate and wrap an identity string
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        if is_valid_identity(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(PolicyError::InvalidIdentity {
                identity: raw.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check the identity charset and length rules
pub fn is_valid_identity(raw: &str) -> bool {
    let len = raw.chars().count();
    (IDENTITY_MIN_LEN..=IDENTITY_MAX_LEN).contains(&len)
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Transport-level identifier of an endpoint (`<namespace>-<identity>`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an already-qualified peer id
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Qualify an identity with the application namespace
    pub fn namespaced(namespace: &str, identity: &str) -> Self {
        if namespace.is_empty() {
            Self(identity.to_string())
        } else {
            Self(format!("{namespace}-{identity}"))
        }
    }

    /// Strip the namespace prefix, if present
    pub fn identity_in<'a>(&'a self, namespace: &str) -> &'a str {
        self.0
            .strip_prefix(namespace)
            .and_then(|rest| rest.strip_prefix('-'))
            .unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for PeerId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ----------------------------------------------------------------------------
// Session Identifier
// ----------------------------------------------------------------------------

/// Caller-chosen key of a multiplexed session
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration_millis(other)))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration_millis(duration))
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds remaining until `deadline` (zero when already reached)
    pub fn millis_until(&self, deadline: Timestamp) -> u64 {
        deadline.0.saturating_sub(self.0)
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of the current time for components that own a clock
///
/// Individual state machines never read a clock themselves; they receive
/// `now` from the facade that owns the time source.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced clock shared between test participants
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, to: Timestamp) {
        self.millis.store(to.as_millis(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rules() {
        assert!(Identity::parse("alice").is_ok());
        assert!(Identity::parse("a_b-9").is_ok());
        assert!(Identity::parse("ab").is_err());
        assert!(Identity::parse("abcdefghijk").is_err());
        assert!(Identity::parse("bad name").is_err());
        assert!(Identity::parse("héllo").is_err());
    }

    #[test]
    fn test_peer_id_namespace() {
        let peer = PeerId::namespaced("app", "bob");
        assert_eq!(peer.as_str(), "app-bob");
        assert_eq!(peer.identity_in("app"), "bob");
        assert_eq!(peer.identity_in("other"), "app-bob");
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::new(1_000);
        assert_eq!((t + 500).as_millis(), 1_500);
        assert_eq!((t + Duration::from_secs(2)).as_millis(), 3_000);
        assert_eq!(Timestamp::new(1_500) - t, 500);
        assert_eq!(t - Timestamp::new(1_500), 0);
        assert_eq!(t.millis_until(Timestamp::new(4_000)), 3_000);
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::new(Timestamp::new(10));
        let shared = clock.clone();
        clock.advance(Duration::from_millis(90));
        assert_eq!(shared.now(), Timestamp::new(100));
        shared.set(Timestamp::new(5));
        assert_eq!(clock.now(), Timestamp::new(5));
    }
}
