//! Inbound gate
//!
//! Every data message passes schema validation and the per-peer rate limiter
//! before it is decoded into a frame. Display names carried by auth frames are
//! sanitized; session payloads are handed to the application unchanged.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use pacpam_core::security::{sanitize_string, MessageSchema, MessageValidator, RateLimitStats, RateLimiter};
use pacpam_core::{Frame, PeerConfig, PeerId, TimeSource, ValidationError};

/// Rate-limit key used before the remote peer is known
const UNKNOWN_PEER: &str = "unknown";

/// Validator, rate limiter and decoder in front of the core
pub struct InboundGate {
    validator: MessageValidator,
    limiter: RateLimiter<Arc<dyn TimeSource>>,
}

impl InboundGate {
    pub fn new(config: &PeerConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            validator: MessageValidator::new(config.validation.clone()),
            limiter: RateLimiter::with_config(config.rate_limit.clone(), clock),
        }
    }

    pub fn register_schema(&mut self, message_type: &str, schema: MessageSchema) {
        self.validator.register_schema(message_type, schema);
    }

    /// Validate, rate-limit and decode one raw message from `peer`
    pub fn admit(&mut self, peer: Option<&PeerId>, raw: Value) -> Result<Frame, ValidationError> {
        let message_type = self.validator.validate(&raw)?.to_string();

        let unknown;
        let key = match peer {
            Some(peer) => peer,
            None => {
                unknown = PeerId::new(UNKNOWN_PEER);
                &unknown
            }
        };
        self.limiter.check(key, &message_type)?;

        let mut frame = Frame::from_value(raw).map_err(|e| ValidationError::Malformed {
            reason: e.to_string(),
        })?;
        if let Frame::Auth(message) = &mut frame {
            let max = self.validator.limits().max_string_length;
            message.name = sanitize_string(&message.name, max);
        }
        debug!(peer = %key, frame = frame.type_name(), "frame admitted");
        Ok(frame)
    }

    /// Forget the counters of a peer whose link left CONNECTED
    pub fn reset_peer(&mut self, peer: &PeerId) {
        self.limiter.reset_peer(peer);
    }

    pub fn is_blocked(&mut self, peer: &PeerId) -> bool {
        self.limiter.is_blocked(peer)
    }

    /// Drop stale rate-limit state
    pub fn cleanup(&mut self) {
        self.limiter.cleanup();
        let stats = self.limiter.stats();
        if stats.blocked_peers > 0 {
            warn!(blocked = stats.blocked_peers, "peers still blocked after cleanup");
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        self.limiter.stats()
    }
}

impl std::fmt::Debug for InboundGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGate")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
