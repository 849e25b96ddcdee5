//! Security boundary for inbound traffic
//!
//! Raw messages pass schema validation and per-peer rate limiting before they
//! are decoded into frames; the core itself treats decoded frames as trusted.
//! - `validator`: per-type schemas and global size/depth ceilings
//! - `rate_limiter`: (peer, type) windows with escalation to a timed block
//! - `sanitize`: control and markup character stripping

pub mod rate_limiter;
pub mod sanitize;
pub mod validator;

pub use rate_limiter::{RateLimitStats, RateLimiter};
pub use sanitize::{sanitize_string, sanitize_value};
pub use validator::{FieldKind, FieldRule, MessageSchema, MessageValidator, Pattern, ROUTING_FIELDS};
