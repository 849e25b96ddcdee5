//! pacpam Protocol Module
//!
//! - `wire`: JSON frames exchanged over an established link
//! - `auth`: shared-secret handshake digests

pub mod auth;
pub mod wire;

pub use auth::{hash_secret, verify_digest, Credentials};
pub use wire::{AuthMessage, ControlError, ControlFrame, ControlMessage, Frame, SessionMode};
