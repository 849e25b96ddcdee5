//! pacpam Runtime
//!
//! Drives a [`pacpam_core::Peer`] on a tokio task:
//! - `transport`: the raw transport boundary implemented by adapters
//! - `gate`: validation, rate limiting and decoding of inbound data
//! - `runtime`: the single-threaded event loop
//! - `builder`: construction and the cloneable application handle

pub mod builder;
pub mod gate;
pub mod runtime;
pub mod transport;

pub use builder::{RuntimeBuilder, RuntimeHandle, RuntimeStatus};
pub use gate::InboundGate;
pub use runtime::PeerRuntime;
pub use transport::{RawTransportEvent, Transport};

// Re-export core types for convenience
pub use pacpam_core::{
    AppEvent, PacpamError, PeerConfig, PeerId, Result, RuntimeConfig, SessionConfig, SessionHandler, SessionId,
    SessionMode, TransportCommand, TransportEvent,
};
