//! Raw transport boundary
//!
//! Adapters (WebRTC data channels, in-memory switchboards) implement
//! [`Transport`]. They carry out [`TransportCommand`]s and report what happens
//! on signaling and on the data link. Data arrives as untrusted JSON and only
//! becomes a [`pacpam_core::Frame`] after passing the inbound gate.

use async_trait::async_trait;
use serde_json::Value;

use pacpam_core::{TransportCommand, TransportError, TransportEvent};

/// Event reported by a transport adapter
#[derive(Debug, Clone, PartialEq)]
pub enum RawTransportEvent {
    /// Signaling and link lifecycle; never `TransportEvent::Data`
    Lifecycle(TransportEvent),
    /// One message received on the data link
    Data(Value),
}

impl From<TransportEvent> for RawTransportEvent {
    fn from(event: TransportEvent) -> Self {
        RawTransportEvent::Lifecycle(event)
    }
}

#[async_trait]
pub trait Transport: Send {
    /// Carry out one command from the core
    async fn execute(&mut self, command: TransportCommand) -> Result<(), TransportError>;

    /// Next event from signaling or the link; `None` once the adapter is gone
    ///
    /// Must be cancel safe: the runtime polls it inside `tokio::select!`.
    async fn next_event(&mut self) -> Option<RawTransportEvent>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn execute(&mut self, command: TransportCommand) -> Result<(), TransportError> {
        (**self).execute(command).await
    }

    async fn next_event(&mut self) -> Option<RawTransportEvent> {
        (**self).next_event().await
    }
}
