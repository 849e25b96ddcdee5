//! In-memory transport for the async runtime
//!
//! A [`MemorySwitchboard`] plays signaling and carries data links between
//! [`MemoryTransport`]s in the same process. Frames are serialized to JSON on
//! send so the receiving runtime sees untrusted data, exactly as it would from
//! a real data channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use pacpam_core::{PeerId, TransportCommand, TransportError, TransportEvent};
use pacpam_runtime::{RawTransportEvent, Transport};

type EventSender = mpsc::UnboundedSender<RawTransportEvent>;

#[derive(Default)]
struct Board {
    endpoints: HashMap<PeerId, EventSender>,
    links: HashMap<PeerId, PeerId>,
    unreachable: HashSet<PeerId>,
    silent: HashSet<PeerId>,
}

impl Board {
    fn notify(&self, peer: &PeerId, event: RawTransportEvent) {
        if let Some(endpoint) = self.endpoints.get(peer) {
            // a receiver that went away has nothing left to learn
            let _ = endpoint.send(event);
        }
    }

    fn unlink(&mut self, peer: &PeerId) -> Option<PeerId> {
        let other = self.links.remove(peer)?;
        self.links.remove(&other);
        Some(other)
    }
}

// ----------------------------------------------------------------------------
// Switchboard
// ----------------------------------------------------------------------------

/// Shared signaling and link fabric
#[derive(Clone, Default)]
pub struct MemorySwitchboard {
    board: Arc<Mutex<Board>>,
}

impl MemorySwitchboard {
    pub fn new() -> Self {
        Self::default()
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A fresh endpoint attached to this switchboard
    pub fn transport(&self) -> MemoryTransport {
        let (events, inbox) = mpsc::unbounded_channel();
        MemoryTransport {
            switchboard: self.clone(),
            local_id: None,
            events,
            inbox,
        }
    }

    /// Dials to `peer` report `PeerUnavailable`
    pub fn set_unreachable(&self, peer: &PeerId, unreachable: bool) {
        let mut board = self.board();
        if unreachable {
            board.unreachable.insert(peer.clone());
        } else {
            board.unreachable.remove(peer);
        }
    }

    /// Drop every frame `peer` sends
    pub fn silence(&self, peer: &PeerId, silent: bool) {
        let mut board = self.board();
        if silent {
            board.silent.insert(peer.clone());
        } else {
            board.silent.remove(peer);
        }
    }

    /// Break `peer`'s link with an error on both ends
    pub fn sever(&self, peer: &PeerId) -> bool {
        let mut board = self.board();
        let Some(other) = board.unlink(peer) else {
            return false;
        };
        debug!(peer = %peer, other = %other, "severing link");
        for side in [peer, &other] {
            board.notify(
                side,
                TransportEvent::LinkError {
                    reason: "link severed".to_string(),
                }
                .into(),
            );
        }
        true
    }

    pub fn is_registered(&self, peer: &PeerId) -> bool {
        self.board().endpoints.contains_key(peer)
    }

    pub fn is_linked(&self, peer: &PeerId) -> bool {
        self.board().links.contains_key(peer)
    }
}

impl std::fmt::Debug for MemorySwitchboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let board = self.board();
        f.debug_struct("MemorySwitchboard")
            .field("endpoints", &board.endpoints.len())
            .field("links", &(board.links.len() / 2))
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// One endpoint on a [`MemorySwitchboard`]
pub struct MemoryTransport {
    switchboard: MemorySwitchboard,
    local_id: Option<PeerId>,
    events: EventSender,
    inbox: mpsc::UnboundedReceiver<RawTransportEvent>,
}

impl MemoryTransport {
    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    fn emit(&self, event: TransportEvent) {
        // the receiving half lives in self
        let _ = self.events.send(event.into());
    }

    fn open(&mut self, local_id: PeerId) {
        let mut board = self.switchboard.board();
        if board.endpoints.contains_key(&local_id) {
            drop(board);
            self.emit(TransportEvent::IdUnavailable);
            return;
        }
        board.endpoints.insert(local_id.clone(), self.events.clone());
        drop(board);
        self.local_id = Some(local_id);
        self.emit(TransportEvent::PeerOpened);
    }

    fn dial(&mut self, peer_id: PeerId) {
        let Some(local_id) = self.local_id.clone() else {
            self.emit(TransportEvent::PeerUnavailable { peer_id });
            return;
        };
        let mut board = self.switchboard.board();
        let reachable = board.endpoints.contains_key(&peer_id) && !board.unreachable.contains(&peer_id);
        if !reachable {
            drop(board);
            self.emit(TransportEvent::PeerUnavailable { peer_id });
            return;
        }
        if board.links.contains_key(&peer_id) {
            debug!(peer = %peer_id, "dial target busy");
            drop(board);
            self.emit(TransportEvent::LinkError {
                reason: "remote peer busy".to_string(),
            });
            return;
        }
        board.links.insert(local_id.clone(), peer_id.clone());
        board.links.insert(peer_id.clone(), local_id.clone());
        board.notify(&peer_id, TransportEvent::InboundConnection { peer_id: local_id }.into());
        board.notify(&peer_id, TransportEvent::LinkOpened.into());
        drop(board);
        self.emit(TransportEvent::LinkOpened);
    }

    fn send(&self, frame: pacpam_core::Frame) -> Result<(), TransportError> {
        let local_id = self.local_id.as_ref().ok_or(TransportError::ChannelClosed)?;
        let board = self.switchboard.board();
        let Some(remote) = board.links.get(local_id) else {
            return Err(TransportError::SendFailed {
                peer_id: local_id.to_string(),
                reason: "no open link".to_string(),
            });
        };
        if board.silent.contains(local_id) {
            trace!(peer = %local_id, frame = frame.type_name(), "silenced frame dropped");
            return Ok(());
        }
        let raw = frame.to_value().map_err(|e| TransportError::SendFailed {
            peer_id: remote.to_string(),
            reason: e.to_string(),
        })?;
        board.notify(remote, RawTransportEvent::Data(raw));
        Ok(())
    }

    fn close_link(&mut self) {
        let Some(local_id) = self.local_id.clone() else {
            return;
        };
        let mut board = self.switchboard.board();
        if let Some(other) = board.unlink(&local_id) {
            board.notify(&other, TransportEvent::LinkClosed.into());
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn execute(&mut self, command: TransportCommand) -> Result<(), TransportError> {
        match command {
            TransportCommand::Open { local_id } => self.open(local_id),
            TransportCommand::Dial { peer_id } => self.dial(peer_id),
            TransportCommand::Send { frame } => self.send(frame)?,
            TransportCommand::CloseLink => self.close_link(),
            TransportCommand::RefuseInbound { peer_id } => {
                let mut board = self.switchboard.board();
                if self.local_id.as_ref().is_some_and(|local| board.links.get(local) == Some(&peer_id)) {
                    board.unlink(&peer_id);
                }
                board.notify(
                    &peer_id,
                    TransportEvent::LinkError {
                        reason: "inbound link refused".to_string(),
                    }
                    .into(),
                );
            }
            TransportCommand::ReconnectSignaling => {
                if let Some(local_id) = self.local_id.clone() {
                    self.switchboard
                        .board()
                        .endpoints
                        .entry(local_id)
                        .or_insert_with(|| self.events.clone());
                }
            }
            TransportCommand::Destroy => {
                self.close_link();
                if let Some(local_id) = self.local_id.take() {
                    self.switchboard.board().endpoints.remove(&local_id);
                }
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<RawTransportEvent> {
        self.inbox.recv().await
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pacpam_core::Frame;

    fn lifecycle(event: TransportEvent) -> RawTransportEvent {
        event.into()
    }

    async fn next(transport: &mut MemoryTransport) -> RawTransportEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), transport.next_event())
            .await
            .expect("timed out")
            .expect("transport closed")
    }

    #[tokio::test]
    async fn test_open_dial_and_send() {
        let board = MemorySwitchboard::new();
        let mut alice = board.transport();
        let mut bob = board.transport();
        let alice_id = PeerId::new("test-alice");
        let bob_id = PeerId::new("test-bob");

        alice.execute(TransportCommand::Open { local_id: alice_id.clone() }).await.unwrap();
        bob.execute(TransportCommand::Open { local_id: bob_id.clone() }).await.unwrap();
        assert_eq!(next(&mut alice).await, lifecycle(TransportEvent::PeerOpened));
        assert_eq!(next(&mut bob).await, lifecycle(TransportEvent::PeerOpened));

        alice.execute(TransportCommand::Dial { peer_id: bob_id.clone() }).await.unwrap();
        assert_eq!(next(&mut alice).await, lifecycle(TransportEvent::LinkOpened));
        assert_eq!(
            next(&mut bob).await,
            lifecycle(TransportEvent::InboundConnection { peer_id: alice_id.clone() })
        );
        assert_eq!(next(&mut bob).await, lifecycle(TransportEvent::LinkOpened));
        assert_eq!(format!("{board:?}"), "MemorySwitchboard { endpoints: 2, links: 1, .. }");

        alice
            .execute(TransportCommand::Send { frame: Frame::Ping { timestamp: 9 } })
            .await
            .unwrap();
        assert_eq!(
            next(&mut bob).await,
            RawTransportEvent::Data(serde_json::json!({ "type": "ping", "timestamp": 9 }))
        );

        alice.execute(TransportCommand::CloseLink).await.unwrap();
        assert_eq!(next(&mut bob).await, lifecycle(TransportEvent::LinkClosed));
        assert!(!board.is_linked(&bob_id));
        assert_eq!(format!("{board:?}"), "MemorySwitchboard { endpoints: 2, links: 0, .. }");
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_ids() {
        let board = MemorySwitchboard::new();
        let mut first = board.transport();
        let mut second = board.transport();
        let id = PeerId::new("test-alice");

        first.execute(TransportCommand::Open { local_id: id.clone() }).await.unwrap();
        second.execute(TransportCommand::Open { local_id: id.clone() }).await.unwrap();
        assert_eq!(next(&mut second).await, lifecycle(TransportEvent::IdUnavailable));

        next(&mut first).await;
        first
            .execute(TransportCommand::Dial { peer_id: PeerId::new("test-nobody") })
            .await
            .unwrap();
        assert_eq!(
            next(&mut first).await,
            lifecycle(TransportEvent::PeerUnavailable { peer_id: PeerId::new("test-nobody") })
        );
        assert!(first
            .execute(TransportCommand::Send { frame: Frame::Ping { timestamp: 1 } })
            .await
            .is_err());
    }
}
