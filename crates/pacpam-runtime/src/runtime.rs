//! Peer runtime event loop
//!
//! One task owns the [`Peer`] and is the only code that touches it. The loop
//! waits on four sources: application commands, transport events, the next
//! core deadline, and a wake signal raised whenever a session controller
//! queues a command. After each step it executes the effects the core
//! produced, in order.

use std::sync::Arc;
use std::time::Duration;

use futures::future::OptionFuture;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tracing::{debug, error, info, trace, warn};

use pacpam_core::session::SessionFactory;
use pacpam_core::{
    AppEvent, Effect, PacpamError, Peer, PeerId, ReconnectRejection, Result, SessionConfig,
    SessionError, SessionHandler, SessionId, SessionMode, TransportEvent,
};
use serde_json::Value;

use crate::builder::RuntimeStatus;
use crate::gate::InboundGate;
use crate::transport::{RawTransportEvent, Transport};

type Reply<T> = oneshot::Sender<T>;

/// Requests from [`crate::RuntimeHandle`] to the loop
pub(crate) enum RuntimeCommand {
    Init {
        identity: String,
        reply: Reply<Result<PeerId>>,
    },
    ConnectTo {
        identity: String,
        reply: Reply<Result<()>>,
    },
    Disconnect {
        reply: Reply<bool>,
    },
    Reconnect {
        reply: Reply<core::result::Result<PeerId, ReconnectRejection>>,
    },
    CreateSession {
        id: SessionId,
        config: SessionConfig,
        handler: Box<dyn SessionHandler>,
        reply: Reply<core::result::Result<(), SessionError>>,
    },
    EndSession {
        id: SessionId,
        reply: Reply<bool>,
    },
    SendAction {
        id: SessionId,
        action: Value,
        reply: Reply<core::result::Result<(), SessionError>>,
    },
    SendMessage {
        id: SessionId,
        payload: Value,
        reply: Reply<core::result::Result<(), SessionError>>,
    },
    BroadcastState {
        id: SessionId,
        reply: Reply<core::result::Result<(), SessionError>>,
    },
    SetFps {
        id: SessionId,
        fps: u32,
        reply: Reply<core::result::Result<(), SessionError>>,
    },
    SetFactory {
        factory: Box<dyn SessionFactory>,
    },
    Status {
        reply: Reply<RuntimeStatus>,
    },
    Shutdown,
}

/// Event loop owning one peer endpoint and its transport
pub struct PeerRuntime<T: Transport> {
    peer: Peer,
    transport: T,
    gate: InboundGate,
    commands: mpsc::Receiver<RuntimeCommand>,
    events: broadcast::Sender<AppEvent>,
    wake: Arc<Notify>,
}

impl<T: Transport> PeerRuntime<T> {
    pub(crate) fn new(
        peer: Peer,
        transport: T,
        gate: InboundGate,
        commands: mpsc::Receiver<RuntimeCommand>,
        events: broadcast::Sender<AppEvent>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            peer,
            transport,
            gate,
            commands,
            events,
            wake,
        }
    }

    /// Run until shutdown, the handle is dropped, or the transport goes away
    pub async fn run(mut self) -> Result<()> {
        info!("peer runtime starting");

        loop {
            self.flush().await;

            let wait: Option<Duration> = self
                .peer
                .next_deadline()
                .map(|deadline| Duration::from_millis(self.peer.now().millis_until(deadline)));
            let timer: OptionFuture<_> = wait.map(tokio::time::sleep).into();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RuntimeCommand::Shutdown) | None => {
                        info!("shutdown requested");
                        break;
                    }
                    Some(command) => self.apply(command),
                },

                event = self.transport.next_event() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        warn!("transport closed, stopping runtime");
                        break;
                    }
                },

                Some(()) = timer => {
                    trace!("timer due");
                    self.peer.tick();
                }

                _ = self.wake.notified() => {
                    self.peer.process_commands();
                }
            }
        }

        self.peer.disconnect();
        self.flush().await;
        info!("peer runtime stopped");
        Ok(())
    }

    fn apply(&mut self, command: RuntimeCommand) {
        let peer = &mut self.peer;
        // a closed reply channel means the caller stopped waiting
        match command {
            RuntimeCommand::Init { identity, reply } => {
                let _ = reply.send(peer.init(&identity));
            }
            RuntimeCommand::ConnectTo { identity, reply } => {
                let _ = reply.send(peer.connect_to(&identity));
            }
            RuntimeCommand::Disconnect { reply } => {
                let _ = reply.send(peer.disconnect());
            }
            RuntimeCommand::Reconnect { reply } => {
                let _ = reply.send(peer.reconnect());
            }
            RuntimeCommand::CreateSession {
                id,
                config,
                handler,
                reply,
            } => {
                let _ = reply.send(peer.create_session(id, config, handler));
            }
            RuntimeCommand::EndSession { id, reply } => {
                let _ = reply.send(peer.end_session(&id));
            }
            RuntimeCommand::SendAction { id, action, reply } => {
                let _ = reply.send(peer.send_action(&id, action));
            }
            RuntimeCommand::SendMessage { id, payload, reply } => {
                let _ = reply.send(peer.send_message(&id, payload));
            }
            RuntimeCommand::BroadcastState { id, reply } => {
                let _ = reply.send(peer.broadcast_state(&id));
            }
            RuntimeCommand::SetFps { id, fps, reply } => {
                let _ = reply.send(peer.set_fps(&id, fps));
            }
            RuntimeCommand::SetFactory { mut factory } => {
                peer.set_factory(move |id: &SessionId, mode: SessionMode, fps: u32| {
                    factory.create(id, mode, fps)
                });
            }
            RuntimeCommand::Status { reply } => {
                let _ = reply.send(RuntimeStatus::of(peer));
            }
            RuntimeCommand::Shutdown => {}
        }
    }

    fn on_transport_event(&mut self, event: RawTransportEvent) {
        match event {
            RawTransportEvent::Lifecycle(TransportEvent::Data(frame)) => {
                warn!(frame = frame.type_name(), "transport bypassed the inbound gate; dropping");
            }
            RawTransportEvent::Lifecycle(event) => {
                debug!(event = event.name(), "transport event");
                self.peer.handle_event(event);
            }
            RawTransportEvent::Data(raw) => {
                let remote = self.peer.remote().cloned();
                match self.gate.admit(remote.as_ref(), raw) {
                    Ok(frame) => self.peer.handle_event(TransportEvent::Data(frame)),
                    Err(rejection) => {
                        warn!(peer = ?remote, %rejection, "inbound message rejected");
                    }
                }
            }
        }
    }

    /// Execute transport commands and publish application events, in order
    async fn flush(&mut self) {
        while self.peer.has_effects() {
            for effect in self.peer.take_effects() {
                match effect {
                    Effect::Transport(command) => {
                        trace!(?command, "executing transport command");
                        if let Err(e) = self.transport.execute(command).await {
                            error!(error = %e, "transport command failed");
                            self.publish(AppEvent::Error {
                                message: e.to_string(),
                            });
                        }
                    }
                    Effect::App(event) => {
                        if let AppEvent::Disconnected {
                            peer_id: Some(remote),
                            ..
                        } = &event
                        {
                            self.gate.reset_peer(remote);
                        }
                        self.publish(event);
                    }
                }
            }
        }
    }

    fn publish(&self, event: AppEvent) {
        // no subscribers is not an error
        let _ = self.events.send(event);
    }
}

impl<T: Transport> std::fmt::Debug for PeerRuntime<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRuntime")
            .field("peer", &self.peer)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

pub(crate) fn stopped() -> PacpamError {
    PacpamError::channel_error("peer runtime is not running")
}
