//! Runtime Builder API
//!
//! Consumers (CLI, tests) configure an endpoint, hand over a transport and get
//! back a cloneable [`RuntimeHandle`] plus the loop's join handle.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use pacpam_core::security::MessageSchema;
use pacpam_core::session::SessionFactory;
use pacpam_core::{
    AppEvent, ConnectionState, Credentials, Peer, PeerConfig, PeerId, PresenceState, Result, RuntimeConfig, SessionConfig,
    SessionHandler, SessionId, SessionSnapshot, SyncState, SystemTimeSource, TimeSource,
};

use crate::gate::InboundGate;
use crate::runtime::{stopped, PeerRuntime, RuntimeCommand};
use crate::transport::Transport;

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for one peer endpoint runtime
pub struct RuntimeBuilder {
    config: PeerConfig,
    credentials: Credentials,
    clock: Arc<dyn TimeSource>,
    factory: Option<Box<dyn SessionFactory>>,
    schemas: Vec<(String, MessageSchema)>,
    runtime: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Create a new runtime builder authenticating with `credentials`
    pub fn new(credentials: Credentials) -> Self {
        Self {
            config: PeerConfig::default(),
            credentials,
            clock: Arc::new(SystemTimeSource::new()),
            factory: None,
            schemas: Vec::new(),
            runtime: RuntimeConfig::default(),
        }
    }

    /// Set the endpoint configuration
    pub fn with_config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Factory consulted when the remote side announces a session
    pub fn with_factory(mut self, factory: impl SessionFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Accept an application message type at the inbound gate
    pub fn register_schema(mut self, message_type: &str, schema: MessageSchema) -> Self {
        self.schemas.push((message_type.to_string(), schema));
        self
    }

    /// Set channel buffer sizes
    pub fn with_runtime_config(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Assemble the runtime without spawning it
    pub fn build<T: Transport>(self, transport: T) -> Result<(PeerRuntime<T>, RuntimeHandle)> {
        self.config.validate()?;
        self.runtime.validate()?;

        let mut gate = InboundGate::new(&self.config, self.clock.clone());
        for (message_type, schema) in self.schemas {
            gate.register_schema(&message_type, schema);
        }

        let mut peer = Peer::new(self.config, self.credentials, self.clock);
        if let Some(mut factory) = self.factory {
            peer.set_factory(move |id: &SessionId, mode: pacpam_core::SessionMode, fps: u32| {
                factory.create(id, mode, fps)
            });
        }

        let wake = Arc::new(Notify::new());
        let waker = wake.clone();
        peer.control_queue().set_waker(move || waker.notify_one());

        let (command_sender, command_receiver) = mpsc::channel(self.runtime.command_buffer);
        let (event_sender, _) = broadcast::channel(self.runtime.event_buffer);

        let handle = RuntimeHandle {
            commands: command_sender,
            events: event_sender.clone(),
        };
        let runtime = PeerRuntime::new(peer, transport, gate, command_receiver, event_sender, wake);
        Ok((runtime, handle))
    }

    /// Build and start the runtime on the current tokio runtime
    pub fn spawn<T: Transport + 'static>(self, transport: T) -> Result<(RuntimeHandle, JoinHandle<Result<()>>)> {
        let (runtime, handle) = self.build(transport)?;
        let task = tokio::spawn(runtime.run());
        info!("peer runtime spawned");
        Ok((handle, task))
    }
}

// ----------------------------------------------------------------------------
// Runtime Status
// ----------------------------------------------------------------------------

/// Point-in-time view of a running endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeStatus {
    pub connection: ConnectionState,
    pub sync: SyncState,
    pub presence: Option<PresenceState>,
    pub local_id: Option<PeerId>,
    pub remote: Option<PeerId>,
    pub is_host: bool,
    pub sessions: Vec<SessionSnapshot>,
}

impl RuntimeStatus {
    pub(crate) fn of(peer: &Peer) -> Self {
        Self {
            connection: peer.state(),
            sync: peer.sync_state(),
            presence: peer.presence(),
            local_id: peer.local_id().cloned(),
            remote: peer.remote().cloned(),
            is_host: peer.is_host(),
            sessions: peer.snapshots(),
        }
    }

    pub fn session(&self, id: &SessionId) -> Option<&SessionSnapshot> {
        self.sessions.iter().find(|snapshot| &snapshot.id == id)
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Cloneable application surface of a running endpoint
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<RuntimeCommand>,
    events: broadcast::Sender<AppEvent>,
}

impl RuntimeHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> RuntimeCommand) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands.send(make(reply)).await.map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())
    }

    /// Observe application events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    pub async fn init(&self, identity: &str) -> Result<PeerId> {
        let identity = identity.to_string();
        self.request(|reply| RuntimeCommand::Init { identity, reply })
            .await?
    }

    pub async fn connect_to(&self, identity: &str) -> Result<()> {
        let identity = identity.to_string();
        self.request(|reply| RuntimeCommand::ConnectTo { identity, reply })
            .await?
    }

    pub async fn disconnect(&self) -> Result<bool> {
        self.request(|reply| RuntimeCommand::Disconnect { reply }).await
    }

    pub async fn reconnect(&self) -> Result<PeerId> {
        Ok(self
            .request(|reply| RuntimeCommand::Reconnect { reply })
            .await??)
    }

    pub async fn create_session(
        &self,
        id: impl Into<SessionId>,
        config: SessionConfig,
        handler: Box<dyn SessionHandler>,
    ) -> Result<()> {
        let id = id.into();
        Ok(self
            .request(|reply| RuntimeCommand::CreateSession {
                id,
                config,
                handler,
                reply,
            })
            .await??)
    }

    pub async fn end_session(&self, id: impl Into<SessionId>) -> Result<bool> {
        let id = id.into();
        self.request(|reply| RuntimeCommand::EndSession { id, reply })
            .await
    }

    pub async fn send_action(&self, id: impl Into<SessionId>, action: Value) -> Result<()> {
        let id = id.into();
        Ok(self
            .request(|reply| RuntimeCommand::SendAction { id, action, reply })
            .await??)
    }

    pub async fn send_message(&self, id: impl Into<SessionId>, payload: Value) -> Result<()> {
        let id = id.into();
        Ok(self
            .request(|reply| RuntimeCommand::SendMessage { id, payload, reply })
            .await??)
    }

    pub async fn broadcast_state(&self, id: impl Into<SessionId>) -> Result<()> {
        let id = id.into();
        Ok(self
            .request(|reply| RuntimeCommand::BroadcastState { id, reply })
            .await??)
    }

    pub async fn set_fps(&self, id: impl Into<SessionId>, fps: u32) -> Result<()> {
        let id = id.into();
        Ok(self
            .request(|reply| RuntimeCommand::SetFps { id, fps, reply })
            .await??)
    }

    /// Replace the factory used for remotely announced sessions
    pub async fn set_factory(&self, factory: impl SessionFactory + 'static) -> Result<()> {
        self.commands
            .send(RuntimeCommand::SetFactory {
                factory: Box::new(factory),
            })
            .await
            .map_err(|_| stopped())
    }

    pub async fn status(&self) -> Result<RuntimeStatus> {
        self.request(|reply| RuntimeCommand::Status { reply }).await
    }

    /// Stop the loop; the endpoint disconnects before the task ends
    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(RuntimeCommand::Shutdown)
            .await
            .map_err(|_| stopped())
    }
}
