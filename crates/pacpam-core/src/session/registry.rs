//! Session registry
//!
//! Multiplexes application sessions over the single authenticated link.
//!
//! Handshake: the creating side moves its session to CONNECTING and sends
//! `sessionCreate`; the other side builds a handler through its factory,
//! replies `sessionReady` and activates at once. The creator activates when
//! `sessionReady` arrives. Activation hands the handler its controller, calls
//! `on_start` and starts the periodic loop when `fps > 0`.
//!
//! Centralized sessions are authoritative on the connection initiator (the
//! host), whichever side created them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::controller::{
    check_action, check_broadcast, check_message, check_set_fps, lock, next_instance, ControlQueue,
    SessionCommand, SessionController, SessionOp, SessionOrigin, SessionSnapshot, SharedSnapshot,
};
use super::handler::{invoke, HandlerMethod, SessionFactory, SessionHandler};
use super::lifecycle::{SessionEvent, SessionMachine, SessionState};
use crate::channel::{AppEvent, Outbox};
use crate::engine::{Hooks, StateEngine, TransitionRecord};
use crate::errors::SessionError;
use crate::protocol::{ControlFrame, ControlMessage, Frame, SessionMode};
use crate::sync_layer::SyncSignal;
use crate::types::{SessionId, Timestamp};

/// Mode and update rate requested at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mode: SessionMode,
    /// 0 = on demand only
    #[serde(default)]
    pub fps: u32,
}

impl SessionConfig {
    pub fn centralized(fps: u32) -> Self {
        Self {
            mode: SessionMode::Centralized,
            fps,
        }
    }

    pub fn independent(fps: u32) -> Self {
        Self {
            mode: SessionMode::Independent,
            fps,
        }
    }
}

fn tick_interval(fps: u32) -> u64 {
    (1_000 / u64::from(fps.max(1))).max(1)
}

// ----------------------------------------------------------------------------
// Session Entry
// ----------------------------------------------------------------------------

struct SessionHooks<'a> {
    id: &'a SessionId,
    out: &'a mut Outbox,
}

impl Hooks<SessionMachine> for SessionHooks<'_> {
    fn on_transition(&mut self, record: &TransitionRecord<SessionMachine>) {
        self.out.event(AppEvent::SessionStateChanged {
            id: self.id.clone(),
            state: record.to,
        });
    }
}

struct SessionEntry {
    id: SessionId,
    mode: SessionMode,
    fps: u32,
    origin: SessionOrigin,
    is_host: bool,
    engine: StateEngine<SessionMachine>,
    handler: Box<dyn SessionHandler>,
    shared: SharedSnapshot,
    /// Token of the current activation; commands from older controllers are stale
    instance: u64,
    next_tick: Option<Timestamp>,
}

impl SessionEntry {
    fn new(
        id: SessionId,
        config: SessionConfig,
        origin: SessionOrigin,
        is_host: bool,
        handler: Box<dyn SessionHandler>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(SessionSnapshot {
            id: id.clone(),
            mode: config.mode,
            fps: config.fps,
            state: SessionState::Idle,
            origin,
            is_host,
        }));
        Self {
            id,
            mode: config.mode,
            fps: config.fps,
            origin,
            is_host,
            engine: StateEngine::new(),
            handler,
            shared,
            instance: 0,
            next_tick: None,
        }
    }

    fn state(&self) -> SessionState {
        self.engine.state()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            mode: self.mode,
            fps: self.fps,
            state: self.state(),
            origin: self.origin,
            is_host: self.is_host,
        }
    }

    fn publish(&self) {
        *lock(&self.shared) = self.snapshot();
    }

    fn send(&mut self, event: SessionEvent, out: &mut Outbox) -> bool {
        let mut hooks = SessionHooks { id: &self.id, out };
        let moved = self.engine.send(event, &mut hooks);
        if moved {
            self.publish();
        }
        moved
    }

    /// Whether this side runs the periodic loop
    fn owns_loop(&self) -> bool {
        self.fps > 0 && (self.mode == SessionMode::Independent || self.is_host)
    }

    fn rearm_loop(&mut self, now: Timestamp) {
        self.next_tick = if self.owns_loop() && self.state() == SessionState::Connected {
            Some(now + tick_interval(self.fps))
        } else {
            None
        };
    }

    /// The state frame this side may push, if any
    fn state_frame(&self, state: Value) -> Option<Frame> {
        match self.mode {
            SessionMode::Centralized if self.is_host => Some(Frame::FullState {
                session: self.id.clone(),
                state,
            }),
            SessionMode::Centralized => None,
            SessionMode::Independent => Some(Frame::LocalState {
                session: self.id.clone(),
                state,
            }),
        }
    }

    /// Ask the handler for its state and push it
    fn push_state(&mut self, out: &mut Outbox) {
        let local = invoke(&self.id, HandlerMethod::GetLocalState, out, || {
            self.handler.local_state()
        });
        if let Some(Some(state)) = local {
            if let Some(frame) = self.state_frame(state) {
                out.send_frame(frame);
            }
        }
    }

    fn initiate(&mut self, out: &mut Outbox) {
        if self.send(SessionEvent::Create, out) {
            out.send_frame(Frame::control(ControlMessage::Create {
                id: self.id.clone(),
                mode: self.mode,
                fps: self.fps,
            }));
        }
    }

    fn activate(&mut self, queue: &Arc<ControlQueue>, now: Timestamp, out: &mut Outbox) {
        if !self.send(SessionEvent::Ready, out) {
            return;
        }
        info!(session = %self.id, mode = %self.mode, fps = self.fps, "session active");
        self.instance = next_instance();
        let controller = SessionController::new(self.shared.clone(), self.instance, queue.clone());
        invoke(&self.id, HandlerMethod::OnStart, out, || {
            self.handler.on_start(controller)
        });
        self.rearm_loop(now);
    }

    /// END and `on_end` for a live session; stops the loop in every case
    fn end(&mut self, out: &mut Outbox) {
        self.next_tick = None;
        if self.state().is_live() && self.send(SessionEvent::End, out) {
            invoke(&self.id, HandlerMethod::OnEnd, out, || self.handler.on_end());
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.state() == SessionState::Connected {
            Ok(())
        } else {
            Err(SessionError::NotActive {
                id: self.id.to_string(),
            })
        }
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Owner of every session multiplexed over one connection
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, SessionEntry>,
    factory: Option<Box<dyn SessionFactory>>,
    queue: Arc<ControlQueue>,
    connected: bool,
    is_host: bool,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            factory: None,
            queue: Arc::new(ControlQueue::new()),
            connected: false,
            is_host: false,
        }
    }

    /// Factory consulted when the remote side announces a session
    pub fn set_factory(&mut self, factory: impl SessionFactory + 'static) {
        self.factory = Some(Box::new(factory));
    }

    /// Queue shared by every controller of this registry
    pub fn queue(&self) -> &Arc<ControlQueue> {
        &self.queue
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.get(id).map(SessionEntry::state)
    }

    pub fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(SessionEntry::snapshot)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.values().map(SessionEntry::snapshot).collect()
    }

    /// Controller of an active session
    pub fn controller(&self, id: &SessionId) -> Option<SessionController> {
        let entry = self.sessions.get(id)?;
        (entry.state() == SessionState::Connected)
            .then(|| SessionController::new(entry.shared.clone(), entry.instance, self.queue.clone()))
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.sessions.values().filter_map(|entry| entry.next_tick).min()
    }

    fn entry_mut(&mut self, id: &SessionId) -> Result<&mut SessionEntry, SessionError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    // ------------------------------------------------------------------------
    // Application Surface
    // ------------------------------------------------------------------------

    /// Register a session; announced now if connected, otherwise on the next connect
    pub fn create_session(
        &mut self,
        id: SessionId,
        config: SessionConfig,
        handler: Box<dyn SessionHandler>,
        out: &mut Outbox,
    ) -> Result<(), SessionError> {
        if self.sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists { id: id.to_string() });
        }
        debug!(session = %id, mode = %config.mode, fps = config.fps, "session registered");
        let mut entry = SessionEntry::new(id.clone(), config, SessionOrigin::Local, self.is_host, handler);
        if self.connected {
            entry.initiate(out);
        }
        self.sessions.insert(id, entry);
        Ok(())
    }

    /// End and forget a session; returns false when it does not exist
    pub fn end_session(&mut self, id: &SessionId, out: &mut Outbox) -> bool {
        let Some(mut entry) = self.sessions.remove(id) else {
            return false;
        };
        if self.connected && entry.state().is_live() {
            out.send_frame(Frame::control(ControlMessage::End { id: id.clone() }));
        }
        entry.end(out);
        true
    }

    /// Guest, centralized mode: apply the action locally as prediction, then send it
    pub fn send_action(&mut self, id: &SessionId, action: Value, out: &mut Outbox) -> Result<(), SessionError> {
        let entry = self.entry_mut(id)?;
        entry.ensure_active()?;
        check_action(&entry.snapshot())?;
        let predicted = action.clone();
        invoke(&entry.id, HandlerMethod::ProcessAction, out, || {
            entry.handler.process_action(predicted)
        });
        out.send_frame(Frame::Action {
            session: id.clone(),
            action,
        });
        Ok(())
    }

    pub fn send_message(&mut self, id: &SessionId, payload: Value, out: &mut Outbox) -> Result<(), SessionError> {
        let entry = self.entry_mut(id)?;
        entry.ensure_active()?;
        check_message(&entry.snapshot())?;
        out.send_frame(Frame::Message {
            session: id.clone(),
            payload,
        });
        Ok(())
    }

    pub fn broadcast_state(&mut self, id: &SessionId, out: &mut Outbox) -> Result<(), SessionError> {
        let entry = self.entry_mut(id)?;
        entry.ensure_active()?;
        check_broadcast(&entry.snapshot())?;
        entry.push_state(out);
        Ok(())
    }

    /// Change the rate, restart the loop and announce with `sessionSetFps`
    pub fn set_fps(&mut self, id: &SessionId, fps: u32, now: Timestamp, out: &mut Outbox) -> Result<(), SessionError> {
        let connected = self.connected;
        let entry = self.entry_mut(id)?;
        check_set_fps(&entry.snapshot())?;
        entry.fps = fps;
        entry.publish();
        if connected && entry.state().is_live() {
            out.send_frame(Frame::control(ControlMessage::SetFps { id: id.clone(), fps }));
        }
        entry.rearm_loop(now);
        Ok(())
    }

    /// Apply every command queued by controllers
    pub fn drain_commands(&mut self, now: Timestamp, out: &mut Outbox) {
        while let Some(command) = self.queue.pop() {
            if let Err(error) = self.apply(command, now, out) {
                warn!(%error, "session command rejected");
                out.event(AppEvent::SessionCommandRejected { error });
            }
        }
    }

    fn apply(&mut self, command: SessionCommand, now: Timestamp, out: &mut Outbox) -> Result<(), SessionError> {
        let SessionCommand { id, instance, op } = command;
        if self.sessions.get(&id).is_some_and(|entry| entry.instance != instance) {
            debug!(session = %id, instance, "command from a previous activation");
            return Err(SessionError::NotActive { id: id.to_string() });
        }
        match op {
            SessionOp::SendAction(action) => self.send_action(&id, action, out),
            SessionOp::SendMessage(payload) => self.send_message(&id, payload, out),
            SessionOp::BroadcastState => self.broadcast_state(&id, out),
            SessionOp::SetFps(fps) => self.set_fps(&id, fps, now, out),
            SessionOp::End => {
                self.end_session(&id, out);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Sync Layer Signals
    // ------------------------------------------------------------------------

    pub fn on_signal(&mut self, signal: SyncSignal, is_host: bool, out: &mut Outbox) {
        match signal {
            SyncSignal::Connected => self.on_connected(is_host, out),
            SyncSignal::Disconnected => self.on_disconnected(out),
            SyncSignal::PeerAbsent => self.notify_presence(HandlerMethod::OnPeerAbsent, out),
            SyncSignal::PeerBack => self.notify_presence(HandlerMethod::OnPeerBack, out),
        }
    }

    /// Announce every locally created session
    fn on_connected(&mut self, is_host: bool, out: &mut Outbox) {
        self.connected = true;
        self.is_host = is_host;
        for entry in self.sessions.values_mut() {
            entry.is_host = is_host;
            entry.publish();
            if entry.state() == SessionState::Idle {
                entry.initiate(out);
            }
        }
    }

    /// End every live session; the host keeps its own for re-announcement, a guest keeps nothing
    fn on_disconnected(&mut self, out: &mut Outbox) {
        self.connected = false;
        for entry in self.sessions.values_mut() {
            entry.end(out);
        }
        let is_host = self.is_host;
        self.sessions
            .retain(|_, entry| is_host && entry.origin == SessionOrigin::Local);
        for entry in self.sessions.values_mut() {
            entry.engine = StateEngine::new();
            entry.publish();
        }
    }

    fn notify_presence(&mut self, method: HandlerMethod, out: &mut Outbox) {
        for entry in self.sessions.values_mut() {
            if entry.state() != SessionState::Connected {
                continue;
            }
            let handler = &mut entry.handler;
            invoke(&entry.id, method, out, || match method {
                HandlerMethod::OnPeerAbsent => handler.on_peer_absent(),
                _ => handler.on_peer_back(),
            });
        }
    }

    // ------------------------------------------------------------------------
    // Inbound Frames
    // ------------------------------------------------------------------------

    /// Route a session-layer frame received on the link
    pub fn handle_frame(&mut self, frame: Frame, now: Timestamp, out: &mut Outbox) {
        match frame {
            Frame::Control(control) => self.handle_control(control, now, out),
            Frame::FullState { .. } | Frame::LocalState { .. } | Frame::Action { .. } | Frame::Message { .. } => {
                self.handle_data(frame, out)
            }
            other => debug!(frame = other.type_name(), "not a session frame"),
        }
    }

    fn handle_control(&mut self, control: ControlFrame, now: Timestamp, out: &mut Outbox) {
        let message = match ControlMessage::try_from(control) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "invalid control frame");
                out.event(AppEvent::Error {
                    message: err.to_string(),
                });
                return;
            }
        };

        match message {
            ControlMessage::Create { id, mode, fps } => self.on_remote_create(id, mode, fps, now, out),
            ControlMessage::Ready { id } => {
                let queue = self.queue.clone();
                match self.sessions.get_mut(&id) {
                    Some(entry) if entry.state() == SessionState::Connecting => entry.activate(&queue, now, out),
                    _ => debug!(session = %id, "sessionReady ignored"),
                }
            }
            ControlMessage::SetFps { id, fps } => match self.sessions.get_mut(&id) {
                Some(entry) => {
                    debug!(session = %id, fps, "remote fps change");
                    entry.fps = fps;
                    entry.publish();
                    entry.rearm_loop(now);
                }
                None => debug!(session = %id, "sessionSetFps for unknown session"),
            },
            ControlMessage::End { id } => match self.sessions.remove(&id) {
                Some(mut entry) => {
                    info!(session = %id, "session ended by peer");
                    entry.end(out);
                }
                None => debug!(session = %id, "sessionEnd for unknown session"),
            },
        }
    }

    fn on_remote_create(&mut self, id: SessionId, mode: SessionMode, fps: u32, now: Timestamp, out: &mut Outbox) {
        let queue = self.queue.clone();
        let is_host = self.is_host;

        if let Some(entry) = self.sessions.get_mut(&id) {
            match entry.state() {
                // Both sides announced the same id: the guest yields and
                // answers the host's announcement with its own handler.
                SessionState::Connecting if !is_host => {
                    entry.mode = mode;
                    entry.fps = fps;
                    entry.publish();
                    out.send_frame(Frame::control(ControlMessage::Ready { id: id.clone() }));
                    entry.activate(&queue, now, out);
                }
                SessionState::Idle => {
                    entry.mode = mode;
                    entry.fps = fps;
                    entry.send(SessionEvent::Create, out);
                    out.send_frame(Frame::control(ControlMessage::Ready { id: id.clone() }));
                    entry.activate(&queue, now, out);
                }
                // Deliberate policy: a duplicate announcement never rebuilds
                // the handler of a registered session.
                _ => debug!(session = %id, "duplicate sessionCreate ignored"),
            }
            return;
        }

        let Some(factory) = self.factory.as_mut() else {
            warn!(session = %id, "no session factory, announcement declined");
            return;
        };
        let created = invoke(&id, HandlerMethod::Factory, out, || Ok(factory.create(&id, mode, fps)));
        let Some(Some(handler)) = created else {
            warn!(session = %id, "factory declined session");
            return;
        };

        let mut entry = SessionEntry::new(
            id.clone(),
            SessionConfig { mode, fps },
            SessionOrigin::Remote,
            is_host,
            handler,
        );
        entry.send(SessionEvent::Create, out);
        out.send_frame(Frame::control(ControlMessage::Ready { id: id.clone() }));
        entry.activate(&queue, now, out);
        self.sessions.insert(id, entry);
    }

    fn handle_data(&mut self, frame: Frame, out: &mut Outbox) {
        let Some(id) = frame.session().cloned() else {
            return;
        };
        let Some(entry) = self.sessions.get_mut(&id) else {
            debug!(session = %id, "data for unknown session dropped");
            return;
        };
        if entry.state() != SessionState::Connected {
            debug!(session = %id, state = ?entry.state(), "data for inactive session dropped");
            return;
        }

        match (frame, entry.mode) {
            (Frame::Action { action, .. }, SessionMode::Centralized) if entry.is_host => {
                invoke(&entry.id, HandlerMethod::ProcessAction, out, || {
                    entry.handler.process_action(action)
                });
                // authoritative state follows every applied action
                entry.push_state(out);
            }
            (Frame::FullState { state, .. }, SessionMode::Centralized) if !entry.is_host => {
                invoke(&entry.id, HandlerMethod::ApplyRemoteState, out, || {
                    entry.handler.apply_remote_state(state)
                });
            }
            (Frame::LocalState { state, .. }, SessionMode::Independent) => {
                invoke(&entry.id, HandlerMethod::ApplyRemoteState, out, || {
                    entry.handler.apply_remote_state(state)
                });
            }
            (Frame::Message { payload, .. }, SessionMode::Independent) => {
                invoke(&entry.id, HandlerMethod::OnMessage, out, || {
                    entry.handler.on_message(payload)
                });
            }
            (frame, mode) => {
                debug!(session = %id, frame = frame.type_name(), %mode, "frame not valid for session role");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Periodic Sync
    // ------------------------------------------------------------------------

    /// Run every due session loop tick
    pub fn poll_timers(&mut self, now: Timestamp, out: &mut Outbox) {
        for entry in self.sessions.values_mut() {
            let Some(due) = entry.next_tick else {
                continue;
            };
            if due > now {
                continue;
            }
            entry.push_state(out);
            entry.rearm_loop(now);
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .field("connected", &self.connected)
            .field("is_host", &self.is_host)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
