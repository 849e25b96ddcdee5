//! Session controller handed to handlers and the application
//!
//! Controllers never touch the registry directly. Each call checks what it can
//! locally (mode and role) and queues a [`SessionCommand`]; the owning peer
//! drains the queue on its single thread of control, so a handler may call
//! its controller from inside any capability without re-entering the registry.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lifecycle::SessionState;
use crate::errors::SessionError;
use crate::protocol::SessionMode;
use crate::types::SessionId;

/// Which side created a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// `create_session` on this side; the host retains it across disconnects
    Local,
    /// Mirrored from a remote `sessionCreate`; discarded on disconnect
    Remote,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub mode: SessionMode,
    pub fps: u32,
    pub state: SessionState,
    pub origin: SessionOrigin,
    /// Whether this side is the connection initiator
    pub is_host: bool,
}

pub(crate) type SharedSnapshot = Arc<Mutex<SessionSnapshot>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Command Queue
// ----------------------------------------------------------------------------

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Fresh token for one activation of a session
pub(crate) fn next_instance() -> u64 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// A controller call, addressed to the activation that issued it
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCommand {
    pub id: SessionId,
    pub instance: u64,
    pub op: SessionOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOp {
    SendAction(Value),
    SendMessage(Value),
    BroadcastState,
    SetFps(u32),
    End,
}

type Waker = Box<dyn Fn() + Send + Sync>;

/// Commands queued by controllers, drained by the owning peer
#[derive(Default)]
pub struct ControlQueue {
    commands: Mutex<VecDeque<SessionCommand>>,
    waker: Mutex<Option<Waker>>,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback run after every push, used by async drivers to schedule a drain
    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *lock(&self.waker) = Some(Box::new(waker));
    }

    pub fn push(&self, command: SessionCommand) {
        lock(&self.commands).push_back(command);
        if let Some(wake) = lock(&self.waker).as_ref() {
            wake();
        }
    }

    pub fn pop(&self) -> Option<SessionCommand> {
        lock(&self.commands).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.commands).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.commands).is_empty()
    }
}

impl fmt::Debug for ControlQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlQueue")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

/// Handle to one active session
#[derive(Clone)]
pub struct SessionController {
    snapshot: SharedSnapshot,
    instance: u64,
    queue: Arc<ControlQueue>,
}

impl SessionController {
    pub(crate) fn new(snapshot: SharedSnapshot, instance: u64, queue: Arc<ControlQueue>) -> Self {
        Self {
            snapshot,
            instance,
            queue,
        }
    }

    fn push(&self, id: SessionId, op: SessionOp) {
        self.queue.push(SessionCommand {
            id,
            instance: self.instance,
            op,
        });
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        lock(&self.snapshot).clone()
    }

    pub fn id(&self) -> SessionId {
        lock(&self.snapshot).id.clone()
    }

    pub fn mode(&self) -> SessionMode {
        lock(&self.snapshot).mode
    }

    pub fn fps(&self) -> u32 {
        lock(&self.snapshot).fps
    }

    pub fn state(&self) -> SessionState {
        lock(&self.snapshot).state
    }

    pub fn is_host(&self) -> bool {
        lock(&self.snapshot).is_host
    }

    /// Guest, centralized mode: predict locally then send to the host
    pub fn send_action(&self, action: Value) -> Result<(), SessionError> {
        let snapshot = self.snapshot();
        check_action(&snapshot)?;
        self.push(snapshot.id, SessionOp::SendAction(action));
        Ok(())
    }

    /// Independent mode free-form message
    pub fn send_message(&self, payload: Value) -> Result<(), SessionError> {
        let snapshot = self.snapshot();
        check_message(&snapshot)?;
        self.push(snapshot.id, SessionOp::SendMessage(payload));
        Ok(())
    }

    /// Push the handler's current state now
    pub fn broadcast_state(&self) -> Result<(), SessionError> {
        let snapshot = self.snapshot();
        check_broadcast(&snapshot)?;
        self.push(snapshot.id, SessionOp::BroadcastState);
        Ok(())
    }

    /// Change the sync rate; 0 stops the periodic loop
    pub fn set_fps(&self, fps: u32) -> Result<(), SessionError> {
        let snapshot = self.snapshot();
        check_set_fps(&snapshot)?;
        self.push(snapshot.id, SessionOp::SetFps(fps));
        Ok(())
    }

    pub fn end(&self) {
        self.push(self.id(), SessionOp::End);
    }
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("snapshot", &self.snapshot())
            .field("instance", &self.instance)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Mode and Role Rules
// ----------------------------------------------------------------------------

pub(crate) fn check_action(snapshot: &SessionSnapshot) -> Result<(), SessionError> {
    if snapshot.mode != SessionMode::Centralized {
        return Err(SessionError::WrongMode {
            id: snapshot.id.to_string(),
            operation: "send_action",
            mode: snapshot.mode.as_str(),
        });
    }
    if snapshot.is_host {
        return Err(SessionError::WrongRole {
            id: snapshot.id.to_string(),
            operation: "send_action",
            required: "guest",
        });
    }
    Ok(())
}

pub(crate) fn check_message(snapshot: &SessionSnapshot) -> Result<(), SessionError> {
    if snapshot.mode != SessionMode::Independent {
        return Err(SessionError::WrongMode {
            id: snapshot.id.to_string(),
            operation: "send_message",
            mode: snapshot.mode.as_str(),
        });
    }
    Ok(())
}

pub(crate) fn check_broadcast(snapshot: &SessionSnapshot) -> Result<(), SessionError> {
    if snapshot.mode == SessionMode::Centralized && !snapshot.is_host {
        return Err(SessionError::WrongRole {
            id: snapshot.id.to_string(),
            operation: "broadcast_state",
            required: "host",
        });
    }
    Ok(())
}

pub(crate) fn check_set_fps(snapshot: &SessionSnapshot) -> Result<(), SessionError> {
    if snapshot.mode == SessionMode::Centralized && !snapshot.is_host {
        return Err(SessionError::WrongRole {
            id: snapshot.id.to_string(),
            operation: "set_fps",
            required: "host",
        });
    }
    Ok(())
}
