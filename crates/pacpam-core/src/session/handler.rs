//! Application handler capability set
//!
//! Every capability has a no-op default, so a handler implements only what its
//! session mode uses. Failures are reported per session and never propagate
//! into the registry.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::controller::SessionController;
use crate::channel::{AppEvent, Outbox};
use crate::protocol::SessionMode;
use crate::types::SessionId;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult<T = ()> = Result<T, HandlerError>;

/// Application side of one multiplexed session
pub trait SessionHandler: Send {
    /// Session activated; the controller stays valid until `on_end`
    fn on_start(&mut self, controller: SessionController) -> HandlerResult {
        let _ = controller;
        Ok(())
    }

    fn on_end(&mut self) -> HandlerResult {
        Ok(())
    }

    /// State pushed by the periodic loop and by `broadcast_state`; `None` sends nothing
    fn local_state(&mut self) -> HandlerResult<Option<Value>> {
        Ok(None)
    }

    /// Authoritative (`fullState`) or peer (`localState`) state
    fn apply_remote_state(&mut self, state: Value) -> HandlerResult {
        let _ = state;
        Ok(())
    }

    /// Centralized mode: applied by the host, and by the guest as prediction
    fn process_action(&mut self, action: Value) -> HandlerResult {
        let _ = action;
        Ok(())
    }

    /// Independent mode free-form message
    fn on_message(&mut self, payload: Value) -> HandlerResult {
        let _ = payload;
        Ok(())
    }

    fn on_peer_absent(&mut self) -> HandlerResult {
        Ok(())
    }

    fn on_peer_back(&mut self) -> HandlerResult {
        Ok(())
    }
}

/// Builds handlers for sessions announced by the remote side
pub trait SessionFactory: Send {
    /// `None` declines the session
    fn create(&mut self, id: &SessionId, mode: SessionMode, fps: u32) -> Option<Box<dyn SessionHandler>>;
}

impl<F> SessionFactory for F
where
    F: FnMut(&SessionId, SessionMode, u32) -> Option<Box<dyn SessionHandler>> + Send,
{
    fn create(&mut self, id: &SessionId, mode: SessionMode, fps: u32) -> Option<Box<dyn SessionHandler>> {
        self(id, mode, fps)
    }
}

/// Capability named in handler error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerMethod {
    Factory,
    OnStart,
    OnEnd,
    GetLocalState,
    ApplyRemoteState,
    ProcessAction,
    OnMessage,
    OnPeerAbsent,
    OnPeerBack,
}

impl HandlerMethod {
    pub fn name(&self) -> &'static str {
        match self {
            HandlerMethod::Factory => "factory",
            HandlerMethod::OnStart => "onStart",
            HandlerMethod::OnEnd => "onEnd",
            HandlerMethod::GetLocalState => "getLocalState",
            HandlerMethod::ApplyRemoteState => "applyRemoteState",
            HandlerMethod::ProcessAction => "processAction",
            HandlerMethod::OnMessage => "onMessage",
            HandlerMethod::OnPeerAbsent => "onPeerAbsent",
            HandlerMethod::OnPeerBack => "onPeerBack",
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Run one handler capability, reporting errors and panics as `HandlerError`
pub(crate) fn invoke<T>(
    session: &SessionId,
    method: HandlerMethod,
    out: &mut Outbox,
    call: impl FnOnce() -> HandlerResult<T>,
) -> Option<T> {
    let message = match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(err)) => err.to_string(),
        Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
    };
    warn!(session = %session, method = method.name(), %message, "session handler failed");
    out.event(AppEvent::HandlerError {
        session: session.clone(),
        method,
        message,
    });
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Effect;

    #[test]
    fn test_invoke_reports_errors_and_panics() {
        let id = SessionId::from("chat");
        let mut out = Outbox::new();

        assert_eq!(invoke(&id, HandlerMethod::OnStart, &mut out, || Ok(7)), Some(7));
        assert!(out.is_empty());

        let failed: Option<()> = invoke(&id, HandlerMethod::OnMessage, &mut out, || Err("bad payload".into()));
        assert!(failed.is_none());

        let panicked: Option<()> = invoke(&id, HandlerMethod::ProcessAction, &mut out, || panic!("boom"));
        assert!(panicked.is_none());

        let reports: Vec<_> = out
            .take()
            .into_iter()
            .filter_map(|e| match e {
                Effect::App(AppEvent::HandlerError { method, message, .. }) => Some((method, message)),
                _ => None,
            })
            .collect();
        assert_eq!(
            reports,
            vec![
                (HandlerMethod::OnMessage, "bad payload".to_string()),
                (HandlerMethod::ProcessAction, "panic: boom".to_string()),
            ]
        );
    }
}
