//! Sample session handlers
//!
//! [`RecordingHandler`] logs every capability call for assertions,
//! [`CounterHandler`] is a centralized shared counter, and [`ChatHandler`] is
//! an independent on-demand chat.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use pacpam_core::{HandlerResult, SessionController, SessionHandler};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Recording Handler
// ----------------------------------------------------------------------------

/// One observed handler capability call
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerCall {
    Start,
    End,
    LocalState,
    RemoteState(Value),
    Action(Value),
    Message(Value),
    PeerAbsent,
    PeerBack,
}

/// Shared view of the calls a [`RecordingHandler`] received
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<HandlerCall>>>,
    controller: Arc<Mutex<Option<SessionController>>>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<HandlerCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, matches: impl Fn(&HandlerCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|call| matches(call)).count()
    }

    pub fn messages(&self) -> Vec<Value> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                HandlerCall::Message(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn actions(&self) -> Vec<Value> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                HandlerCall::Action(action) => Some(action.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn remote_states(&self) -> Vec<Value> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                HandlerCall::RemoteState(state) => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    /// Controller handed over by the last `on_start`
    pub fn controller(&self) -> Option<SessionController> {
        lock(&self.controller).clone()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    fn push(&self, call: HandlerCall) {
        lock(&self.calls).push(call);
    }
}

/// Handler that records every call and serves a fixed local state
#[derive(Debug)]
pub struct RecordingHandler {
    log: CallLog,
    state: Option<Value>,
}

impl RecordingHandler {
    pub fn new() -> (Self, CallLog) {
        let log = CallLog::default();
        let handler = Self {
            log: log.clone(),
            state: None,
        };
        (handler, log)
    }

    /// Record into an existing log, e.g. one shared by a factory
    pub fn with_log(log: CallLog) -> Self {
        Self { log, state: None }
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }
}

impl SessionHandler for RecordingHandler {
    fn on_start(&mut self, controller: SessionController) -> HandlerResult {
        *lock(&self.log.controller) = Some(controller);
        self.log.push(HandlerCall::Start);
        Ok(())
    }

    fn on_end(&mut self) -> HandlerResult {
        self.log.push(HandlerCall::End);
        Ok(())
    }

    fn local_state(&mut self) -> HandlerResult<Option<Value>> {
        self.log.push(HandlerCall::LocalState);
        Ok(self.state.clone())
    }

    fn apply_remote_state(&mut self, state: Value) -> HandlerResult {
        self.log.push(HandlerCall::RemoteState(state));
        Ok(())
    }

    fn process_action(&mut self, action: Value) -> HandlerResult {
        self.log.push(HandlerCall::Action(action));
        Ok(())
    }

    fn on_message(&mut self, payload: Value) -> HandlerResult {
        self.log.push(HandlerCall::Message(payload));
        Ok(())
    }

    fn on_peer_absent(&mut self) -> HandlerResult {
        self.log.push(HandlerCall::PeerAbsent);
        Ok(())
    }

    fn on_peer_back(&mut self) -> HandlerResult {
        self.log.push(HandlerCall::PeerBack);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Counter Handler
// ----------------------------------------------------------------------------

/// Read side of a [`CounterHandler`]
#[derive(Debug, Clone, Default)]
pub struct CounterView {
    count: Arc<AtomicI64>,
}

impl CounterView {
    pub fn get(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Centralized counter: actions are `{"add": n}`, state is `{"count": n}`
///
/// The host applies actions authoritatively; the guest applies them as a
/// prediction and is corrected by the next `fullState`.
#[derive(Debug, Default)]
pub struct CounterHandler {
    view: CounterView,
}

impl CounterHandler {
    pub fn new() -> (Self, CounterView) {
        let handler = Self::default();
        let view = handler.view.clone();
        (handler, view)
    }
}

impl SessionHandler for CounterHandler {
    fn local_state(&mut self) -> HandlerResult<Option<Value>> {
        Ok(Some(json!({ "count": self.view.get() })))
    }

    fn apply_remote_state(&mut self, state: Value) -> HandlerResult {
        let count = state
            .get("count")
            .and_then(Value::as_i64)
            .ok_or("counter state without count")?;
        self.view.count.store(count, Ordering::SeqCst);
        Ok(())
    }

    fn process_action(&mut self, action: Value) -> HandlerResult {
        let add = action
            .get("add")
            .and_then(Value::as_i64)
            .ok_or("counter action without add")?;
        self.view.count.fetch_add(add, Ordering::SeqCst);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Chat Handler
// ----------------------------------------------------------------------------

/// What a chat session shows its user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Joined,
    Text(String),
    PeerAbsent,
    PeerBack,
    Left,
}

/// Everything a [`ChatHandler`] displayed
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    events: Arc<Mutex<Vec<ChatEvent>>>,
}

impl ChatLog {
    pub fn events(&self) -> Vec<ChatEvent> {
        lock(&self.events).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ChatEvent::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Independent chat with `{"text": ...}` messages
#[derive(Debug, Default)]
pub struct ChatHandler {
    log: ChatLog,
    sink: Option<mpsc::UnboundedSender<ChatEvent>>,
}

impl ChatHandler {
    pub fn new() -> (Self, ChatLog) {
        let handler = Self::default();
        let log = handler.log.clone();
        (handler, log)
    }

    /// Also forward every event to `sink`
    pub fn with_sink(mut self, sink: mpsc::UnboundedSender<ChatEvent>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn show(&mut self, event: ChatEvent) {
        lock(&self.log.events).push(event.clone());
        if let Some(sink) = &self.sink {
            if sink.send(event).is_err() {
                debug!("chat display gone");
                self.sink = None;
            }
        }
    }
}

impl SessionHandler for ChatHandler {
    fn on_start(&mut self, _controller: SessionController) -> HandlerResult {
        self.show(ChatEvent::Joined);
        Ok(())
    }

    fn on_end(&mut self) -> HandlerResult {
        self.show(ChatEvent::Left);
        Ok(())
    }

    fn on_message(&mut self, payload: Value) -> HandlerResult {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or("chat message without text")?;
        self.show(ChatEvent::Text(text.to_string()));
        Ok(())
    }

    fn on_peer_absent(&mut self) -> HandlerResult {
        self.show(ChatEvent::PeerAbsent);
        Ok(())
    }

    fn on_peer_back(&mut self) -> HandlerResult {
        self.show(ChatEvent::PeerBack);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_applies_actions_and_state() {
        let (mut counter, view) = CounterHandler::new();
        counter.process_action(json!({ "add": 3 })).unwrap();
        counter.process_action(json!({ "add": -1 })).unwrap();
        assert_eq!(view.get(), 2);
        assert_eq!(counter.local_state().unwrap(), Some(json!({ "count": 2 })));

        counter.apply_remote_state(json!({ "count": 10 })).unwrap();
        assert_eq!(view.get(), 10);
        assert!(counter.process_action(json!({ "sub": 1 })).is_err());
    }

    #[test]
    fn test_chat_rejects_messages_without_text() {
        let (mut chat, log) = ChatHandler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        chat = chat.with_sink(tx);

        chat.on_message(json!({ "text": "hi" })).unwrap();
        assert!(chat.on_message(json!({ "body": "hi" })).is_err());
        assert_eq!(log.texts(), vec!["hi".to_string()]);
        assert_eq!(rx.try_recv().unwrap(), ChatEvent::Text("hi".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_recording_log_filters() {
        let (mut handler, log) = RecordingHandler::new();
        handler.on_message(json!({ "n": 1 })).unwrap();
        handler.process_action(json!({ "a": 1 })).unwrap();
        handler.on_peer_absent().unwrap();
        assert_eq!(log.messages(), vec![json!({ "n": 1 })]);
        assert_eq!(log.actions(), vec![json!({ "a": 1 })]);
        assert_eq!(log.count(|call| *call == HandlerCall::PeerAbsent), 1);
        assert!(log.controller().is_none());
    }
}
