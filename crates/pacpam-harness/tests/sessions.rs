//! Session protocol scenarios on the simulated network


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use pacpam_core::{
    AppEvent, ControlMessage, Frame, HandlerMethod, PeerConfig, SessionConfig, SessionHandler, SessionId,
    SessionMode, SessionState,
};
use pacpam_harness::{CallLog, ChatHandler, CounterHandler, HandlerCall, RecordingHandler};
use test_utils::{connected_pair, data_frames, recording_factory};

#[test]
fn test_on_demand_chat_delivers_once_without_periodic_traffic() {
    let mut net = connected_pair(PeerConfig::testing());
    let chat = SessionId::from("chat");

    let guest_log = CallLog::default();
    let created = Arc::new(AtomicUsize::new(0));
    net.peer_mut("bob")
        .unwrap()
        .set_factory(recording_factory(guest_log.clone(), created.clone()));

    let (host_handler, host_log) = RecordingHandler::new();
    net.peer_mut("alice")
        .unwrap()
        .create_session("chat", SessionConfig::independent(0), Box::new(host_handler))
        .unwrap();
    net.run();

    assert_eq!(net.peer("alice").unwrap().session_state(&chat), Some(SessionState::Connected));
    assert_eq!(net.peer("bob").unwrap().session_state(&chat), Some(SessionState::Connected));
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(guest_log.calls(), vec![HandlerCall::Start]);

    net.clear_sent();
    net.peer_mut("bob")
        .unwrap()
        .send_message(&chat, json!({ "text": "hi" }))
        .unwrap();
    net.advance(Duration::from_secs(1));

    assert_eq!(host_log.messages(), vec![json!({ "text": "hi" })]);
    assert_eq!(data_frames(&net, "bob", &chat).len(), 1);
    assert!(data_frames(&net, "alice", &chat).is_empty());
    assert_eq!(host_log.count(|call| *call == HandlerCall::LocalState), 0);
    assert_eq!(guest_log.count(|call| *call == HandlerCall::LocalState), 0);
}

#[test]
fn test_centralized_round_trip_with_prediction() {
    let mut net = connected_pair(PeerConfig::testing());
    let counter = SessionId::from("counter");

    let (guest_counter, guest_view) = CounterHandler::new();
    let mut pending = Some(guest_counter);
    net.peer_mut("bob")
        .unwrap()
        .set_factory(move |_id: &SessionId, _mode: SessionMode, _fps: u32| {
            pending
                .take()
                .map(|handler| Box::new(handler) as Box<dyn SessionHandler>)
        });

    // the host's authoritative state differs from the guest's prediction
    let (host_handler, host_log) = RecordingHandler::new();
    let host_handler = host_handler.with_state(json!({ "count": 5 }));
    net.peer_mut("alice")
        .unwrap()
        .create_session("counter", SessionConfig::centralized(0), Box::new(host_handler))
        .unwrap();
    net.run();
    assert_eq!(net.peer("bob").unwrap().session_state(&counter), Some(SessionState::Connected));

    net.clear_sent();
    net.peer_mut("bob")
        .unwrap()
        .send_action(&counter, json!({ "add": 2 }))
        .unwrap();

    // prediction applied before anything crossed the network
    assert_eq!(guest_view.get(), 2);
    assert!(host_log.actions().is_empty());

    net.run();
    assert_eq!(host_log.actions(), vec![json!({ "add": 2 })]);
    assert_eq!(
        data_frames(&net, "alice", &counter),
        vec![&Frame::FullState {
            session: counter.clone(),
            state: json!({ "count": 5 }),
        }]
    );
    assert_eq!(guest_view.get(), 5);
}

#[test]
fn test_role_checks_reject_misuse() {
    let mut net = connected_pair(PeerConfig::testing());
    let counter = SessionId::from("counter");
    let created = Arc::new(AtomicUsize::new(0));
    net.peer_mut("bob")
        .unwrap()
        .set_factory(recording_factory(CallLog::default(), created));
    let (host_handler, _host_log) = RecordingHandler::new();
    net.peer_mut("alice")
        .unwrap()
        .create_session("counter", SessionConfig::centralized(0), Box::new(host_handler))
        .unwrap();
    net.run();

    let alice = net.peer_mut("alice").unwrap();
    assert!(alice.send_action(&counter, json!({ "add": 1 })).is_err());
    assert!(alice.send_message(&counter, json!({ "text": "no" })).is_err());

    let bob = net.peer_mut("bob").unwrap();
    assert!(bob.broadcast_state(&counter).is_err());
    assert!(bob.set_fps(&counter, 30).is_err());
    assert!(bob.send_action(&SessionId::from("missing"), json!({})).is_err());
}

#[test]
fn test_set_fps_restarts_the_host_loop() {
    let mut net = connected_pair(PeerConfig::testing());
    let counter = SessionId::from("counter");
    let guest_log = CallLog::default();
    net.peer_mut("bob")
        .unwrap()
        .set_factory(recording_factory(guest_log.clone(), Arc::new(AtomicUsize::new(0))));
    let (host_handler, _host_log) = RecordingHandler::new();
    net.peer_mut("alice")
        .unwrap()
        .create_session(
            "counter",
            SessionConfig::centralized(0),
            Box::new(host_handler.with_state(json!({ "count": 0 }))),
        )
        .unwrap();
    net.run();

    net.clear_sent();
    net.advance(Duration::from_millis(200));
    assert!(data_frames(&net, "alice", &counter).is_empty());

    net.peer_mut("alice").unwrap().set_fps(&counter, 20).unwrap();
    net.run();
    let bob_view = net.peer("bob").unwrap().sessions().snapshot(&counter).unwrap();
    assert_eq!(bob_view.fps, 20);

    net.clear_sent();
    net.advance(Duration::from_millis(200));
    let pushes = data_frames(&net, "alice", &counter).len();
    assert!((3..=5).contains(&pushes), "expected about 4 pushes, got {pushes}");
    assert_eq!(guest_log.remote_states().len(), pushes);
    // the guest never runs a loop in centralized mode
    assert!(data_frames(&net, "bob", &counter).is_empty());
}

#[test]
fn test_duplicate_create_is_ignored() {
    let mut net = connected_pair(PeerConfig::testing());
    let chat = SessionId::from("chat");
    let guest_log = CallLog::default();
    let created = Arc::new(AtomicUsize::new(0));
    net.peer_mut("bob")
        .unwrap()
        .set_factory(recording_factory(guest_log.clone(), created.clone()));
    let (host_handler, _host_log) = RecordingHandler::new();
    net.peer_mut("alice")
        .unwrap()
        .create_session("chat", SessionConfig::independent(0), Box::new(host_handler))
        .unwrap();
    net.run();

    // Deliberate policy: a second announcement for a live session neither
    // rebuilds the handler nor restarts it.
    let duplicate = Frame::control(ControlMessage::Create {
        id: chat.clone(),
        mode: SessionMode::Independent,
        fps: 0,
    });
    net.inject("bob", duplicate.to_value().unwrap());

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(guest_log.count(|call| *call == HandlerCall::Start), 1);
    assert_eq!(net.peer("bob").unwrap().session_state(&chat), Some(SessionState::Connected));
}

#[test]
fn test_both_sides_create_the_same_session() {
    let mut net = connected_pair(PeerConfig::testing());
    let chat = SessionId::from("chat");
    let (host_handler, host_log) = RecordingHandler::new();
    let (guest_handler, guest_log) = RecordingHandler::new();

    net.peer_mut("alice")
        .unwrap()
        .create_session("chat", SessionConfig::independent(0), Box::new(host_handler))
        .unwrap();
    net.peer_mut("bob")
        .unwrap()
        .create_session("chat", SessionConfig::independent(0), Box::new(guest_handler))
        .unwrap();
    net.run();

    assert_eq!(net.peer("alice").unwrap().session_state(&chat), Some(SessionState::Connected));
    assert_eq!(net.peer("bob").unwrap().session_state(&chat), Some(SessionState::Connected));
    assert_eq!(host_log.count(|call| *call == HandlerCall::Start), 1);
    assert_eq!(guest_log.count(|call| *call == HandlerCall::Start), 1);
}

#[test]
fn test_failing_handler_is_reported_and_isolated() {
    let mut net = connected_pair(PeerConfig::testing());
    let chat = SessionId::from("chat");
    let notes = SessionId::from("notes");

    let guest_log = CallLog::default();
    let mut chats = Some(ChatHandler::new().0);
    let notes_log = guest_log.clone();
    net.peer_mut("bob")
        .unwrap()
        .set_factory(move |id: &SessionId, _mode: SessionMode, _fps: u32| {
            if id.as_str() == "chat" {
                chats
                    .take()
                    .map(|handler| Box::new(handler) as Box<dyn SessionHandler>)
            } else {
                Some(Box::new(RecordingHandler::with_log(notes_log.clone())) as Box<dyn SessionHandler>)
            }
        });

    for id in ["chat", "notes"] {
        let (handler, _log) = RecordingHandler::new();
        net.peer_mut("alice")
            .unwrap()
            .create_session(id, SessionConfig::independent(0), Box::new(handler))
            .unwrap();
    }
    net.run();

    let alice = net.peer_mut("alice").unwrap();
    alice.send_message(&chat, json!({ "body": "no text field" })).unwrap();
    alice.send_message(&notes, json!({ "n": 1 })).unwrap();
    net.run();

    assert!(net.events("bob").iter().any(|event| matches!(
        event,
        AppEvent::HandlerError { session, method: HandlerMethod::OnMessage, .. } if *session == chat
    )));
    assert_eq!(guest_log.messages(), vec![json!({ "n": 1 })]);
    assert_eq!(net.peer("bob").unwrap().session_state(&chat), Some(SessionState::Connected));
}

#[test]
fn test_sessions_end_on_link_loss_and_come_back() {
    let mut net = connected_pair(PeerConfig::testing());
    let chat = SessionId::from("chat");
    let guest_log = CallLog::default();
    let created = Arc::new(AtomicUsize::new(0));
    net.peer_mut("bob")
        .unwrap()
        .set_factory(recording_factory(guest_log.clone(), created.clone()));
    let (host_handler, host_log) = RecordingHandler::new();
    net.peer_mut("alice")
        .unwrap()
        .create_session("chat", SessionConfig::independent(0), Box::new(host_handler))
        .unwrap();
    net.run();

    net.sever("alice");
    // the creator keeps its session for re-announcement, the mirror is dropped
    assert_eq!(net.peer("alice").unwrap().session_state(&chat), Some(SessionState::Idle));
    assert_eq!(net.peer("bob").unwrap().session_state(&chat), None);
    assert_eq!(host_log.calls(), vec![HandlerCall::Start, HandlerCall::End]);
    assert_eq!(guest_log.calls(), vec![HandlerCall::Start, HandlerCall::End]);

    net.peer_mut("alice").unwrap().reconnect().unwrap();
    net.run();
    assert_eq!(net.peer("alice").unwrap().session_state(&chat), Some(SessionState::Connected));
    assert_eq!(net.peer("bob").unwrap().session_state(&chat), Some(SessionState::Connected));
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[test]
fn test_end_session_reaches_the_peer() {
    let mut net = connected_pair(PeerConfig::testing());
    let chat = SessionId::from("chat");
    let guest_log = CallLog::default();
    net.peer_mut("bob")
        .unwrap()
        .set_factory(recording_factory(guest_log.clone(), Arc::new(AtomicUsize::new(0))));
    let (host_handler, _host_log) = RecordingHandler::new();
    net.peer_mut("alice")
        .unwrap()
        .create_session("chat", SessionConfig::independent(0), Box::new(host_handler))
        .unwrap();
    net.run();

    assert!(net.peer_mut("alice").unwrap().end_session(&chat));
    net.run();
    assert_eq!(net.peer("alice").unwrap().session_state(&chat), None);
    assert_eq!(net.peer("bob").unwrap().session_state(&chat), None);
    assert_eq!(guest_log.calls(), vec![HandlerCall::Start, HandlerCall::End]);
    assert!(!net.peer_mut("alice").unwrap().end_session(&chat));
}

#[test]
fn test_controller_commands_are_applied_by_the_peer() {
    let mut net = connected_pair(PeerConfig::testing());
    let chat = SessionId::from("chat");
    let guest_log = CallLog::default();
    net.peer_mut("bob")
        .unwrap()
        .set_factory(recording_factory(guest_log.clone(), Arc::new(AtomicUsize::new(0))));
    let (host_handler, host_log) = RecordingHandler::new();
    net.peer_mut("alice")
        .unwrap()
        .create_session("chat", SessionConfig::independent(0), Box::new(host_handler))
        .unwrap();
    net.run();

    let controller = guest_log.controller().expect("guest session started");
    assert_eq!(controller.state(), SessionState::Connected);
    assert!(!controller.is_host());
    controller.send_message(json!({ "via": "controller" })).unwrap();

    net.peer_mut("bob").unwrap().process_commands();
    net.run();
    assert_eq!(host_log.messages(), vec![json!({ "via": "controller" })]);
}
