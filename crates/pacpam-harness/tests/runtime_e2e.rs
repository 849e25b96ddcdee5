//! Two async runtimes talking over the in-memory switchboard

use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use pacpam_core::{
    AppEvent, AuthFailure, ConnectionState, Credentials, PacpamError, PeerConfig, PeerId, SessionConfig,
    SessionHandler, SessionId, SessionMode, SessionState, SyncState,
};
use pacpam_harness::{ChatEvent, ChatHandler, MemorySwitchboard};
use pacpam_runtime::{RuntimeBuilder, RuntimeHandle};

const WAIT: Duration = Duration::from_secs(3);

struct Endpoint {
    handle: RuntimeHandle,
    events: broadcast::Receiver<AppEvent>,
    task: JoinHandle<pacpam_core::Result<()>>,
}

fn spawn(
    board: &MemorySwitchboard,
    name: &str,
    secret: &str,
    configure: impl FnOnce(RuntimeBuilder) -> RuntimeBuilder,
) -> Endpoint {
    let builder = RuntimeBuilder::new(Credentials::new(secret, name)).with_config(PeerConfig::default());
    let (handle, task) = configure(builder).spawn(board.transport()).unwrap();
    let events = handle.subscribe();
    Endpoint { handle, events, task }
}

async fn wait_for(events: &mut broadcast::Receiver<AppEvent>, matches: impl Fn(&AppEvent) -> bool) -> AppEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => break event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for an application event")
}

async fn next_chat(display: &mut mpsc::UnboundedReceiver<ChatEvent>) -> ChatEvent {
    timeout(WAIT, display.recv())
        .await
        .expect("timed out waiting for the chat display")
        .expect("chat display closed")
}

async fn ready(endpoint: &mut Endpoint, identity: &str) -> PeerId {
    let id = endpoint.handle.init(identity).await.unwrap();
    wait_for(&mut endpoint.events, |event| matches!(event, AppEvent::IdReady { .. })).await;
    id
}

async fn stop(endpoint: Endpoint) {
    endpoint.handle.shutdown().await.unwrap();
    timeout(WAIT, endpoint.task)
        .await
        .expect("runtime did not stop")
        .expect("runtime task panicked")
        .unwrap();
}

#[tokio::test]
async fn test_chat_between_runtimes() {
    let board = MemorySwitchboard::new();
    let (display_tx, mut display) = mpsc::unbounded_channel();

    let mut alice = spawn(&board, "alice", "shared", |builder| builder);
    let mut bob = spawn(&board, "bob", "shared", move |builder| {
        builder.with_factory(move |_id: &SessionId, _mode: SessionMode, _fps: u32| {
            let (chat, _log) = ChatHandler::new();
            Some(Box::new(chat.with_sink(display_tx.clone())) as Box<dyn SessionHandler>)
        })
    });

    ready(&mut alice, "alice").await;
    let bob_id = ready(&mut bob, "bob").await;

    alice.handle.connect_to("bob").await.unwrap();
    wait_for(&mut alice.events, |event| matches!(event, AppEvent::Connected { is_host: true, .. })).await;
    wait_for(&mut bob.events, |event| matches!(event, AppEvent::Connected { is_host: false, .. })).await;

    let (host_chat, host_log) = ChatHandler::new();
    alice
        .handle
        .create_session("chat", SessionConfig::independent(0), Box::new(host_chat))
        .await
        .unwrap();
    wait_for(&mut alice.events, |event| {
        matches!(event, AppEvent::SessionStateChanged { state: SessionState::Connected, .. })
    })
    .await;
    assert_eq!(next_chat(&mut display).await, ChatEvent::Joined);

    alice.handle.send_message("chat", json!({ "text": "hello bob" })).await.unwrap();
    assert_eq!(next_chat(&mut display).await, ChatEvent::Text("hello bob".to_string()));

    bob.handle.send_message("chat", json!({ "text": "hi alice" })).await.unwrap();
    timeout(WAIT, async {
        while host_log.texts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("host never saw the reply");
    assert_eq!(host_log.texts(), vec!["hi alice".to_string()]);

    let status = alice.handle.status().await.unwrap();
    assert_eq!(status.connection, ConnectionState::Connected);
    assert_eq!(status.sync, SyncState::Connected);
    assert_eq!(status.remote, Some(bob_id));
    assert_eq!(
        status.session(&SessionId::from("chat")).map(|s| s.state),
        Some(SessionState::Connected)
    );

    assert!(alice.handle.disconnect().await.unwrap());
    assert_eq!(next_chat(&mut display).await, ChatEvent::Left);

    stop(alice).await;
    stop(bob).await;
}

#[tokio::test]
async fn test_auth_mismatch_between_runtimes() {
    let board = MemorySwitchboard::new();
    let mut alice = spawn(&board, "alice", "one secret", |builder| builder);
    let mut bob = spawn(&board, "bob", "another secret", |builder| builder);
    ready(&mut alice, "alice").await;
    ready(&mut bob, "bob").await;

    alice.handle.connect_to("bob").await.unwrap();
    wait_for(&mut bob.events, |event| {
        matches!(event, AppEvent::AuthFailed { reason: AuthFailure::Mismatch, .. })
    })
    .await;
    wait_for(&mut alice.events, |event| matches!(event, AppEvent::AuthFailed { .. })).await;

    let status = alice.handle.status().await.unwrap();
    assert_eq!(status.connection, ConnectionState::Ready);
    assert_eq!(status.remote, None);

    stop(alice).await;
    stop(bob).await;
}

#[tokio::test]
async fn test_reconnect_after_severed_link() {
    let board = MemorySwitchboard::new();
    let mut alice = spawn(&board, "alice", "shared", |builder| builder);
    let mut bob = spawn(&board, "bob", "shared", |builder| builder);
    let alice_id = ready(&mut alice, "alice").await;
    let bob_id = ready(&mut bob, "bob").await;

    // nothing to reconnect to yet
    let err = alice.handle.reconnect().await.unwrap_err();
    assert!(matches!(err, PacpamError::Reconnect(_)));

    alice.handle.connect_to("bob").await.unwrap();
    wait_for(&mut alice.events, |event| matches!(event, AppEvent::Connected { .. })).await;
    wait_for(&mut bob.events, |event| matches!(event, AppEvent::Connected { .. })).await;

    assert!(board.sever(&alice_id));
    wait_for(&mut alice.events, |event| matches!(event, AppEvent::Disconnected { .. })).await;
    wait_for(&mut bob.events, |event| matches!(event, AppEvent::Disconnected { .. })).await;

    assert_eq!(alice.handle.reconnect().await.unwrap(), bob_id);
    wait_for(&mut alice.events, |event| matches!(event, AppEvent::Connected { .. })).await;
    let status = alice.handle.status().await.unwrap();
    assert_eq!(status.sync, SyncState::Connected);

    stop(alice).await;
    stop(bob).await;
}
