//! In-process demonstrations
//!
//! Both demos spawn two runtimes on one [`MemorySwitchboard`], let the host
//! dial the guest, and drive a single session between them.

use std::future::Future;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use pacpam_core::{
    AppEvent, Credentials, SessionConfig, SessionHandler, SessionId, SessionMode, SessionState,
};
use pacpam_harness::{ChatEvent, ChatHandler, CounterHandler, CounterView, MemorySwitchboard};
use pacpam_runtime::{RuntimeBuilder, RuntimeHandle};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

const CHAT: &str = "chat";
const COUNTER: &str = "counter";

// ----------------------------------------------------------------------------
// Endpoints
// ----------------------------------------------------------------------------

struct Endpoint {
    name: String,
    handle: RuntimeHandle,
    events: broadcast::Receiver<AppEvent>,
    task: JoinHandle<pacpam_core::Result<()>>,
}

impl Endpoint {
    fn spawn(board: &MemorySwitchboard, config: &AppConfig, name: &str, builder: RuntimeBuilder) -> Result<Self> {
        let (handle, task) = builder
            .with_config(config.peer.clone())
            .with_runtime_config(config.runtime)
            .spawn(board.transport())?;
        let events = handle.subscribe();
        debug!(endpoint = name, "runtime spawned");
        Ok(Self {
            name: name.to_string(),
            handle,
            events,
            task,
        })
    }

    async fn wait_for(&mut self, limit: Duration, what: &'static str, matches: impl Fn(&AppEvent) -> bool) -> Result<AppEvent> {
        within(limit, what, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if matches(&event) => return Ok(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(CliError::Demo(format!("{} stopped while waiting for {what}", self.name)))
                    }
                }
            }
        })
        .await?
    }

    async fn stop(self) -> Result<()> {
        self.handle.shutdown().await?;
        match self.task.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(CliError::Demo(format!("{} runtime task failed: {e}", self.name))),
        }
    }
}

async fn within<T>(limit: Duration, what: &'static str, step: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(limit, step)
        .await
        .map_err(|_| CliError::Timeout(what))
}

/// Host and guest, initialised and connected
struct Pair {
    host: Endpoint,
    guest: Endpoint,
    limit: Duration,
}

impl Pair {
    async fn connect(config: &AppConfig, guest_builder: impl FnOnce(RuntimeBuilder) -> RuntimeBuilder) -> Result<Self> {
        let board = MemorySwitchboard::new();
        let demo = &config.demo;
        let limit = demo.step_timeout();

        let host_builder = RuntimeBuilder::new(Credentials::new(&demo.secret, demo.host.as_str()));
        let guest_builder = guest_builder(RuntimeBuilder::new(Credentials::new(&demo.secret, demo.guest.as_str())));
        let mut host = Endpoint::spawn(&board, config, &demo.host, host_builder)?;
        let mut guest = Endpoint::spawn(&board, config, &demo.guest, guest_builder)?;

        for (endpoint, identity) in [(&mut host, &demo.host), (&mut guest, &demo.guest)] {
            let id = endpoint.handle.init(identity).await?;
            endpoint
                .wait_for(limit, "signaling registration", |event| matches!(event, AppEvent::IdReady { .. }))
                .await?;
            info!(endpoint = %identity, peer = %id, "registered");
        }

        host.handle.connect_to(&demo.guest).await?;
        host.wait_for(limit, "host connection", |event| matches!(event, AppEvent::Connected { .. }))
            .await?;
        guest
            .wait_for(limit, "guest connection", |event| matches!(event, AppEvent::Connected { .. }))
            .await?;
        Ok(Self { host, guest, limit })
    }

    async fn create_on_host(&mut self, id: &str, config: SessionConfig, handler: Box<dyn SessionHandler>) -> Result<()> {
        self.host.handle.create_session(id, config, handler).await?;
        let session = SessionId::from(id);
        self.host
            .wait_for(self.limit, "session start", |event| {
                matches!(event, AppEvent::SessionStateChanged { id, state: SessionState::Connected } if *id == session)
            })
            .await?;
        Ok(())
    }

    async fn stop(self) -> Result<()> {
        self.host.stop().await?;
        self.guest.stop().await
    }
}

// ----------------------------------------------------------------------------
// Chat
// ----------------------------------------------------------------------------

/// One displayed chat line, tagged with the endpoint that showed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub endpoint: String,
    pub event: ChatEvent,
}

impl std::fmt::Display for ChatLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.event {
            ChatEvent::Joined => write!(f, "[{}] * joined", self.endpoint),
            ChatEvent::Text(text) => write!(f, "[{}] {text}", self.endpoint),
            ChatEvent::PeerAbsent => write!(f, "[{}] * peer went quiet", self.endpoint),
            ChatEvent::PeerBack => write!(f, "[{}] * peer is back", self.endpoint),
            ChatEvent::Left => write!(f, "[{}] * left", self.endpoint),
        }
    }
}

async fn next_line(display: &mut mpsc::UnboundedReceiver<ChatEvent>, limit: Duration) -> Result<ChatEvent> {
    within(limit, "chat display", display.recv())
        .await?
        .ok_or_else(|| CliError::Demo("chat display closed".to_string()))
}

/// Host sends each line, the guest echoes it back; returns the transcript
pub async fn run_chat(config: &AppConfig, messages: &[String]) -> Result<Vec<ChatLine>> {
    let (guest_tx, mut guest_display) = mpsc::unbounded_channel();
    let (host_tx, mut host_display) = mpsc::unbounded_channel();

    let mut pair = Pair::connect(config, move |builder| {
        builder.with_factory(move |_id: &SessionId, _mode: SessionMode, _fps: u32| {
            let (chat, _log) = ChatHandler::new();
            Some(Box::new(chat.with_sink(guest_tx.clone())) as Box<dyn SessionHandler>)
        })
    })
    .await?;
    let limit = pair.limit;
    let host_name = config.demo.host.clone();
    let guest_name = config.demo.guest.clone();
    let mut transcript = Vec::new();
    let mut show = |endpoint: &str, event: ChatEvent| {
        let line = ChatLine {
            endpoint: endpoint.to_string(),
            event,
        };
        info!("{line}");
        transcript.push(line);
    };

    let (host_chat, _log) = ChatHandler::new();
    pair.create_on_host(CHAT, SessionConfig::independent(0), Box::new(host_chat.with_sink(host_tx)))
        .await?;
    let joined = next_line(&mut host_display, limit).await?;
    show(&host_name, joined);
    let joined = next_line(&mut guest_display, limit).await?;
    show(&guest_name, joined);

    for message in messages {
        pair.host.handle.send_message(CHAT, json!({ "text": message })).await?;
        let received = next_line(&mut guest_display, limit).await?;
        let echo = match &received {
            ChatEvent::Text(text) => format!("echo: {text}"),
            other => return Err(CliError::Demo(format!("guest showed {other:?} instead of a message"))),
        };
        show(&guest_name, received);

        pair.guest.handle.send_message(CHAT, json!({ "text": echo })).await?;
        let reply = next_line(&mut host_display, limit).await?;
        show(&host_name, reply);
    }

    pair.host.handle.disconnect().await?;
    let left = next_line(&mut guest_display, limit).await?;
    show(&guest_name, left);
    pair.stop().await?;
    Ok(transcript)
}

// ----------------------------------------------------------------------------
// Counter
// ----------------------------------------------------------------------------

/// Guest's predicted value right after each action, and where both sides settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterReport {
    pub predictions: Vec<i64>,
    pub host: i64,
    pub guest: i64,
}

async fn settle(view: &CounterView, expected: i64, limit: Duration) -> Result<()> {
    within(limit, "counter to settle", async {
        while view.get() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Guest sends every increment; the host applies them and pushes its state back
pub async fn run_counter(config: &AppConfig, adds: &[i64], fps: u32) -> Result<CounterReport> {
    let (guest_counter, guest_view) = CounterHandler::new();
    let mut pending = Some(guest_counter);
    let mut pair = Pair::connect(config, move |builder| {
        builder.with_factory(move |_id: &SessionId, _mode: SessionMode, _fps: u32| {
            pending
                .take()
                .map(|handler| Box::new(handler) as Box<dyn SessionHandler>)
        })
    })
    .await?;
    let limit = pair.limit;

    let (host_counter, host_view) = CounterHandler::new();
    pair.create_on_host(COUNTER, SessionConfig::centralized(fps), Box::new(host_counter))
        .await?;
    // the guest's handler is running once it accepted the announcement
    pair.guest
        .wait_for(limit, "guest session", |event| {
            matches!(event, AppEvent::SessionStateChanged { state: SessionState::Connected, .. })
        })
        .await?;

    let mut predictions = Vec::with_capacity(adds.len());
    let mut total = 0;
    for add in adds {
        pair.guest.handle.send_action(COUNTER, json!({ "add": add })).await?;
        total += add;
        let predicted = guest_view.get();
        info!(add, predicted, "guest predicted");
        predictions.push(predicted);
        // wait for the correction so the next prediction starts from it
        settle(&host_view, total, limit).await?;
        settle(&guest_view, total, limit).await?;
    }
    info!(host = host_view.get(), guest = guest_view.get(), "counter settled");

    let report = CounterReport {
        predictions,
        host: host_view.get(),
        guest: guest_view.get(),
    };
    pair.stop().await?;
    Ok(report)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chat_demo_echoes_every_line() {
        let config = AppConfig::default();
        let lines = vec!["one".to_string(), "two".to_string()];
        let transcript = run_chat(&config, &lines).await.unwrap();

        let texts: Vec<String> = transcript.iter().map(ToString::to_string).collect();
        assert_eq!(
            texts,
            vec![
                "[alice] * joined",
                "[bob] * joined",
                "[bob] one",
                "[alice] echo: one",
                "[bob] two",
                "[alice] echo: two",
                "[bob] * left",
            ]
        );
    }

    #[tokio::test]
    async fn test_counter_demo_predicts_and_settles() {
        let config = AppConfig::default();
        let report = run_counter(&config, &[1, 2, 3], 0).await.unwrap();
        assert_eq!(report.predictions, vec![1, 3, 6]);
        assert_eq!(report.host, 6);
        assert_eq!(report.guest, 6);
    }
}
