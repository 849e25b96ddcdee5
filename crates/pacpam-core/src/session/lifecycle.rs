//! Per-session lifecycle machine
//!
//! ```text
//! IDLE --CREATE--> CONNECTING --READY--> CONNECTED
//!                  CONNECTING --END--> DISCONNECTED <--END-- CONNECTED
//! ```
//!
//! DISCONNECTED is terminal. A session created again under the same id is a
//! fresh instance.

use std::convert::Infallible;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::engine::{impl_label, Definition, Machine, TransitionDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl_label!(SessionState {
    Idle => "IDLE",
    Connecting => "CONNECTING",
    Connected => "CONNECTED",
    Disconnected => "DISCONNECTED",
});

impl SessionState {
    /// Created and not yet ended
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Create,
    Ready,
    End,
}

impl_label!(SessionEvent {
    Create => "CREATE",
    Ready => "READY",
    End => "END",
});

#[derive(Debug)]
pub struct SessionMachine;

impl Machine for SessionMachine {
    type State = SessionState;
    type Event = SessionEvent;
    type Guard = Infallible;
    type Emit = Infallible;
    type Action = Infallible;

    const NAME: &'static str = "session";

    fn definition() -> &'static Definition<Self> {
        use SessionEvent::*;
        use SessionState::*;

        static DEFINITION: OnceLock<Definition<SessionMachine>> = OnceLock::new();
        DEFINITION.get_or_init(|| {
            Definition::new(Idle, &[Idle, Connecting, Connected, Disconnected])
                .with(TransitionDef::new("s1", Idle, Create, Connecting))
                .with(TransitionDef::new("s2", Connecting, Ready, Connected))
                .with(TransitionDef::new("s3", Connected, End, Disconnected))
                .with(TransitionDef::new("s4", Connecting, End, Disconnected))
        })
    }
}
