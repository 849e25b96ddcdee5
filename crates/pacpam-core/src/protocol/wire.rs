//! JSON wire frames
//!
//! Every frame is a JSON object discriminated by `type`. Session data frames
//! carry the session id in `_s`; control frames carry their sub-kind in
//! `_ctrl` alongside the session id.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::SessionId;

// ----------------------------------------------------------------------------
// Session Mode
// ----------------------------------------------------------------------------

/// Synchronization model of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// The connection initiator is authoritative and pushes full state
    Centralized,
    /// Both sides push their own state and messages
    Independent,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Centralized => "centralized",
            SessionMode::Independent => "independent",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Auth Message
// ----------------------------------------------------------------------------

/// Handshake frame body: digest of the shared secret plus a display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMessage {
    pub hash: String,
    pub name: String,
    pub timestamp: u64,
}

// ----------------------------------------------------------------------------
// Control Messages
// ----------------------------------------------------------------------------

/// Raw `_ctrl` frame body as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "_ctrl")]
    pub kind: String,
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SessionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
}

/// Session control protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Announce a session (creator to peer)
    Create {
        id: SessionId,
        mode: SessionMode,
        fps: u32,
    },
    /// Activation acknowledgment (peer to creator)
    Ready { id: SessionId },
    SetFps { id: SessionId, fps: u32 },
    End { id: SessionId },
}

/// A control frame that could not be interpreted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("unknown control kind '{kind}' for session {id}")]
    UnknownKind { kind: String, id: SessionId },
    #[error("control '{kind}' for session {id} is missing {field}")]
    MissingField {
        kind: &'static str,
        id: SessionId,
        field: &'static str,
    },
}

impl ControlMessage {
    pub fn id(&self) -> &SessionId {
        match self {
            ControlMessage::Create { id, .. }
            | ControlMessage::Ready { id }
            | ControlMessage::SetFps { id, .. }
            | ControlMessage::End { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Create { .. } => "sessionCreate",
            ControlMessage::Ready { .. } => "sessionReady",
            ControlMessage::SetFps { .. } => "sessionSetFps",
            ControlMessage::End { .. } => "sessionEnd",
        }
    }
}

impl From<ControlMessage> for ControlFrame {
    fn from(message: ControlMessage) -> Self {
        let kind = message.kind().to_string();
        match message {
            ControlMessage::Create { id, mode, fps } => ControlFrame {
                kind,
                id,
                mode: Some(mode),
                fps: Some(fps),
            },
            ControlMessage::SetFps { id, fps } => ControlFrame {
                kind,
                id,
                mode: None,
                fps: Some(fps),
            },
            ControlMessage::Ready { id } | ControlMessage::End { id } => ControlFrame {
                kind,
                id,
                mode: None,
                fps: None,
            },
        }
    }
}

impl TryFrom<ControlFrame> for ControlMessage {
    type Error = ControlError;

    fn try_from(frame: ControlFrame) -> Result<Self, Self::Error> {
        let ControlFrame { kind, id, mode, fps } = frame;
        match kind.as_str() {
            "sessionCreate" => {
                let mode = mode.ok_or_else(|| ControlError::MissingField {
                    kind: "sessionCreate",
                    id: id.clone(),
                    field: "mode",
                })?;
                Ok(ControlMessage::Create {
                    id,
                    mode,
                    fps: fps.unwrap_or(0),
                })
            }
            "sessionReady" => Ok(ControlMessage::Ready { id }),
            "sessionSetFps" => match fps {
                Some(fps) => Ok(ControlMessage::SetFps { id, fps }),
                None => Err(ControlError::MissingField {
                    kind: "sessionSetFps",
                    id,
                    field: "fps",
                }),
            },
            "sessionEnd" => Ok(ControlMessage::End { id }),
            _ => Err(ControlError::UnknownKind { kind, id }),
        }
    }
}

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

/// Every message exchanged over an established link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "auth")]
    Auth(AuthMessage),

    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    #[serde(rename = "pong")]
    Pong { timestamp: u64 },

    #[serde(rename = "_ctrl")]
    Control(ControlFrame),

    /// Authoritative state pushed by a centralized host
    #[serde(rename = "fullState")]
    FullState {
        #[serde(rename = "_s")]
        session: SessionId,
        state: Value,
    },

    /// One side's own state in independent mode
    #[serde(rename = "localState")]
    LocalState {
        #[serde(rename = "_s")]
        session: SessionId,
        state: Value,
    },

    /// Guest input for a centralized host
    #[serde(rename = "action")]
    Action {
        #[serde(rename = "_s")]
        session: SessionId,
        action: Value,
    },

    /// Free-form payload in independent mode
    #[serde(rename = "message")]
    Message {
        #[serde(rename = "_s")]
        session: SessionId,
        payload: Value,
    },
}

impl Frame {
    pub fn control(message: ControlMessage) -> Self {
        Frame::Control(message.into())
    }

    /// Wire value of the `type` field
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Auth(_) => "auth",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Control(_) => "_ctrl",
            Frame::FullState { .. } => "fullState",
            Frame::LocalState { .. } => "localState",
            Frame::Action { .. } => "action",
            Frame::Message { .. } => "message",
        }
    }

    /// Session a data frame belongs to
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            Frame::FullState { session, .. }
            | Frame::LocalState { session, .. }
            | Frame::Action { session, .. }
            | Frame::Message { session, .. } => Some(session),
            Frame::Control(control) => Some(&control.id),
            _ => None,
        }
    }

    /// Frames handled by the connection itself rather than the session layer
    pub fn is_link_level(&self) -> bool {
        matches!(self, Frame::Auth(_) | Frame::Ping { .. } | Frame::Pong { .. })
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_frame_wire_shape() {
        let frame = Frame::control(ControlMessage::Create {
            id: SessionId::from("chat"),
            mode: SessionMode::Independent,
            fps: 0,
        });
        assert_eq!(
            frame.to_value().unwrap(),
            json!({ "type": "_ctrl", "_ctrl": "sessionCreate", "id": "chat", "mode": "independent", "fps": 0 })
        );

        let ready = Frame::control(ControlMessage::Ready { id: SessionId::from("chat") });
        assert_eq!(
            ready.to_value().unwrap(),
            json!({ "type": "_ctrl", "_ctrl": "sessionReady", "id": "chat" })
        );
    }

    #[test]
    fn test_data_frame_wire_shape() {
        let frame = Frame::from_value(json!({
            "type": "message",
            "_s": "chat",
            "payload": { "text": "hi" }
        }))
        .unwrap();
        assert_eq!(
            frame,
            Frame::Message {
                session: SessionId::from("chat"),
                payload: json!({ "text": "hi" }),
            }
        );
        assert_eq!(frame.type_name(), "message");
        assert_eq!(frame.session().map(SessionId::as_str), Some("chat"));
    }

    #[test]
    fn test_auth_frame_wire_shape() {
        let frame = Frame::Auth(AuthMessage {
            hash: "ab".repeat(32),
            name: "alice".into(),
            timestamp: 42,
        });
        let value = frame.to_value().unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["name"], "alice");
        assert!(frame.is_link_level());
    }

    #[test]
    fn test_control_parsing_errors() {
        let unknown = ControlFrame {
            kind: "sessionPause".into(),
            id: SessionId::from("x"),
            mode: None,
            fps: None,
        };
        assert!(matches!(
            ControlMessage::try_from(unknown),
            Err(ControlError::UnknownKind { .. })
        ));

        let no_mode = ControlFrame {
            kind: "sessionCreate".into(),
            id: SessionId::from("x"),
            mode: None,
            fps: Some(10),
        };
        assert!(matches!(
            ControlMessage::try_from(no_mode),
            Err(ControlError::MissingField { field: "mode", .. })
        ));
    }
}
