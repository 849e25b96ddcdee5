//! Session multiplexing
//!
//! - `lifecycle`: per-session IDLE/CONNECTING/CONNECTED/DISCONNECTED machine
//! - `handler`: application capability set and failure containment
//! - `controller`: handle given to handlers, backed by a command queue
//! - `registry`: control protocol, data routing and periodic sync

mod controller;
mod handler;
mod lifecycle;
mod registry;

pub use controller::{ControlQueue, SessionCommand, SessionController, SessionOp, SessionOrigin, SessionSnapshot};
pub use handler::{HandlerError, HandlerMethod, HandlerResult, SessionFactory, SessionHandler};
pub use lifecycle::{SessionEvent, SessionMachine, SessionState};
pub use registry::{SessionConfig, SessionRegistry};
