#![doc = "pacpam Harness\n\nDeterministic multi-peer simulation on a manual clock, an in-memory\ntransport for the async runtime, and sample session handlers shared by\ntests and the CLI demos."]

pub mod handlers;
pub mod memory;
pub mod sim;

pub use handlers::{CallLog, ChatEvent, ChatHandler, ChatLog, CounterHandler, CounterView, HandlerCall, RecordingHandler};
pub use memory::{MemorySwitchboard, MemoryTransport};
pub use sim::SimNetwork;
