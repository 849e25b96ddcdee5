//! Effect channel between the pure core and its drivers

pub mod communication;

pub use communication::{AppEvent, Effect, Outbox, TransportCommand, TransportEvent};
