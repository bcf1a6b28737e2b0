//! Duplex command/event channel between the host and a driver-side helper.
//!
//! One channel is hosted per driver process, on a local-socket name derived
//! from that process's id. The helper connects, calls `register`, and from
//! then on both sides may issue requests over the same connection:
//!
//! - helper → host: `register`, `notifyEvent`
//! - host → helper: `startBot`, `stopBot`
//!
//! Messages are newline-delimited JSON (see [`protocol`]).

pub mod codec;
pub mod events;
pub mod host;
pub mod protocol;

pub use events::{DriverEvent, EventBus, Subscription};
pub use host::{endpoint_name, DuplexChannel};
