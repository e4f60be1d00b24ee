//! Room registry, frame relay and durable capture for the parley signaling
//! server.
//!
//! All relay state is owned by a single task (see [`dispatcher`]); each
//! inbound frame is handled to completion before the next one starts.

pub mod connection;
pub mod dispatcher;
pub mod files;
pub mod history;
pub mod registry;
pub mod relay;

pub use dispatcher::Dispatcher;
pub use relay::{ConnectParams, Relay, RelayConfig};
