//! Worker actors.
//!
//! - `WorkerHub`: one per worker; owns the registry, rooms, router and relay
//! - connection writer: one per socket; owns the WebSocket sink
//!
//! Socket readers never touch connection state directly; they send
//! [`HubMessage`]s to the hub.

mod connection;
mod hub;
mod messages;

pub use connection::spawn_writer;
pub use hub::{HubConfig, HubTask, WorkerHub, WorkerHubHandle};
pub use messages::{DisconnectReason, HubMessage, HubStats};
