//! Connection authentication.
//!
//! Every WebSocket connection passes the [`AuthGate`] before the registry or
//! any room learns about it.

mod gate;

pub use gate::{AuthContext, AuthGate, AuthenticationError};
