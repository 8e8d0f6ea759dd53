//! # Switchyard Test Utilities
//!
//! Shared fakes and fixtures for Switchyard tests.
//!
//! ## Modules
//!
//! - `token_builders` - HS256 bearer tokens for the auth gate
//! - `sockets` - In-process socket handles and a WebSocket test client
//! - `spawner` - Scripted worker spawner for supervisor tests
//! - `handlers` - Recording and failing message handlers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use switchyard_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let spawner = ScriptedSpawner::new();
//!     let (supervisor, task) =
//!         ClusterSupervisor::start(SupervisorConfig::new(2), spawner.as_spawner(), None);
//!
//!     spawner.wait_for_spawns(2).await;
//!     spawner.crash(0, 1);
//!     spawner.wait_for_spawns(3).await;
//! }
//! ```

pub mod handlers;
pub mod sockets;
pub mod spawner;
pub mod token_builders;

pub use handlers::{FailingHandler, RecordingHandler};
pub use sockets::{TestSocket, WsTestClient};
pub use spawner::ScriptedSpawner;
pub use token_builders::{TestTokenBuilder, TEST_JWT_SECRET};
