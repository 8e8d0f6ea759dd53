//! Switchyard Library
//!
//! A multi-process WebSocket service core:
//!
//! - A primary process supervises a fixed pool of worker processes and
//!   propagates shutdown to them
//! - Each worker owns the registry of its own live connections and rooms
//! - Broadcasts cross worker boundaries over a shared pub/sub bus (Redis);
//!   every worker delivers only to its local connections
//! - Inbound frames run through an ordered middleware chain to a handler
//! - Worker startup and shutdown follow a strict lifecycle with bounded
//!   shutdown
//!
//! # Architecture
//!
//! ```text
//! ClusterSupervisor (primary process)
//! └── worker process × N
//!     ├── LifecycleCoordinator
//!     ├── axum server (/ws, /health, /ready, /metrics)
//!     │   └── per socket: reader task + writer task
//!     └── WorkerHub (single owner of worker state)
//!         ├── ConnectionRegistry + RoomDirectory
//!         ├── MessageRouter + middleware
//!         └── BroadcastRelay ── MessageBus (Redis / in-memory)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Worker hub and connection writer actors
//! - [`auth`] - Bearer-token gate for new connections
//! - [`cluster`] - Worker process supervision
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error actions
//! - [`lifecycle`] - Phase state machine and hooks
//! - [`observability`] - Metrics and health endpoints
//! - [`registry`] - Connection registry and rooms
//! - [`relay`] - Cross-worker broadcasts
//! - [`routing`] - Message router and middleware
//! - [`server`] - HTTP/WebSocket surface
//! - [`worker`] - Worker runtime

pub mod actors;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod relay;
pub mod routing;
pub mod server;
pub mod worker;
