//! Inbound message routing.
//!
//! Frames are `{type, action, data}` JSON objects. The [`MessageRouter`]
//! resolves a handler from a statically built table and runs it through an
//! ordered middleware chain.

mod context;
mod handlers;
mod message;
mod middleware;
mod router;

pub use context::HandlerContext;
pub use handlers::{
    builtin_validation, register_builtin_routes, BroadcastAllHandler, JoinRoomHandler,
    LeaveRoomHandler, PingHandler, RoomBroadcastHandler, MAX_ROOM_NAME_BYTES,
};
pub use message::{MessageParseError, WireMessage, MAX_FRAME_BYTES};
pub use middleware::{
    ErrorAction, LoggingMiddleware, Middleware, RateLimitMiddleware, RecoveryMiddleware,
    RetryMiddleware, ValidationMiddleware,
};
pub use router::{
    DispatchOutcome, Matcher, MessageHandler, MessagePredicate, MessageRouter, RouterBuilder,
    MAX_DISPATCH_ATTEMPTS,
};
