//! rpcguard server: per-call timeouts for unary RPC handlers.
//!
//! [`ServerCallTimeoutInterceptor`] puts every unary call under a deadline
//! tracked by a shared [`ServerTimeoutManager`]; the handler thread is
//! interrupted when the deadline passes and the call is closed with
//! `DEADLINE_EXCEEDED`. [`InProcessServer`] is a small transport for driving
//! calls through interceptors and handlers without a network.

pub mod network;
pub mod observability;
pub mod service;

pub use network::{CallOutcome, InProcessServer, PendingCall, ServingState};
pub use observability::init_tracing;
pub use service::middleware::{
    SerializingServerCall, ServerCallTimeoutInterceptor, ServerTimeoutManager,
    TimeoutServerCallListener,
};
pub use service::{
    client_streaming_call, unary_call, ConfigError, HandlerRegistry, ServerMethodDefinition,
    TimeoutConfig,
};
