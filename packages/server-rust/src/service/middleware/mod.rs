//! Interceptors applied in front of call handlers.
//!
//! - [`timeout`]: unary-only timeout interceptor and its listener
//! - [`timeout_manager`]: deadline timers and handler-thread interruption
//! - [`serializing_call`]: outbound write shim shared by handler and timer

pub mod serializing_call;
pub mod timeout;
pub mod timeout_manager;

pub use serializing_call::SerializingServerCall;
pub use timeout::{ServerCallTimeoutInterceptor, TimeoutServerCallListener};
pub use timeout_manager::{ServerTimeoutManager, TIMEOUT_DESCRIPTION};
