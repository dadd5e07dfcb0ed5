//! Call handling: configuration, handler adapters, method registry and the
//! timeout middleware.
//!
//! 1. **Configuration** (`config`): per-method timeouts loaded from JSON
//! 2. **Middleware** (`middleware`): timeout interceptor, timeout manager, write shim
//! 3. **Registry** (`registry`): methods keyed by full name
//! 4. **Stubs** (`stub`): plain functions adapted into call handlers

pub mod config;
pub mod middleware;
pub mod registry;
pub mod stub;

pub use config::{ConfigError, TimeoutConfig};
pub use registry::{HandlerRegistry, ServerMethodDefinition};
pub use stub::{client_streaming_call, unary_call, ClientStreamingCallHandler, UnaryCallHandler};
