//! `rpcguard` core: call-scoped contexts, cooperative thread interruption, and
//! the server call primitives a transport drives.

pub mod call;
pub mod context;
pub mod interrupt;
pub mod status;

pub use call::{
    intercept, BoxListener, InterceptedHandler, InterceptorLayer, Metadata, MethodDescriptor,
    MethodType, NoopListener, ServerCall, ServerCallHandler, ServerCallListener,
    ServerInterceptor,
};
pub use context::{AttachGuard, CancellableContext, Context, ContextKey, ListenerId};
pub use interrupt::{Interrupted, Interrupter};
pub use status::{Code, Status};
