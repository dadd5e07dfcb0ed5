//! Timeout interceptor for unary calls.
//!
//! Guards the handler body of every unary-shaped call with the deadline of a
//! call-scoped context obtained from the [`ServerTimeoutManager`]. Streaming
//! calls pass through untouched.

use std::sync::Arc;

use rpcguard_core::{
    BoxListener, CancellableContext, Metadata, ServerCall, ServerCallHandler, ServerCallListener,
    ServerInterceptor, Status,
};

use super::serializing_call::SerializingServerCall;
use super::timeout_manager::ServerTimeoutManager;

// ---------------------------------------------------------------------------
// ServerCallTimeoutInterceptor
// ---------------------------------------------------------------------------

/// Interceptor that puts unary calls under the manager's timeout control.
///
/// Calls whose client sends more than one message are not guarded at all. For
/// the rest, the call is wrapped in a [`SerializingServerCall`] and the manager
/// is asked for a timeout context; if it refuses, the call proceeds exactly as
/// if this interceptor were not installed.
#[derive(Debug, Clone)]
pub struct ServerCallTimeoutInterceptor {
    manager: Arc<ServerTimeoutManager>,
}

impl ServerCallTimeoutInterceptor {
    #[must_use]
    pub fn new(manager: Arc<ServerTimeoutManager>) -> Self {
        Self { manager }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<ServerTimeoutManager> {
        &self.manager
    }
}

impl<Req, Resp> ServerInterceptor<Req, Resp> for ServerCallTimeoutInterceptor
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn intercept_call(
        &self,
        call: Arc<dyn ServerCall<Req, Resp>>,
        headers: Metadata,
        next: &dyn ServerCallHandler<Req, Resp>,
    ) -> BoxListener<Req> {
        if call.method_descriptor().method_type().client_sends_one_message() {
            let shim: Arc<dyn ServerCall<Req, Resp>> =
                Arc::new(SerializingServerCall::new(Arc::clone(&call)));
            if let Some(context) = self.manager.start_timeout_context(&shim) {
                let delegate = next.start_call(shim, headers);
                return Box::new(TimeoutServerCallListener::new(
                    delegate,
                    context,
                    Arc::clone(&self.manager),
                ));
            }
        }
        next.start_call(call, headers)
    }
}

// ---------------------------------------------------------------------------
// TimeoutServerCallListener
// ---------------------------------------------------------------------------

/// Runs every callback of the inner listener with the call's context attached.
///
/// `on_half_close`, where the handler body runs, additionally executes under
/// the manager's interruption protection. The terminal callbacks cancel the
/// context afterwards, which disarms its deadline timer.
pub struct TimeoutServerCallListener<Req> {
    delegate: BoxListener<Req>,
    context: CancellableContext,
    manager: Arc<ServerTimeoutManager>,
}

impl<Req> TimeoutServerCallListener<Req> {
    #[must_use]
    pub fn new(
        delegate: BoxListener<Req>,
        context: CancellableContext,
        manager: Arc<ServerTimeoutManager>,
    ) -> Self {
        Self {
            delegate,
            context,
            manager,
        }
    }

    #[must_use]
    pub fn context(&self) -> &CancellableContext {
        &self.context
    }
}

impl<Req> ServerCallListener<Req> for TimeoutServerCallListener<Req> {
    fn on_message(&mut self, message: Req) {
        let _attached = self.context.enter();
        self.delegate.on_message(message);
    }

    fn on_half_close(&mut self) {
        let delegate = &mut self.delegate;
        if !self
            .manager
            .with_interruption(&self.context, || delegate.on_half_close())
        {
            tracing::debug!("call context cancelled before half-close; handler not run");
        }
    }

    fn on_cancel(&mut self) {
        let _cancel = CancelOnExit {
            context: &self.context,
            cause: Some(Status::cancelled("call cancelled")),
        };
        let _attached = self.context.enter();
        self.delegate.on_cancel();
    }

    fn on_complete(&mut self) {
        let _cancel = CancelOnExit {
            context: &self.context,
            cause: None,
        };
        let _attached = self.context.enter();
        self.delegate.on_complete();
    }

    fn on_ready(&mut self) {
        let _attached = self.context.enter();
        self.delegate.on_ready();
    }
}

/// Cancels the call context when dropped, after the attach guard declared
/// later in the same scope has already detached it.
struct CancelOnExit<'a> {
    context: &'a CancellableContext,
    cause: Option<Status>,
}

impl Drop for CancelOnExit<'_> {
    fn drop(&mut self) {
        self.context.cancel(self.cause.take());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
