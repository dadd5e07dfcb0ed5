//! Handler adapters turning plain functions into [`ServerCallHandler`]s.
//!
//! The handler body runs inside `on_half_close`, which is where the timeout
//! interceptor applies interruption protection.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rpcguard_core::{
    BoxListener, Metadata, ServerCall, ServerCallHandler, ServerCallListener, Status,
};

// ---------------------------------------------------------------------------
// Unary
// ---------------------------------------------------------------------------

/// Adapts `f` into a handler for unary calls.
pub fn unary_call<Req, Resp, F>(f: F) -> UnaryCallHandler<F>
where
    F: Fn(Req) -> Result<Resp, Status> + Send + Sync + 'static,
{
    UnaryCallHandler { f: Arc::new(f) }
}

pub struct UnaryCallHandler<F> {
    f: Arc<F>,
}

impl<Req, Resp, F> ServerCallHandler<Req, Resp> for UnaryCallHandler<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Req) -> Result<Resp, Status> + Send + Sync + 'static,
{
    fn start_call(
        &self,
        call: Arc<dyn ServerCall<Req, Resp>>,
        _headers: Metadata,
    ) -> BoxListener<Req> {
        // Ask for two so a misbehaving client sending a second request is caught.
        call.request(2);
        Box::new(UnaryListener {
            call,
            f: Arc::clone(&self.f),
            request: None,
            failed: false,
        })
    }
}

struct UnaryListener<Req, Resp, F> {
    call: Arc<dyn ServerCall<Req, Resp>>,
    f: Arc<F>,
    request: Option<Req>,
    failed: bool,
}

impl<Req, Resp, F> ServerCallListener<Req> for UnaryListener<Req, Resp, F>
where
    Req: Send,
    F: Fn(Req) -> Result<Resp, Status> + Send + Sync,
{
    fn on_message(&mut self, message: Req) {
        if self.failed {
            return;
        }
        if self.request.is_some() {
            self.failed = true;
            self.request = None;
            self.call.close(Status::internal("too many requests"), Metadata::new());
            return;
        }
        self.request = Some(message);
    }

    fn on_half_close(&mut self) {
        if self.failed {
            return;
        }
        let Some(request) = self.request.take() else {
            self.call.close(
                Status::internal("half-closed without a request"),
                Metadata::new(),
            );
            return;
        };
        let f = &*self.f;
        let outcome = catch_unwind(AssertUnwindSafe(|| f(request)));
        respond(self.call.as_ref(), outcome);
    }

    fn on_cancel(&mut self) {
        self.request = None;
        tracing::debug!(
            method = self.call.method_descriptor().full_name(),
            "unary call cancelled"
        );
    }
}

// ---------------------------------------------------------------------------
// Client streaming
// ---------------------------------------------------------------------------

/// Adapts `f` into a handler for client-streaming calls. All request messages
/// are collected and handed to `f` at half-close.
pub fn client_streaming_call<Req, Resp, F>(f: F) -> ClientStreamingCallHandler<F>
where
    F: Fn(Vec<Req>) -> Result<Resp, Status> + Send + Sync + 'static,
{
    ClientStreamingCallHandler { f: Arc::new(f) }
}

pub struct ClientStreamingCallHandler<F> {
    f: Arc<F>,
}

impl<Req, Resp, F> ServerCallHandler<Req, Resp> for ClientStreamingCallHandler<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Vec<Req>) -> Result<Resp, Status> + Send + Sync + 'static,
{
    fn start_call(
        &self,
        call: Arc<dyn ServerCall<Req, Resp>>,
        _headers: Metadata,
    ) -> BoxListener<Req> {
        call.request(1);
        Box::new(StreamingListener {
            call,
            f: Arc::clone(&self.f),
            requests: Vec::new(),
        })
    }
}

struct StreamingListener<Req, Resp, F> {
    call: Arc<dyn ServerCall<Req, Resp>>,
    f: Arc<F>,
    requests: Vec<Req>,
}

impl<Req, Resp, F> ServerCallListener<Req> for StreamingListener<Req, Resp, F>
where
    Req: Send,
    F: Fn(Vec<Req>) -> Result<Resp, Status> + Send + Sync,
{
    fn on_message(&mut self, message: Req) {
        self.requests.push(message);
        self.call.request(1);
    }

    fn on_half_close(&mut self) {
        let requests = std::mem::take(&mut self.requests);
        let f = &*self.f;
        let outcome = catch_unwind(AssertUnwindSafe(|| f(requests)));
        respond(self.call.as_ref(), outcome);
    }

    fn on_cancel(&mut self) {
        self.requests.clear();
        tracing::debug!(
            method = self.call.method_descriptor().full_name(),
            "client-streaming call cancelled"
        );
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

fn respond<Req, Resp>(
    call: &dyn ServerCall<Req, Resp>,
    outcome: std::thread::Result<Result<Resp, Status>>,
) {
    match outcome {
        Ok(Ok(response)) => {
            call.send_headers(Metadata::new());
            call.send_message(response);
            call.close(Status::ok(), Metadata::new());
        }
        Ok(Err(status)) => call.close(status, Metadata::new()),
        Err(panic) => {
            tracing::error!(
                method = call.method_descriptor().full_name(),
                panic = panic_message(panic.as_ref()),
                "handler panicked"
            );
            call.close(Status::unknown("handler panicked"), Metadata::new());
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
