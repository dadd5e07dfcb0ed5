//! Server call primitives: the surface a transport drives for every call.
//!
//! A transport hands each inbound call to a [`ServerCallHandler`], receives a
//! [`ServerCallListener`] back, and invokes the listener's callbacks in causal
//! order, one at a time per call. [`ServerInterceptor`]s sit in front of a
//! handler and may decorate the call, the listener, or both.

use std::sync::Arc;

use tower::Layer;

use crate::status::Status;

/// Request/response headers and trailers. Opaque to the interception layer.
pub type Metadata = http::HeaderMap;

/// Listener handed back to the transport.
pub type BoxListener<Req> = Box<dyn ServerCallListener<Req>>;

// ---------------------------------------------------------------------------
// Method description
// ---------------------------------------------------------------------------

/// Shape of a method in terms of how many messages flow in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
    Unknown,
}

impl MethodType {
    /// True when the client sends exactly one request message.
    #[must_use]
    pub const fn client_sends_one_message(self) -> bool {
        matches!(self, Self::Unary | Self::ServerStreaming)
    }

    /// True when the server sends exactly one response message.
    #[must_use]
    pub const fn server_sends_one_message(self) -> bool {
        matches!(self, Self::Unary | Self::ClientStreaming)
    }
}

/// Static description of a method: its full name (`service/method`) and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    full_name: String,
    method_type: MethodType,
}

impl MethodDescriptor {
    #[must_use]
    pub fn new(full_name: impl Into<String>, method_type: MethodType) -> Self {
        Self {
            full_name: full_name.into(),
            method_type,
        }
    }

    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    #[must_use]
    pub const fn method_type(&self) -> MethodType {
        self.method_type
    }

    /// Service part of the full name, if the name contains a `/`.
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        self.full_name.rsplit_once('/').map(|(service, _)| service)
    }
}

// ---------------------------------------------------------------------------
// ServerCall
// ---------------------------------------------------------------------------

/// Outbound side of a single inbound call, owned by the transport.
///
/// Implementations are shared between the handler and any decorators, so all
/// methods take `&self`.
pub trait ServerCall<Req, Resp>: Send + Sync {
    /// Asks the transport to deliver up to `num_messages` more requests.
    fn request(&self, num_messages: usize);

    fn send_headers(&self, headers: Metadata);

    fn send_message(&self, message: Resp);

    /// Closes the call with a terminal status. Must be called at most once.
    fn close(&self, status: Status, trailers: Metadata);

    /// True once the client cancelled or the call otherwise failed.
    fn is_cancelled(&self) -> bool;

    /// True when a message can be sent without excessive buffering.
    fn is_ready(&self) -> bool {
        true
    }

    fn method_descriptor(&self) -> &MethodDescriptor;
}

// ---------------------------------------------------------------------------
// ServerCallListener
// ---------------------------------------------------------------------------

/// Lifecycle callbacks of one call.
///
/// The transport invokes them in causal order (messages, half-close, then
/// cancel or complete, with ready notifications interleaved) and never
/// concurrently for the same call.
pub trait ServerCallListener<Req>: Send {
    /// A request message arrived.
    fn on_message(&mut self, message: Req) {
        drop(message);
    }

    /// The client finished sending. Unary handlers run here.
    fn on_half_close(&mut self) {}

    /// The call was cancelled; no further messages can be sent.
    fn on_cancel(&mut self) {}

    /// The call completed and its status was handed to the transport.
    fn on_complete(&mut self) {}

    /// The call became ready to accept more outbound messages.
    fn on_ready(&mut self) {}
}

/// Listener that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl<Req> ServerCallListener<Req> for NoopListener {}

// ---------------------------------------------------------------------------
// ServerCallHandler / ServerInterceptor
// ---------------------------------------------------------------------------

/// Starts processing a call and returns the listener the transport will drive.
pub trait ServerCallHandler<Req, Resp>: Send + Sync {
    fn start_call(
        &self,
        call: Arc<dyn ServerCall<Req, Resp>>,
        headers: Metadata,
    ) -> BoxListener<Req>;
}

impl<Req, Resp, H> ServerCallHandler<Req, Resp> for Arc<H>
where
    H: ServerCallHandler<Req, Resp> + ?Sized,
{
    fn start_call(
        &self,
        call: Arc<dyn ServerCall<Req, Resp>>,
        headers: Metadata,
    ) -> BoxListener<Req> {
        (**self).start_call(call, headers)
    }
}

/// Sits between the transport and a handler for every call.
///
/// An interceptor must start `next` at most once per call, and returns either
/// `next`'s listener or a decorator around it.
pub trait ServerInterceptor<Req, Resp>: Send + Sync {
    fn intercept_call(
        &self,
        call: Arc<dyn ServerCall<Req, Resp>>,
        headers: Metadata,
        next: &dyn ServerCallHandler<Req, Resp>,
    ) -> BoxListener<Req>;
}

/// A handler with one interceptor in front of it.
pub struct InterceptedHandler<I: ?Sized, H> {
    interceptor: Arc<I>,
    next: H,
}

impl<I: ?Sized, H> InterceptedHandler<I, H> {
    pub fn new(interceptor: Arc<I>, next: H) -> Self {
        Self { interceptor, next }
    }
}

impl<Req, Resp, I, H> ServerCallHandler<Req, Resp> for InterceptedHandler<I, H>
where
    I: ServerInterceptor<Req, Resp> + ?Sized,
    H: ServerCallHandler<Req, Resp>,
{
    fn start_call(
        &self,
        call: Arc<dyn ServerCall<Req, Resp>>,
        headers: Metadata,
    ) -> BoxListener<Req> {
        self.interceptor.intercept_call(call, headers, &self.next)
    }
}

/// Tower layer placing an interceptor in front of a handler, so interceptor
/// stacks compose with `tower::ServiceBuilder` (first layer is outermost).
pub struct InterceptorLayer<I: ?Sized> {
    interceptor: Arc<I>,
}

impl<I> InterceptorLayer<I> {
    pub fn new(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }
}

impl<I: ?Sized> Clone for InterceptorLayer<I> {
    fn clone(&self) -> Self {
        Self {
            interceptor: Arc::clone(&self.interceptor),
        }
    }
}

impl<I: ?Sized, H> Layer<H> for InterceptorLayer<I> {
    type Service = InterceptedHandler<I, H>;

    fn layer(&self, inner: H) -> Self::Service {
        InterceptedHandler::new(Arc::clone(&self.interceptor), inner)
    }
}

/// Wraps `handler` with `interceptors`. The last interceptor in the list is the
/// outermost, i.e. the first to see each call.
pub fn intercept<Req, Resp>(
    handler: Arc<dyn ServerCallHandler<Req, Resp>>,
    interceptors: impl IntoIterator<Item = Arc<dyn ServerInterceptor<Req, Resp>>>,
) -> Arc<dyn ServerCallHandler<Req, Resp>>
where
    Req: 'static,
    Resp: 'static,
{
    interceptors
        .into_iter()
        .fold(handler, |next, interceptor| {
            let wrapped: Arc<dyn ServerCallHandler<Req, Resp>> =
                Arc::new(InterceptedHandler::new(interceptor, next));
            wrapped
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
