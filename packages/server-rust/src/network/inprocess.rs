//! In-process transport.
//!
//! Each call gets its own blocking worker that drives the call's listener
//! strictly sequentially from an event queue fed by the client side. The
//! client observes the call as finished as soon as the server closes it,
//! independently of when the handler actually returns.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rpcguard_core::{
    intercept, Metadata, MethodDescriptor, MethodType, ServerCall, ServerCallHandler,
    ServerInterceptor, Status,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use super::shutdown::{ServingState, ShutdownController};
use crate::service::registry::HandlerRegistry;

// ---------------------------------------------------------------------------
// InProcessServer
// ---------------------------------------------------------------------------

/// Serves the methods of a [`HandlerRegistry`] to callers in the same process.
pub struct InProcessServer<Req, Resp> {
    registry: Arc<HandlerRegistry<Req, Resp>>,
    interceptors: Vec<Arc<dyn ServerInterceptor<Req, Resp>>>,
    runtime: Handle,
    shutdown: ShutdownController,
    next_call_id: AtomicU64,
}

impl<Req, Resp> InProcessServer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Creates a server that runs call workers on `runtime`'s blocking pool.
    /// The server is serving immediately.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry<Req, Resp>>, runtime: Handle) -> Self {
        let shutdown = ShutdownController::new();
        shutdown.set_serving();
        Self {
            registry,
            interceptors: Vec::new(),
            runtime,
            shutdown,
            next_call_id: AtomicU64::new(1),
        }
    }

    /// Installs an interceptor in front of every method. Interceptors added
    /// later see each call first.
    #[must_use]
    pub fn with_interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: ServerInterceptor<Req, Resp> + 'static,
    {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry<Req, Resp>> {
        &self.registry
    }

    #[must_use]
    pub fn state(&self) -> ServingState {
        self.shutdown.state()
    }

    #[must_use]
    pub fn in_flight_calls(&self) -> u64 {
        self.shutdown.in_flight_count()
    }

    /// Starts a call to `method`. Messages, half-close and cancellation are
    /// sent through the returned [`PendingCall`].
    ///
    /// Unknown methods are closed with `UNIMPLEMENTED`; calls started while
    /// the server is not serving are closed with `UNAVAILABLE`.
    pub fn start_call(&self, method: &str, headers: Metadata) -> PendingCall<Req, Resp> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let Some(definition) = self.registry.lookup(method) else {
            tracing::debug!(method, "call to unknown method");
            let descriptor = MethodDescriptor::new(method, MethodType::Unknown);
            let call = Arc::new(InProcessServerCall::new(descriptor, &events_tx));
            call.close(
                Status::unimplemented(format!("method not found: {method}")),
                Metadata::new(),
            );
            return PendingCall::new(call, events_tx);
        };

        let descriptor = definition.descriptor().clone();
        let call = Arc::new(InProcessServerCall::new(descriptor, &events_tx));
        let Some(in_flight) = self.shutdown.admit() else {
            call.close(
                Status::unavailable("server is not serving"),
                Metadata::new(),
            );
            return PendingCall::new(call, events_tx);
        };

        let handler = intercept(
            Arc::clone(definition.handler()),
            self.interceptors.iter().cloned(),
        );
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let driven = Arc::clone(&call);
        self.runtime.spawn_blocking(move || {
            let span = tracing::debug_span!(
                "call",
                call_id,
                method = driven.method_descriptor().full_name()
            );
            let _entered = span.enter();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                drive(handler.as_ref(), &driven, headers, events_rx);
            }));
            if outcome.is_err() {
                tracing::error!("call driver panicked");
                driven.close(Status::internal("call driver panicked"), Metadata::new());
            }
            drop(in_flight);
        });

        PendingCall::new(call, events_tx)
    }

    /// Performs a unary call.
    pub async fn unary(&self, method: &str, request: Req) -> CallOutcome<Resp> {
        let call = self.start_call(method, Metadata::new());
        call.send_message(request);
        call.half_close();
        call.outcome().await
    }

    /// Performs a client-streaming call with all of `requests`.
    pub async fn client_streaming(
        &self,
        method: &str,
        requests: impl IntoIterator<Item = Req>,
    ) -> CallOutcome<Resp> {
        let call = self.start_call(method, Metadata::new());
        for request in requests {
            call.send_message(request);
        }
        call.half_close();
        call.outcome().await
    }

    /// Refuses new calls and waits up to `timeout` for in-flight calls to
    /// finish. Returns whether the server drained completely.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.trigger_shutdown();
        self.shutdown.wait_for_drain(timeout).await
    }
}

/// Feeds queued events to the call's listener until the call ends.
fn drive<Req, Resp>(
    handler: &dyn ServerCallHandler<Req, Resp>,
    call: &Arc<InProcessServerCall<Req, Resp>>,
    headers: Metadata,
    mut events: mpsc::UnboundedReceiver<Event<Req>>,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let as_call: Arc<dyn ServerCall<Req, Resp>> = call.clone();
    let mut listener = handler.start_call(as_call, headers);
    listener.on_ready();

    loop {
        match events.blocking_recv() {
            Some(Event::Message(message)) => {
                if call.is_closed() {
                    continue;
                }
                listener.on_message(message);
            }
            Some(Event::HalfClose) => {
                if !call.is_closed() {
                    listener.on_half_close();
                }
            }
            Some(Event::Closed) => {
                listener.on_complete();
                return;
            }
            Some(Event::Cancel) => {
                listener.on_cancel();
                return;
            }
            None => {
                // Every client handle is gone without a cancel.
                if call.is_closed() && !call.is_cancelled() {
                    listener.on_complete();
                } else {
                    call.cancel_by_client();
                    listener.on_cancel();
                }
                return;
            }
        }
    }
}

enum Event<Req> {
    Message(Req),
    HalfClose,
    Cancel,
    /// The server closed the call.
    Closed,
}

// ---------------------------------------------------------------------------
// InProcessServerCall
// ---------------------------------------------------------------------------

struct Closed {
    status: Status,
    trailers: Metadata,
    at: Instant,
}

struct CallState<Resp> {
    headers: Option<Metadata>,
    messages: Vec<Resp>,
    closed: Option<Closed>,
}

/// Server side of one in-process call. Records everything the server sends
/// and ignores writes once the call is closed or cancelled.
struct InProcessServerCall<Req, Resp> {
    descriptor: MethodDescriptor,
    state: Mutex<CallState<Resp>>,
    cancelled: AtomicBool,
    closed_tx: watch::Sender<bool>,
    events: mpsc::WeakUnboundedSender<Event<Req>>,
}

impl<Req, Resp> InProcessServerCall<Req, Resp> {
    fn new(descriptor: MethodDescriptor, events: &mpsc::UnboundedSender<Event<Req>>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            descriptor,
            state: Mutex::new(CallState {
                headers: None,
                messages: Vec::new(),
                closed: None,
            }),
            cancelled: AtomicBool::new(false),
            closed_tx,
            events: events.downgrade(),
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    /// Marks the call cancelled by the client. If the server had not closed it
    /// yet, the client sees `CANCELLED`.
    fn cancel_by_client(&self) {
        self.cancelled.store(true, Ordering::Release);
        let mut state = self.state.lock();
        if state.closed.is_none() {
            state.closed = Some(Closed {
                status: Status::cancelled("client cancelled"),
                trailers: Metadata::new(),
                at: Instant::now(),
            });
            drop(state);
            self.closed_tx.send_replace(true);
        }
    }
}

impl<Req, Resp> ServerCall<Req, Resp> for InProcessServerCall<Req, Resp>
where
    Req: Send,
    Resp: Send,
{
    fn request(&self, _num_messages: usize) {
        // Messages are delivered as soon as the client sends them.
    }

    fn send_headers(&self, headers: Metadata) {
        let mut state = self.state.lock();
        if state.closed.is_some() || self.is_cancelled() {
            tracing::debug!("headers sent on a finished call ignored");
            return;
        }
        state.headers = Some(headers);
    }

    fn send_message(&self, message: Resp) {
        let mut state = self.state.lock();
        if state.closed.is_some() || self.is_cancelled() {
            tracing::debug!("message sent on a finished call ignored");
            return;
        }
        state.messages.push(message);
    }

    fn close(&self, status: Status, trailers: Metadata) {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            tracing::debug!(status = %status, "close of a finished call ignored");
            return;
        }
        tracing::debug!(status = %status, "call closed");
        state.closed = Some(Closed {
            status,
            trailers,
            at: Instant::now(),
        });
        drop(state);
        if let Some(events) = self.events.upgrade() {
            let _ = events.send(Event::Closed);
        }
        self.closed_tx.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn method_descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }
}

// ---------------------------------------------------------------------------
// PendingCall / CallOutcome
// ---------------------------------------------------------------------------

/// Client side of an in-process call.
pub struct PendingCall<Req, Resp> {
    call: Arc<InProcessServerCall<Req, Resp>>,
    events: mpsc::UnboundedSender<Event<Req>>,
    started: Instant,
}

impl<Req, Resp> PendingCall<Req, Resp>
where
    Req: Send,
    Resp: Send,
{
    fn new(
        call: Arc<InProcessServerCall<Req, Resp>>,
        events: mpsc::UnboundedSender<Event<Req>>,
    ) -> Self {
        Self {
            call,
            events,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn method_descriptor(&self) -> &MethodDescriptor {
        &self.call.descriptor
    }

    /// Sends a request message. Dropped if the call already ended.
    pub fn send_message(&self, message: Req) {
        let _ = self.events.send(Event::Message(message));
    }

    /// Signals that no more request messages follow.
    pub fn half_close(&self) {
        let _ = self.events.send(Event::HalfClose);
    }

    /// Cancels the call. The server's listener sees `on_cancel` after any
    /// callback currently running; the client sees `CANCELLED` unless the
    /// server closed the call first.
    pub fn cancel(&self) {
        self.call.cancel_by_client();
        let _ = self.events.send(Event::Cancel);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.call.is_closed()
    }

    /// Waits until the call is closed and returns what the server sent.
    pub async fn outcome(self) -> CallOutcome<Resp> {
        let mut closed = self.call.closed_tx.subscribe();
        // The sender lives in `self.call`, so this only returns once closed.
        let _ = closed.wait_for(|closed| *closed).await;

        let mut state = self.call.state.lock();
        let (status, trailers, at) = match state.closed.take() {
            Some(closed) => (closed.status, closed.trailers, closed.at),
            None => (
                Status::internal("call ended without a status"),
                Metadata::new(),
                Instant::now(),
            ),
        };
        CallOutcome {
            headers: state.headers.take(),
            messages: std::mem::take(&mut state.messages),
            status,
            trailers,
            elapsed: at.saturating_duration_since(self.started),
        }
    }
}

/// Everything the client observed for one finished call.
#[derive(Debug)]
pub struct CallOutcome<Resp> {
    pub headers: Option<Metadata>,
    pub messages: Vec<Resp>,
    pub status: Status,
    pub trailers: Metadata,
    /// Time from starting the call until it was closed.
    pub elapsed: Duration,
}

impl<Resp> CallOutcome<Resp> {
    /// The single response of a successful call.
    ///
    /// # Errors
    ///
    /// Returns the call's status if it did not complete with `OK`, or
    /// `INTERNAL` if an `OK` call carried no response message.
    pub fn into_result(self) -> Result<Resp, Status> {
        if !self.status.is_ok() {
            return Err(self.status);
        }
        self.messages
            .into_iter()
            .next()
            .ok_or_else(|| Status::internal("no response message"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rpcguard_core::{BoxListener, Code, ServerCallListener};

    use super::*;
    use crate::service::stub::{client_streaming_call, unary_call};

    fn echo_server() -> InProcessServer<String, String> {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(
            "echo.Echo/Say",
            MethodType::Unary,
            unary_call(|s: String| Ok(s.to_uppercase())),
        );
        registry.register(
            "echo.Echo/Join",
            MethodType::ClientStreaming,
            client_streaming_call(|v: Vec<String>| Ok(v.join("+"))),
        );
        InProcessServer::new(registry, Handle::current())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unary_round_trip() {
        let server = echo_server();
        let outcome = server.unary("echo.Echo/Say", "hi".to_string()).await;
        assert!(outcome.headers.is_some());
        assert_eq!(outcome.into_result().unwrap(), "HI");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_streaming_round_trip() {
        let server = echo_server();
        let outcome = server
            .client_streaming("echo.Echo/Join", ["a", "b"].map(String::from))
            .await;
        assert_eq!(outcome.into_result().unwrap(), "a+b");
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let server = echo_server();
        let outcome = server.unary("echo.Echo/Shout", "hi".to_string()).await;
        assert_eq!(outcome.status.code(), Code::Unimplemented);
        assert!(outcome.messages.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_refuses_new_calls() {
        let server = echo_server();
        assert!(server.shutdown(Duration::from_secs(1)).await);
        assert_eq!(server.state(), ServingState::Stopped);

        let outcome = server.unary("echo.Echo/Say", "hi".to_string()).await;
        assert_eq!(outcome.status.code(), Code::Unavailable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_running_call() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(
            "slow.Slow/Run",
            MethodType::Unary,
            unary_call(|s: String| {
                std::thread::sleep(Duration::from_millis(100));
                Ok(s)
            }),
        );
        let server = InProcessServer::new(registry, Handle::current());

        let call = server.start_call("slow.Slow/Run", Metadata::new());
        call.send_message("x".to_string());
        call.half_close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.in_flight_calls(), 1);

        assert!(server.shutdown(Duration::from_secs(2)).await);
        assert_eq!(call.outcome().await.status.code(), Code::Ok);
    }

    /// Listener recording its callbacks, for observing the driver.
    struct Recorder {
        log: Log,
        call: Arc<dyn ServerCall<String, String>>,
        close_on_message: bool,
    }

    impl ServerCallListener<String> for Recorder {
        fn on_message(&mut self, _message: String) {
            self.log.lock().push("message");
            if self.close_on_message {
                self.call
                    .close(Status::invalid_argument("rejected"), Metadata::new());
            }
        }
        fn on_half_close(&mut self) {
            self.log.lock().push("half_close");
        }
        fn on_cancel(&mut self) {
            self.log.lock().push("cancel");
        }
        fn on_complete(&mut self) {
            self.log.lock().push("complete");
        }
        fn on_ready(&mut self) {
            self.log.lock().push("ready");
        }
    }

    struct RecorderHandler {
        log: Log,
        close_on_message: bool,
    }

    impl ServerCallHandler<String, String> for RecorderHandler {
        fn start_call(
            &self,
            call: Arc<dyn ServerCall<String, String>>,
            _headers: Metadata,
        ) -> BoxListener<String> {
            Box::new(Recorder {
                log: Arc::clone(&self.log),
                call,
                close_on_message: self.close_on_message,
            })
        }
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder_server(close_on_message: bool) -> (InProcessServer<String, String>, Log) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(
            "rec.Rec/Run",
            MethodType::Unary,
            RecorderHandler {
                log: Arc::clone(&log),
                close_on_message,
            },
        );
        (InProcessServer::new(registry, Handle::current()), log)
    }

    async fn wait_for_log(log: &Mutex<Vec<&'static str>>, last: &str) {
        for _ in 0..200 {
            if log.lock().last().is_some_and(|entry| *entry == last) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("listener never reached {last}: {:?}", log.lock());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_cancel_delivers_on_cancel() {
        let (server, log) = recorder_server(false);
        let call = server.start_call("rec.Rec/Run", Metadata::new());
        call.send_message("x".to_string());
        wait_for_log(&log, "message").await;
        call.cancel();

        let outcome = call.outcome().await;
        assert_eq!(outcome.status.code(), Code::Cancelled);
        wait_for_log(&log, "cancel").await;
        assert_eq!(*log.lock(), vec!["ready", "message", "cancel"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn server_close_completes_call_early() {
        let (server, log) = recorder_server(true);
        let call = server.start_call("rec.Rec/Run", Metadata::new());
        call.send_message("x".to_string());

        let outcome = call.outcome().await;
        assert_eq!(outcome.status.code(), Code::InvalidArgument);
        wait_for_log(&log, "complete").await;
        assert_eq!(*log.lock(), vec!["ready", "message", "complete"]);
    }

    #[test]
    fn into_result_requires_message() {
        let outcome: CallOutcome<String> = CallOutcome {
            headers: None,
            messages: Vec::new(),
            status: Status::ok(),
            trailers: Metadata::new(),
            elapsed: Duration::ZERO,
        };
        assert_eq!(outcome.into_result().unwrap_err().code(), Code::Internal);
    }
}
