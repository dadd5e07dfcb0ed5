//! Write-interception shim over a server call.
//!
//! Once a call is guarded by a timeout, two threads may write to it: the
//! handler thread and the timer that closes the call at the deadline. This
//! shim serializes every outbound operation under one lock and drops anything
//! sent after the call was closed, so a handler that finishes late cannot
//! corrupt a call the timer already closed.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use rpcguard_core::{Metadata, MethodDescriptor, ServerCall, Status};

// ---------------------------------------------------------------------------
// SerializingServerCall
// ---------------------------------------------------------------------------

/// Pass-through decorator that serializes outbound writes and suppresses
/// writes issued after close.
pub struct SerializingServerCall<Req, Resp> {
    delegate: Arc<dyn ServerCall<Req, Resp>>,
    closed: Mutex<bool>,
    _request: PhantomData<fn(Req)>,
}

impl<Req, Resp> SerializingServerCall<Req, Resp> {
    #[must_use]
    pub fn new(delegate: Arc<dyn ServerCall<Req, Resp>>) -> Self {
        Self {
            delegate,
            closed: Mutex::new(false),
            _request: PhantomData,
        }
    }

    /// True once `close` went through this shim.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    fn method_name(&self) -> &str {
        self.delegate.method_descriptor().full_name()
    }
}

impl<Req, Resp> ServerCall<Req, Resp> for SerializingServerCall<Req, Resp> {
    fn request(&self, num_messages: usize) {
        let closed = self.closed.lock();
        if !*closed {
            self.delegate.request(num_messages);
        }
    }

    fn send_headers(&self, headers: Metadata) {
        let closed = self.closed.lock();
        if *closed {
            tracing::debug!(method = self.method_name(), "dropping headers sent after close");
            return;
        }
        self.delegate.send_headers(headers);
    }

    fn send_message(&self, message: Resp) {
        let closed = self.closed.lock();
        if *closed {
            tracing::debug!(method = self.method_name(), "dropping message sent after close");
            return;
        }
        self.delegate.send_message(message);
    }

    fn close(&self, status: Status, trailers: Metadata) {
        let mut closed = self.closed.lock();
        if *closed {
            tracing::debug!(
                method = self.method_name(),
                status = %status,
                "ignoring close of an already closed call"
            );
            return;
        }
        *closed = true;
        self.delegate.close(status, trailers);
    }

    fn is_cancelled(&self) -> bool {
        self.delegate.is_cancelled()
    }

    fn is_ready(&self) -> bool {
        self.delegate.is_ready()
    }

    fn method_descriptor(&self) -> &MethodDescriptor {
        self.delegate.method_descriptor()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::thread;

    use rpcguard_core::{Code, MethodType};

    use super::*;

    /// Call that records every outbound operation.
    #[derive(Default)]
    struct LogCall {
        descriptor: Option<MethodDescriptor>,
        log: Mutex<Vec<String>>,
    }

    impl ServerCall<(), u32> for LogCall {
        fn request(&self, num_messages: usize) {
            self.log.lock().push(format!("request:{num_messages}"));
        }
        fn send_headers(&self, _headers: Metadata) {
            self.log.lock().push("headers".to_string());
        }
        fn send_message(&self, message: u32) {
            self.log.lock().push(format!("message:{message}"));
        }
        fn close(&self, status: Status, _trailers: Metadata) {
            self.log.lock().push(format!("close:{}", status.code()));
        }
        fn is_cancelled(&self) -> bool {
            false
        }
        fn method_descriptor(&self) -> &MethodDescriptor {
            self.descriptor.as_ref().unwrap()
        }
    }

    fn log_call() -> Arc<LogCall> {
        Arc::new(LogCall {
            descriptor: Some(MethodDescriptor::new("svc.Test/Run", MethodType::Unary)),
            log: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn passes_writes_through_until_close() {
        let inner = log_call();
        let call = SerializingServerCall::new(inner.clone() as Arc<dyn ServerCall<(), u32>>);

        call.request(1);
        call.send_headers(Metadata::new());
        call.send_message(7);
        call.close(Status::ok(), Metadata::new());

        assert!(call.is_closed());
        assert_eq!(
            *inner.log.lock(),
            vec!["request:1", "headers", "message:7", "close:OK"]
        );
    }

    #[test]
    fn suppresses_writes_after_close() {
        let inner = log_call();
        let call = SerializingServerCall::new(inner.clone() as Arc<dyn ServerCall<(), u32>>);

        call.close(
            Status::deadline_exceeded("server call timeout"),
            Metadata::new(),
        );
        call.send_headers(Metadata::new());
        call.send_message(1);
        call.close(Status::ok(), Metadata::new());

        assert_eq!(*inner.log.lock(), vec!["close:DEADLINE_EXCEEDED"]);
    }

    #[test]
    fn concurrent_closes_reach_delegate_once() {
        let inner = log_call();
        let call = Arc::new(SerializingServerCall::new(
            inner.clone() as Arc<dyn ServerCall<(), u32>>
        ));

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let call = Arc::clone(&call);
                thread::spawn(move || {
                    call.send_message(i);
                    call.close(Status::new(Code::Cancelled), Metadata::new());
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let log = inner.log.lock();
        assert_eq!(log.iter().filter(|e| e.starts_with("close:")).count(), 1);
        // Nothing follows the close.
        assert!(log.last().unwrap().starts_with("close:"));
    }
}
