//! End-to-end timeout behavior through the in-process transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rpcguard_core::{interrupt, Code, Context, Metadata, MethodType, Status};
use rpcguard_server::{
    client_streaming_call, unary_call, HandlerRegistry, InProcessServer,
    ServerCallTimeoutInterceptor, ServerTimeoutManager, TimeoutConfig,
};
use tokio::runtime::Handle;

const SLEEP: &str = "test.Work/Sleep";
const STREAM: &str = "test.Work/Stream";
const REJECT: &str = "test.Work/Reject";

/// Counts what handlers observed.
#[derive(Default)]
struct Observed {
    started: AtomicUsize,
    interrupted: AtomicUsize,
    completed: AtomicUsize,
    started_interrupted: AtomicUsize,
}

fn sleeping_handler(
    observed: &Arc<Observed>,
) -> impl Fn(u64) -> Result<u64, Status> + Send + Sync + 'static {
    let observed = Arc::clone(observed);
    move |millis: u64| {
        observed.started.fetch_add(1, Ordering::SeqCst);
        if interrupt::is_interrupted() {
            observed.started_interrupted.fetch_add(1, Ordering::SeqCst);
        }
        match interrupt::sleep(Duration::from_millis(millis)) {
            Ok(()) => {
                observed.completed.fetch_add(1, Ordering::SeqCst);
                Ok(millis)
            }
            Err(interrupted) => {
                observed.interrupted.fetch_add(1, Ordering::SeqCst);
                Err(interrupted.into())
            }
        }
    }
}

struct Fixture {
    server: InProcessServer<u64, u64>,
    manager: Arc<ServerTimeoutManager>,
    observed: Arc<Observed>,
}

fn fixture(config: TimeoutConfig) -> Fixture {
    let observed = Arc::new(Observed::default());
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(
        SLEEP,
        MethodType::Unary,
        unary_call(sleeping_handler(&observed)),
    );
    registry.register(
        REJECT,
        MethodType::Unary,
        unary_call(|millis: u64| {
            interrupt::sleep(Duration::from_millis(millis))?;
            Err::<u64, _>(Status::invalid_argument("work rejected"))
        }),
    );
    let stream_observed = Arc::clone(&observed);
    registry.register(
        STREAM,
        MethodType::ClientStreaming,
        client_streaming_call(move |millis: Vec<u64>| {
            let total = millis.iter().sum();
            match interrupt::sleep(Duration::from_millis(total)) {
                Ok(()) => {
                    stream_observed.completed.fetch_add(1, Ordering::SeqCst);
                    Ok(total)
                }
                Err(interrupted) => {
                    stream_observed.interrupted.fetch_add(1, Ordering::SeqCst);
                    Err(Status::from(interrupted))
                }
            }
        }),
    );

    let manager = Arc::new(ServerTimeoutManager::new(config, Handle::current()));
    let server = InProcessServer::new(registry, Handle::current())
        .with_interceptor(ServerCallTimeoutInterceptor::new(Arc::clone(&manager)));
    Fixture {
        server,
        manager,
        observed,
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_unary_call_times_out_at_deadline() {
    let f = fixture(TimeoutConfig::with_timeout(Duration::from_secs(2)));

    let outcome = f.server.unary(SLEEP, 5_000).await;

    assert_eq!(outcome.status.code(), Code::DeadlineExceeded);
    assert_eq!(outcome.status.description(), Some("server call timeout"));
    assert!(outcome.messages.is_empty());
    assert!(outcome.elapsed >= Duration::from_millis(1_900));
    assert!(outcome.elapsed < Duration::from_millis(4_000));

    eventually(|| f.observed.interrupted.load(Ordering::SeqCst) == 1).await;
    assert_eq!(f.observed.completed.load(Ordering::SeqCst), 0);
    eventually(|| f.manager.pending_timeouts() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fast_unary_call_succeeds() {
    let f = fixture(TimeoutConfig::with_timeout(Duration::from_secs(2)));

    let outcome = f.server.unary(SLEEP, 50).await;

    assert_eq!(outcome.status.code(), Code::Ok);
    assert!(outcome.elapsed < Duration::from_secs(2));
    assert_eq!(outcome.into_result().unwrap(), 50);
    assert_eq!(f.observed.interrupted.load(Ordering::SeqCst), 0);
    eventually(|| f.manager.pending_timeouts() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_call_is_never_interrupted() {
    let f = fixture(TimeoutConfig::with_timeout(Duration::from_millis(200)));

    let outcome = f.server.client_streaming(STREAM, [300, 300]).await;

    assert_eq!(outcome.into_result().unwrap(), 600);
    assert_eq!(f.observed.interrupted.load(Ordering::SeqCst), 0);
    assert_eq!(f.manager.pending_timeouts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_context_leaves_call_unguarded() {
    let f = fixture(
        TimeoutConfig::with_timeout(Duration::from_millis(100))
            .with_method_timeout(SLEEP, Duration::ZERO),
    );

    let outcome = f.server.unary(SLEEP, 300).await;

    assert_eq!(outcome.into_result().unwrap(), 300);
    assert_eq!(f.observed.interrupted.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_ignoring_interrupt_cannot_answer_late() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(
        SLEEP,
        MethodType::Unary,
        unary_call(|millis: u64| {
            std::thread::sleep(Duration::from_millis(millis));
            Ok::<_, Status>(millis)
        }),
    );
    let manager = Arc::new(ServerTimeoutManager::new(
        TimeoutConfig::with_timeout(Duration::from_millis(100)),
        Handle::current(),
    ));
    let server = InProcessServer::new(registry, Handle::current())
        .with_interceptor(ServerCallTimeoutInterceptor::new(Arc::clone(&manager)));

    let outcome = server.unary(SLEEP, 400).await;
    assert_eq!(outcome.status.code(), Code::DeadlineExceeded);
    assert!(outcome.elapsed < Duration::from_millis(400));
    assert!(outcome.messages.is_empty());

    // The late handler still finishes and the call drains.
    assert!(server.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupts_do_not_leak_into_later_calls() {
    let config = TimeoutConfig::with_timeout(Duration::from_millis(50));
    let f = Arc::new(fixture(config));

    for _ in 0..3 {
        let calls: Vec<_> = (0..8)
            .map(|i| {
                let f = Arc::clone(&f);
                // Alternate calls that time out with calls that finish in time.
                let millis = if i % 2 == 0 { 500 } else { 5 };
                tokio::spawn(async move { f.server.unary(SLEEP, millis).await })
            })
            .collect();
        for call in calls {
            let code = call.await.unwrap().status.code();
            assert!(matches!(code, Code::Ok | Code::DeadlineExceeded));
        }
    }

    assert_eq!(f.observed.started_interrupted.load(Ordering::SeqCst), 0);
    assert_eq!(f.observed.completed.load(Ordering::SeqCst), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_see_only_their_own_context() {
    let contexts = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(HandlerRegistry::new());
    let seen = Arc::clone(&contexts);
    registry.register(
        SLEEP,
        MethodType::Unary,
        unary_call(move |millis: u64| {
            let before = Context::current();
            interrupt::sleep(Duration::from_millis(millis))?;
            let after = Context::current();
            assert!(before.ptr_eq(&after));
            assert!(before.deadline().is_some());
            seen.lock().push(before);
            Ok::<_, Status>(millis)
        }),
    );
    let manager = Arc::new(ServerTimeoutManager::new(
        TimeoutConfig::with_timeout(Duration::from_secs(5)),
        Handle::current(),
    ));
    let server = Arc::new(
        InProcessServer::new(registry, Handle::current())
            .with_interceptor(ServerCallTimeoutInterceptor::new(manager)),
    );

    let calls: Vec<_> = (0..16)
        .map(|i| {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.unary(SLEEP, 10 + i % 4 * 10).await })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().status.code(), Code::Ok);
    }

    let contexts = contexts.lock();
    assert_eq!(contexts.len(), 16);
    for (i, a) in contexts.iter().enumerate() {
        for b in &contexts[i + 1..] {
            assert!(!a.ptr_eq(b));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_error_reaches_client_unchanged() {
    let f = fixture(TimeoutConfig::with_timeout(Duration::from_secs(2)));

    let outcome = f.server.unary(REJECT, 20).await;

    assert_eq!(outcome.status.code(), Code::InvalidArgument);
    assert_eq!(outcome.status.description(), Some("work rejected"));
    assert!(outcome.messages.is_empty());
    eventually(|| f.manager.pending_timeouts() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_cancel_is_distinct_from_timeout() {
    let f = fixture(TimeoutConfig::with_timeout(Duration::from_millis(300)));

    let call = f.server.start_call(SLEEP, Metadata::new());
    call.send_message(5_000);
    call.half_close();
    eventually(|| f.observed.started.load(Ordering::SeqCst) == 1).await;
    call.cancel();
    let cancelled = call.outcome().await;

    assert_eq!(cancelled.status.code(), Code::Cancelled);
    assert_eq!(cancelled.status.description(), Some("client cancelled"));
    assert!(cancelled.elapsed < Duration::from_millis(300));

    let timed_out = f.server.unary(SLEEP, 5_000).await;
    assert_eq!(timed_out.status.code(), Code::DeadlineExceeded);
    assert_eq!(timed_out.status.description(), Some("server call timeout"));

    // The cancelled call's handler still runs until its own deadline.
    eventually(|| f.observed.interrupted.load(Ordering::SeqCst) == 2).await;
    assert_eq!(f.observed.completed.load(Ordering::SeqCst), 0);
    eventually(|| f.manager.pending_timeouts() == 0).await;
}
