//! Timeout authority for server calls.
//!
//! Owns the deadline timers of every guarded call and decides when the thread
//! running a handler gets interrupted. Timers run on a tokio runtime; the
//! guarded work itself runs synchronously on whatever worker thread the
//! transport picked.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use rpcguard_core::interrupt::{self, Interrupter};
use rpcguard_core::{
    CancellableContext, Code, Context, ListenerId, Metadata, ServerCall, Status,
};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::service::config::TimeoutConfig;

/// Description attached to the status of calls closed at their deadline.
pub const TIMEOUT_DESCRIPTION: &str = "server call timeout";

// ---------------------------------------------------------------------------
// ServerTimeoutManager
// ---------------------------------------------------------------------------

/// Creates call-scoped timeout contexts and runs handler work under
/// interruption protection.
///
/// Shared by every call on a server; all bookkeeping is internally
/// synchronized.
pub struct ServerTimeoutManager {
    config: ArcSwap<TimeoutConfig>,
    runtime: Handle,
    /// Armed deadline timers keyed by timer id.
    pending: Arc<DashMap<u64, AbortHandle>>,
    next_timer_id: AtomicU64,
    shut_down: AtomicBool,
}

impl ServerTimeoutManager {
    /// Creates a manager whose deadline timers run on `runtime`.
    #[must_use]
    pub fn new(config: TimeoutConfig, runtime: Handle) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            runtime,
            pending: Arc::new(DashMap::new()),
            next_timer_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> Arc<TimeoutConfig> {
        self.config.load_full()
    }

    /// Replaces the configuration. Calls already started keep their deadline.
    pub fn update_config(&self, config: TimeoutConfig) {
        self.config.store(Arc::new(config));
        tracing::info!("server call timeout configuration updated");
    }

    /// Number of deadline timers currently armed.
    #[must_use]
    pub fn pending_timeouts(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stops guarding new calls and disarms every pending timer.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut disarmed = 0usize;
        for id in ids {
            if let Some((_, timer)) = self.pending.remove(&id) {
                timer.abort();
                disarmed += 1;
            }
        }
        tracing::info!(disarmed, "server timeout manager shut down");
    }

    /// Begins a cancellable, call-scoped context for `call`.
    ///
    /// The context is a child of the calling thread's current context, so
    /// ambient values and cancellation are inherited. When the deadline passes
    /// the context is cancelled with `DEADLINE_EXCEEDED` and `call` is closed
    /// with the same status.
    ///
    /// Returns `None` when no timeout applies to the call's method or the
    /// manager was shut down; the call then proceeds unguarded.
    pub fn start_timeout_context<Req, Resp>(
        &self,
        call: &Arc<dyn ServerCall<Req, Resp>>,
    ) -> Option<CancellableContext>
    where
        Req: 'static,
        Resp: 'static,
    {
        let method = call.method_descriptor().full_name().to_string();
        if self.is_shutdown() {
            tracing::debug!(method = %method, "timeout manager shut down; call runs unguarded");
            return None;
        }
        let Some(timeout) = self.config.load().timeout_for(&method) else {
            tracing::debug!(method = %method, "no timeout configured; call runs unguarded");
            return None;
        };

        let context = Context::current().with_deadline_after(timeout);
        let deadline = context.deadline().unwrap_or_else(|| Instant::now() + timeout);

        // Registered first so the call is closed before any handler thread
        // observes its interruption.
        let closer = Arc::clone(call);
        context.add_listener(move |cause| {
            if is_deadline_expiry(cause) {
                closer.close(
                    Status::deadline_exceeded(TIMEOUT_DESCRIPTION),
                    Metadata::new(),
                );
            }
        });

        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let timer_context = context.clone();
        let pending = Arc::clone(&self.pending);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            pending.remove(&id);
            if timer_context.cancel(Some(Status::deadline_exceeded(TIMEOUT_DESCRIPTION))) {
                metrics::counter!("rpc_server_call_timeouts_total").increment(1);
                tracing::warn!(method = %method, timeout_ms, "server call timed out");
            }
        });
        self.pending.insert(id, timer.abort_handle());

        // Any other terminal transition disarms the timer. If the timer already
        // fired this runs immediately and removes nothing.
        let pending = Arc::clone(&self.pending);
        context.add_listener(move |_| {
            if let Some((_, timer)) = pending.remove(&id) {
                timer.abort();
            }
        });

        Some(context)
    }

    /// Runs `work` on the current thread with `context` attached.
    ///
    /// If the context's deadline passes while `work` runs, the current thread
    /// is interrupted exactly once; the interrupt is cleared again before this
    /// returns, so the thread's next unit of work starts clean. When the
    /// context is already cancelled `work` is skipped and `false` is returned.
    pub fn with_interruption(&self, context: &CancellableContext, work: impl FnOnce()) -> bool {
        if context.is_cancelled() {
            tracing::debug!("call context already cancelled; skipping guarded work");
            return false;
        }
        if !self.config.load().interrupt {
            context.run(work);
            return true;
        }

        let target = Arc::new(InterruptTarget::new(interrupt::current()));
        let trigger = Arc::clone(&target);
        let registration = context.add_listener(move |cause| {
            if is_deadline_expiry(cause) {
                trigger.interrupt();
            }
        });

        let _finish = FinishGuard {
            target: &target,
            context,
            registration,
        };
        context.run(work);
        true
    }
}

impl std::fmt::Debug for ServerTimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTimeoutManager")
            .field("config", &self.config.load())
            .field("pending_timeouts", &self.pending.len())
            .field("shut_down", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

fn is_deadline_expiry(cause: Option<&Status>) -> bool {
    cause.is_some_and(|status| status.code() == Code::DeadlineExceeded)
}

// ---------------------------------------------------------------------------
// Interruption bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Running,
    Interrupted,
    Finished,
}

/// The thread executing one guarded unit of work. Interrupts it at most once
/// and never after the work finished.
struct InterruptTarget {
    interrupter: Interrupter,
    state: Mutex<TargetState>,
}

impl InterruptTarget {
    fn new(interrupter: Interrupter) -> Self {
        Self {
            interrupter,
            state: Mutex::new(TargetState::Running),
        }
    }

    fn interrupt(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TargetState::Running {
            return false;
        }
        self.interrupter.interrupt();
        *state = TargetState::Interrupted;
        metrics::counter!("rpc_server_call_interruptions_total").increment(1);
        tracing::warn!(
            thread = self.interrupter.thread().name().unwrap_or("<unnamed>"),
            "interrupted handler thread after call timeout"
        );
        true
    }

    /// Must run on the target thread.
    fn finish(&self) {
        let mut state = self.state.lock();
        if *state == TargetState::Interrupted {
            // Clear whatever the handler left unconsumed.
            let _ = interrupt::interrupted();
        }
        *state = TargetState::Finished;
    }
}

/// Ends interruption protection when the guarded work returns or unwinds.
struct FinishGuard<'a> {
    target: &'a InterruptTarget,
    context: &'a CancellableContext,
    registration: ListenerId,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.target.finish();
        self.context.remove_listener(self.registration);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
