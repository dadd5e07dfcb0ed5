//! Serving state and in-flight call tracking for graceful shutdown.
//!
//! Admission counts a call while holding the state's read lock, and every
//! state transition takes the write lock, so once shutdown is triggered no
//! call can slip in behind a drain check. RAII guards keep the in-flight
//! count accurate even when a call's driver unwinds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

/// Serving state of a server.
///
/// State machine: Starting -> Serving -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    /// Not yet accepting calls.
    Starting,
    Serving,
    /// New calls are refused; calls already admitted run to completion.
    Draining,
    /// Draining finished with no call left in flight.
    Stopped,
}

/// Admits calls while serving and waits for admitted calls on shutdown.
#[derive(Debug)]
pub struct ShutdownController {
    in_flight: Arc<AtomicU64>,
    state: RwLock<ServingState>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            state: RwLock::new(ServingState::Starting),
        }
    }

    pub fn set_serving(&self) {
        *self.state.write() = ServingState::Serving;
    }

    /// Stops admitting new calls.
    pub fn trigger_shutdown(&self) {
        *self.state.write() = ServingState::Draining;
        tracing::info!(
            in_flight = self.in_flight_count(),
            "shutdown triggered; draining calls"
        );
    }

    #[must_use]
    pub fn state(&self) -> ServingState {
        *self.state.read()
    }

    /// Admits one call, returning a guard that counts it as in flight until
    /// dropped. Returns `None` unless serving.
    #[must_use]
    pub fn admit(&self) -> Option<InFlightGuard> {
        let state = self.state.read();
        if *state != ServingState::Serving {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        drop(state);
        Some(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits for in-flight calls to finish, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` once nothing is in flight;
    /// returns `false` if the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let mut state = self.state.write();
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    *state = ServingState::Stopped;
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_flight = self.in_flight_count(),
                    "drain timed out with calls still in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count when dropped, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
