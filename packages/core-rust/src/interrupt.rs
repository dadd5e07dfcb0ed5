//! Cooperative thread interruption.
//!
//! Each thread owns an interrupt flag. An [`Interrupter`] captured on a thread
//! can raise that flag from anywhere and unparks the thread so that a blocked
//! [`sleep`] wakes up immediately. Code running on the thread observes the
//! flag through [`check`], [`interrupted`] or an interruptible [`sleep`].
//!
//! Nothing forces a thread to stop: work that never checks the flag runs to
//! completion.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crate::status::Status;

struct Flag {
    raised: AtomicBool,
    thread: Thread,
}

thread_local! {
    static FLAG: Arc<Flag> = Arc::new(Flag {
        raised: AtomicBool::new(false),
        thread: thread::current(),
    });
}

/// Returned by interruptible operations when the thread's flag was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("thread interrupted")]
pub struct Interrupted;

impl From<Interrupted> for Status {
    fn from(_: Interrupted) -> Self {
        Status::cancelled("handler interrupted")
    }
}

/// Handle that raises the interrupt flag of one specific thread.
#[derive(Clone)]
pub struct Interrupter {
    flag: Arc<Flag>,
}

impl Interrupter {
    /// Raises the target thread's flag and unparks it.
    pub fn interrupt(&self) {
        self.flag.raised.store(true, Ordering::SeqCst);
        self.flag.thread.unpark();
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.flag.raised.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn thread(&self) -> &Thread {
        &self.flag.thread
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("thread", &self.flag.thread.id())
            .field("raised", &self.is_interrupted())
            .finish()
    }
}

/// Interrupter targeting the calling thread.
#[must_use]
pub fn current() -> Interrupter {
    FLAG.with(|flag| Interrupter {
        flag: Arc::clone(flag),
    })
}

/// Returns whether the calling thread was interrupted and clears the flag.
#[must_use]
pub fn interrupted() -> bool {
    FLAG.with(|flag| flag.raised.swap(false, Ordering::SeqCst))
}

/// Returns whether the calling thread's flag is raised without clearing it.
#[must_use]
pub fn is_interrupted() -> bool {
    FLAG.with(|flag| flag.raised.load(Ordering::SeqCst))
}

/// Fails with [`Interrupted`] (clearing the flag) if the calling thread was
/// interrupted.
///
/// # Errors
///
/// Returns `Interrupted` if the flag was raised.
pub fn check() -> Result<(), Interrupted> {
    if interrupted() {
        Err(Interrupted)
    } else {
        Ok(())
    }
}

/// Blocks the calling thread for `duration` unless it is interrupted first.
///
/// # Errors
///
/// Returns `Interrupted` if the flag is raised before or during the sleep.
pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
    let deadline = Instant::now() + duration;
    loop {
        check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        // Spurious wakeups (stale unpark tokens included) just loop again.
        thread::park_timeout(deadline - now);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
