//! Call-scoped execution contexts and the per-thread ambient context.
//!
//! A [`Context`] is an immutable chain of parent links. Each link may carry a
//! typed value, a deadline, or its own one-shot cancellation state. Deriving a
//! context never mutates the parent; cancellation of a cancellable ancestor
//! propagates to every cancellable descendant.
//!
//! Every thread has an ambient "current" context, the root unless something
//! attached another. [`Context::attach`] / [`Context::detach`] are the raw
//! primitives; [`Context::enter`] pairs them structurally through an RAII
//! guard so the previous context is restored even while unwinding.
//!
//! Deadlines are data only. Whoever owns the timer (the server's timeout
//! manager) is responsible for cancelling a context when its deadline passes.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::status::Status;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

static ROOT: OnceLock<Context> = OnceLock::new();

thread_local! {
    /// `None` means the root context is current.
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

// ---------------------------------------------------------------------------
// ContextKey
// ---------------------------------------------------------------------------

/// Typed key for values stored in a [`Context`].
///
/// Keys compare by identity: two keys created with the same name are distinct.
pub struct ContextKey<T> {
    id: u64,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ContextKey<T> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            _marker: PhantomData,
        }
    }

    /// Looks the key up in the current ambient context.
    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        Context::current().get(self)
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cancellation state
// ---------------------------------------------------------------------------

/// Handle returned when registering a cancellation listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked once when a context is cancelled. Receives the cause;
/// `None` means the context was closed without error.
pub type CancellationListener = Box<dyn FnOnce(Option<&Status>) + Send>;

struct CancelState {
    inner: Mutex<CancelInner>,
}

struct CancelInner {
    cancelled: bool,
    cause: Option<Status>,
    listeners: Vec<(ListenerId, CancellationListener)>,
    next_listener: u64,
    /// Registration on the nearest cancellable ancestor, removed once this
    /// state is cancelled so long-lived parents do not accumulate listeners.
    parent_registration: Option<(Weak<CancelState>, ListenerId)>,
}

impl CancelState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CancelInner {
                cancelled: false,
                cause: None,
                listeners: Vec::new(),
                next_listener: 1,
                parent_registration: None,
            }),
        })
    }

    /// Links `child` to `parent`: cancelling the parent cancels the child with
    /// the same cause. If the parent is already cancelled the child is
    /// cancelled immediately.
    fn link(parent: &Arc<Self>, child: &Arc<Self>) {
        let weak_child = Arc::downgrade(child);
        let id = parent.add_listener(Box::new(move |cause: Option<&Status>| {
            if let Some(child) = weak_child.upgrade() {
                child.cancel(cause.cloned());
            }
        }));

        let mut inner = child.inner.lock();
        if !inner.cancelled {
            inner.parent_registration = Some((Arc::downgrade(parent), id));
        }
    }

    fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    fn cause(&self) -> Option<Status> {
        self.inner.lock().cause.clone()
    }

    fn cancel(&self, cause: Option<Status>) -> bool {
        let (listeners, parent_registration) = {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return false;
            }
            inner.cancelled = true;
            inner.cause.clone_from(&cause);
            (
                std::mem::take(&mut inner.listeners),
                inner.parent_registration.take(),
            )
        };

        if let Some((parent, id)) = parent_registration {
            if let Some(parent) = parent.upgrade() {
                parent.remove_listener(id);
            }
        }

        // Listeners run outside the lock: they are free to query or derive
        // from this context.
        for (_, listener) in listeners {
            listener(cause.as_ref());
        }
        true
    }

    fn add_listener(&self, listener: CancellationListener) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;

        if inner.cancelled {
            let cause = inner.cause.clone();
            drop(inner);
            listener(cause.as_ref());
        } else {
            inner.listeners.push((id, listener));
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.inner.lock().listeners.retain(|(existing, _)| *existing != id);
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

struct Inner {
    parent: Option<Context>,
    entry: Option<(u64, Arc<dyn Any + Send + Sync>)>,
    deadline: Option<Instant>,
    /// Nearest cancellation state on the chain (own or inherited).
    cancellation: Option<Arc<CancelState>>,
}

/// Immutable execution context. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// The root context: no values, no deadline, never cancelled.
    #[must_use]
    pub fn root() -> Self {
        ROOT.get_or_init(|| Self {
            inner: Arc::new(Inner {
                parent: None,
                entry: None,
                deadline: None,
                cancellation: None,
            }),
        })
        .clone()
    }

    /// The context attached to the calling thread, or the root.
    #[must_use]
    pub fn current() -> Self {
        CURRENT
            .with(|current| current.borrow().clone())
            .unwrap_or_else(Self::root)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Derives a child carrying `value` under `key`.
    #[must_use]
    pub fn with_value<T: Send + Sync + 'static>(&self, key: &ContextKey<T>, value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                entry: Some((key.id, Arc::new(value))),
                deadline: self.inner.deadline,
                cancellation: self.inner.cancellation.clone(),
            }),
        }
    }

    /// Looks `key` up along the parent chain, nearest value first.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self, key: &ContextKey<T>) -> Option<Arc<T>> {
        let mut link = Some(self);
        while let Some(ctx) = link {
            if let Some((id, value)) = &ctx.inner.entry {
                if *id == key.id {
                    return Arc::clone(value).downcast::<T>().ok();
                }
            }
            link = ctx.inner.parent.as_ref();
        }
        None
    }

    /// Derives a cancellable child with no deadline of its own.
    #[must_use]
    pub fn with_cancellation(&self) -> CancellableContext {
        self.cancellable_child(self.inner.deadline)
    }

    /// Derives a cancellable child whose deadline is the earlier of `deadline`
    /// and any inherited deadline.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> CancellableContext {
        let effective = match self.inner.deadline {
            Some(inherited) if inherited < deadline => inherited,
            _ => deadline,
        };
        self.cancellable_child(Some(effective))
    }

    #[must_use]
    pub fn with_deadline_after(&self, timeout: Duration) -> CancellableContext {
        self.with_deadline(Instant::now() + timeout)
    }

    fn cancellable_child(&self, deadline: Option<Instant>) -> CancellableContext {
        let state = CancelState::new();
        if let Some(parent_state) = &self.inner.cancellation {
            CancelState::link(parent_state, &state);
        }
        CancellableContext {
            context: Self {
                inner: Arc::new(Inner {
                    parent: Some(self.clone()),
                    entry: None,
                    deadline,
                    cancellation: Some(state),
                }),
            },
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, saturating at zero.
    #[must_use]
    pub fn time_remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .cancellation
            .as_ref()
            .is_some_and(|state| state.is_cancelled())
    }

    /// Cause of cancellation, if cancelled with one.
    #[must_use]
    pub fn cancellation_cause(&self) -> Option<Status> {
        self.inner
            .cancellation
            .as_ref()
            .and_then(|state| state.cause())
    }

    /// Registers a cancellation listener. Returns `None` (and drops the
    /// listener) when nothing on the chain can ever be cancelled.
    pub fn add_listener(
        &self,
        listener: impl FnOnce(Option<&Status>) + Send + 'static,
    ) -> Option<ListenerId> {
        self.inner
            .cancellation
            .as_ref()
            .map(|state| state.add_listener(Box::new(listener)))
    }

    pub fn remove_listener(&self, id: ListenerId) {
        if let Some(state) = &self.inner.cancellation {
            state.remove_listener(id);
        }
    }

    /// Makes this context current on the calling thread and returns the
    /// previously current one, which must be handed back to [`Self::detach`].
    #[must_use = "the previous context must be passed to detach"]
    pub fn attach(&self) -> Self {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(self.clone()));
        previous.unwrap_or_else(Self::root)
    }

    /// Restores `previous` as the current context.
    pub fn detach(&self, previous: Self) {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            let attached = current.as_ref().is_some_and(|ctx| ctx.ptr_eq(self))
                || (current.is_none() && self.is_root());
            if !attached {
                tracing::error!("context detached while not current; restoring previous anyway");
            }
            *current = if previous.is_root() {
                None
            } else {
                Some(previous)
            };
        });
    }

    /// Attaches this context until the returned guard is dropped.
    #[must_use = "the context is detached as soon as the guard is dropped"]
    pub fn enter(&self) -> AttachGuard {
        AttachGuard {
            previous: Some(self.attach()),
            context: self.clone(),
            _not_send: PhantomData,
        }
    }

    /// Runs `f` with this context attached.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _attached = self.enter();
        f()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("root", &self.is_root())
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// AttachGuard
// ---------------------------------------------------------------------------

/// Detaches its context on drop. Not `Send`: it must be dropped on the thread
/// that attached.
pub struct AttachGuard {
    context: Context,
    previous: Option<Context>,
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.context.detach(previous);
        }
    }
}

impl fmt::Debug for AttachGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachGuard")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CancellableContext
// ---------------------------------------------------------------------------

/// A context that owns a one-shot cancellation state.
///
/// Clones share the same state; cancellation happens at most once no matter
/// how many clones race to cancel.
#[derive(Clone, Debug)]
pub struct CancellableContext {
    context: Context,
}

impl CancellableContext {
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    fn state(&self) -> &Arc<CancelState> {
        match &self.context.inner.cancellation {
            Some(state) => state,
            None => unreachable!("cancellable context always owns a cancellation state"),
        }
    }

    /// Cancels the context. Returns `false` if it was already cancelled, in
    /// which case `cause` is discarded and no listener runs again.
    pub fn cancel(&self, cause: Option<Status>) -> bool {
        self.state().cancel(cause)
    }

    pub fn add_listener(
        &self,
        listener: impl FnOnce(Option<&Status>) + Send + 'static,
    ) -> ListenerId {
        self.state().add_listener(Box::new(listener))
    }
}

impl Deref for CancellableContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
