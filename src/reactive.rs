/*!
Abstract capability sets for the reactive primitives the engine consumes but does not implement:
event sources, schedulers/workers, subjects, and cancellation handles (see §6 of the design). Any
compatible implementation may be plugged in; this module also ships the minimal synchronous
adapters the crate's own tests use, in the spirit of the "implementations should expose scheduler
adapters (immediate, current-context, single-worker serialized, thread-pool)" design note.

None of the adapters here are meant to be a production reactive-streams library — callers who need
genuine multi-threaded scheduling, backpressure, or hot/cold observable semantics should plug in
their own `EventSource`/`Scheduler` built on whatever executor they already run (a thread pool, an
async runtime's task spawner, and so on).
*/

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

// ------------------------------------------------------------------------------------------------
// Public Traits
// ------------------------------------------------------------------------------------------------

/// A lazy, possibly-infinite sequence of values of type `V`.
pub trait EventSource<V> {
    /// Subscribe to this source. `on_next` is called for every emitted value, `on_error` at most
    /// once before the subscription ends, `on_complete` at most once on normal termination.
    fn subscribe(
        &self,
        worker: &dyn Worker,
        on_next: Rc<dyn Fn(V)>,
        on_error: Rc<dyn Fn(Rc<crate::error::Error>)>,
        on_complete: Rc<dyn Fn()>,
    ) -> Box<dyn CancellationHandle>;

    /// Structural equality with another source of the same value type, used by the trigger
    /// composer to merge "equally triggered" ancestor cohorts. Sources that cannot support this
    /// (most cannot) return `None`; the composer then treats every transition as its own cohort.
    fn equality_key(&self) -> Option<TriggerKey> {
        None
    }
}

/// Schedules zero-argument closures, either immediately or after a delay, and can produce a
/// "serialized" worker that guarantees strict ordering of the work submitted to it.
pub trait Scheduler {
    fn worker(&self) -> Box<dyn Worker>;
}

/// The unit of scheduling. A `Worker` obtained from a [`Scheduler`] is handed to every
/// `EventSource::subscribe` call the engine makes for the lifetime of one `assemble`.
pub trait Worker {
    /// Schedule `action` to run as soon as the worker is free to run it.
    fn schedule(&self, action: Box<dyn FnOnce()>) -> Box<dyn CancellationHandle>;

    /// Schedule `action` to run once, no sooner than `delay` from now. Implementations that
    /// cannot honour real time (e.g. a virtual-time test scheduler) may run the closure
    /// immediately, as long as doing so does not violate the ordering guarantees in §5.
    fn schedule_after(&self, delay: Duration, action: Box<dyn FnOnce()>) -> Box<dyn CancellationHandle>;

    /// True if this worker guarantees that work scheduled on it runs strictly in submission
    /// order and never concurrently with itself.
    fn is_serialized(&self) -> bool;
}

/// A mutable event source: an input side (`on_next`/`on_error`/`on_completed`) and a read side
/// that is itself an [`EventSource`]. The engine uses subjects to publish taken transitions and
/// to synthesize completion triggers.
pub trait Subject<V>: EventSource<V> {
    fn on_next(&self, value: V);
    fn on_error(&self, error: Rc<crate::error::Error>);
    fn on_completed(&self);
}

/// A cancellation handle, or composite lifetime: cancellation is idempotent and propagates to
/// every sub-handle added before cancellation.
pub trait CancellationHandle {
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

/// Opaque equality key returned by [`EventSource::equality_key`]; two triggers are "equally
/// triggered" (§4.3) iff their keys compare equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TriggerKey(pub String);

// ------------------------------------------------------------------------------------------------
// CompositeCancellation: the engine's own `lifetime` / `state_lifetime` handles
// ------------------------------------------------------------------------------------------------

/// A handle that owns a growable set of child handles; cancelling it cancels every child exactly
/// once, and further children added after cancellation are cancelled immediately on add.
#[derive(Default, Clone)]
pub struct CompositeCancellation {
    inner: Rc<RefCell<CompositeInner>>,
}

#[derive(Default)]
struct CompositeInner {
    cancelled: bool,
    children: Vec<Box<dyn CancellationHandle>>,
}

impl CompositeCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child handle; if this composite is already cancelled, cancel it immediately instead
    /// of storing it, so there is no window where a late add escapes cancellation.
    pub fn add(&self, child: Box<dyn CancellationHandle>) {
        let mut inner = self.inner.borrow_mut();
        if inner.cancelled {
            drop(inner);
            child.cancel();
        } else {
            inner.children.push(child);
        }
    }
}

impl CancellationHandle for CompositeCancellation {
    fn cancel(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.cancelled {
            return;
        }
        inner.cancelled = true;
        let children = std::mem::take(&mut inner.children);
        drop(inner);
        for child in children {
            child.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }
}

/// A handle with no effect; used where a cancellation handle is required syntactically but there
/// is nothing to cancel (e.g. a trigger that has already fired and completed).
pub struct NoopCancellation;

impl CancellationHandle for NoopCancellation {
    fn cancel(&self) {}
    fn is_cancelled(&self) -> bool {
        false
    }
}

// ------------------------------------------------------------------------------------------------
// ImmediateScheduler: runs everything synchronously, in submission order, on the calling thread
// ------------------------------------------------------------------------------------------------

/// The scheduler adapter used by the crate's own tests and recommended as the default for callers
/// who want the "common case" described in §5: strict ordering, no background threads. `schedule`
/// and `schedule_after` both run the action synchronously and in FIFO order relative to any other
/// action currently draining the queue, so re-entrant scheduling (an action that itself schedules
/// more work) cannot interleave with a sibling action.
#[derive(Default, Clone)]
pub struct ImmediateScheduler {
    queue: Rc<RefCell<VecDeque<Box<dyn FnOnce()>>>>,
    draining: Rc<RefCell<bool>>,
}

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, action: Box<dyn FnOnce()>) {
        self.queue.borrow_mut().push_back(action);
        if *self.draining.borrow() {
            return;
        }
        *self.draining.borrow_mut() = true;
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some(action) => action(),
                None => break,
            }
        }
        *self.draining.borrow_mut() = false;
    }
}

impl Scheduler for ImmediateScheduler {
    fn worker(&self) -> Box<dyn Worker> {
        Box::new(self.clone())
    }
}

impl Worker for ImmediateScheduler {
    fn schedule(&self, action: Box<dyn FnOnce()>) -> Box<dyn CancellationHandle> {
        self.enqueue(action);
        Box::new(NoopCancellation)
    }

    fn schedule_after(&self, _delay: Duration, action: Box<dyn FnOnce()>) -> Box<dyn CancellationHandle> {
        // A virtual-time scheduler: there is no real clock, so a one-shot timer "elapses"
        // as soon as nothing else is scheduled ahead of it. Good enough for deterministic tests;
        // callers who need real timeouts supply their own `Worker`.
        self.enqueue(action);
        Box::new(NoopCancellation)
    }

    fn is_serialized(&self) -> bool {
        true
    }
}

// ------------------------------------------------------------------------------------------------
// SimpleSubject: the reference Subject implementation, good enough for the public transition feed
// ------------------------------------------------------------------------------------------------

/// A minimal [`Subject`] backed by a `Vec` of observer callbacks. Subscriptions are "hot": a new
/// subscriber only sees values emitted after it subscribes.
pub struct SimpleSubject<V> {
    observers: RefCell<Vec<Observer<V>>>,
    completed: RefCell<bool>,
}

struct Observer<V> {
    on_next: Rc<dyn Fn(V)>,
    on_error: Rc<dyn Fn(Rc<crate::error::Error>)>,
    on_complete: Rc<dyn Fn()>,
    cancelled: Rc<RefCell<bool>>,
}

impl<V: Clone> Default for SimpleSubject<V> {
    fn default() -> Self {
        Self {
            observers: RefCell::new(Vec::new()),
            completed: RefCell::new(false),
        }
    }
}

impl<V: Clone> SimpleSubject<V> {
    pub fn new() -> Self {
        Self::default()
    }
}

struct ObserverHandle {
    cancelled: Rc<RefCell<bool>>,
}

impl CancellationHandle for ObserverHandle {
    fn cancel(&self) {
        *self.cancelled.borrow_mut() = true;
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

impl<V: Clone + 'static> EventSource<V> for SimpleSubject<V> {
    fn subscribe(
        &self,
        _worker: &dyn Worker,
        on_next: Rc<dyn Fn(V)>,
        on_error: Rc<dyn Fn(Rc<crate::error::Error>)>,
        on_complete: Rc<dyn Fn()>,
    ) -> Box<dyn CancellationHandle> {
        let cancelled = Rc::new(RefCell::new(false));
        if *self.completed.borrow() {
            on_complete();
        } else {
            self.observers.borrow_mut().push(Observer {
                on_next,
                on_error,
                on_complete,
                cancelled: cancelled.clone(),
            });
        }
        Box::new(ObserverHandle { cancelled })
    }
}

impl<V: Clone + 'static> Subject<V> for SimpleSubject<V> {
    fn on_next(&self, value: V) {
        if *self.completed.borrow() {
            return;
        }
        let observers = self.observers.borrow();
        for observer in observers.iter() {
            if !*observer.cancelled.borrow() {
                (observer.on_next)(value.clone());
            }
        }
    }

    fn on_error(&self, error: Rc<crate::error::Error>) {
        if *self.completed.borrow() {
            return;
        }
        *self.completed.borrow_mut() = true;
        for observer in self.observers.borrow().iter() {
            if !*observer.cancelled.borrow() {
                (observer.on_error)(error.clone());
            }
        }
    }

    fn on_completed(&self) {
        if *self.completed.borrow() {
            return;
        }
        *self.completed.borrow_mut() = true;
        for observer in self.observers.borrow().iter() {
            if !*observer.cancelled.borrow() {
                (observer.on_complete)();
            }
        }
    }
}
