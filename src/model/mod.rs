/*!
The descriptive model: regions, vertices (states, pseudostates, final states) and transitions,
and the top-level [`StateMachine`] that owns them. These types describe the *structure* of a
state machine; [`crate::engine`] gives that structure a running configuration.

Elements are built detached (via [`crate::builder`]) and then attached into the containment tree
with interior mutability, matching the constructor style already used throughout this crate:
attaching a vertex or region does not require a mutable borrow of its owner, only of the owner's
internal `RefCell`s. A back-reference to an owner is recorded as an [`Id`], never as a strong or
weak pointer, so the tree never needs reference-cycle bookkeeping: a whole subtree is freed by
simply dropping the `Rc` the owner holds, and the registry built at `assemble` time is the only
place identifiers are resolved back into live elements.
*/

use crate::core::Id;
use crate::reactive::EventSource;
use std::cell::{Cell, RefCell};
use std::cmp::Eq;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

mod impls;

// ------------------------------------------------------------------------------------------------
// Shared Behavior Type
// ------------------------------------------------------------------------------------------------

/// An entry, exit, or un-parameterized transition effect: a zero-argument closure run for its
/// side effect only. Triggered-transition guards and effects are bound to the triggering value
/// by [`ErasedEventSource`] instead, since the value's type is erased at the model boundary.
pub type Action = Rc<dyn Fn()>;

// ------------------------------------------------------------------------------------------------
// Erasure boundary for heterogeneous triggers
// ------------------------------------------------------------------------------------------------

/// One occurrence of a triggered transition's event, with guard and action already bound to the
/// value that was emitted. The trigger composer never sees the concrete value type `V`: the
/// [`crate::builder`] closes over it when the transition is built, leaving only these two
/// type-erased thunks.
pub struct Occurrence {
    /// `None` if the transition carries no guard (always enabled).
    pub guard: Option<Box<dyn Fn() -> bool>>,
    pub run_action: Box<dyn FnOnce()>,
}

/// The type-erased half of a triggered transition's trigger. Built by [`crate::builder`] from a
/// concrete `EventSource<V>` plus optional typed guard/action closures; consumed by
/// [`crate::trigger`] when it composes a vertex's merged stream.
pub trait ErasedEventSource {
    fn subscribe(
        &self,
        worker: &dyn crate::reactive::Worker,
        on_occurrence: Rc<dyn Fn(Occurrence)>,
    ) -> Box<dyn crate::reactive::CancellationHandle>;

    fn equality_key(&self) -> Option<crate::reactive::TriggerKey>;
}

/// Binds a concrete `EventSource<V>` plus optional guard/action to the erasure boundary above.
pub struct TypedTrigger<V> {
    source: Rc<dyn EventSource<V>>,
    guard: Option<Rc<dyn Fn(&V) -> bool>>,
    action: Option<Rc<dyn Fn(&V)>>,
}

impl<V: Clone + 'static> TypedTrigger<V> {
    pub fn new(
        source: Rc<dyn EventSource<V>>,
        guard: Option<Rc<dyn Fn(&V) -> bool>>,
        action: Option<Rc<dyn Fn(&V)>>,
    ) -> Self {
        Self { source, guard, action }
    }
}

impl<V: Clone + 'static> ErasedEventSource for TypedTrigger<V> {
    fn subscribe(
        &self,
        worker: &dyn crate::reactive::Worker,
        on_occurrence: Rc<dyn Fn(Occurrence)>,
    ) -> Box<dyn crate::reactive::CancellationHandle> {
        let guard = self.guard.clone();
        let action = self.action.clone();
        self.source.subscribe(
            worker,
            Rc::new(move |value: V| {
                let bound_guard: Option<Box<dyn Fn() -> bool>> = guard.clone().map(|g| {
                    let value = value.clone();
                    Box::new(move || g(&value)) as Box<dyn Fn() -> bool>
                });
                let bound_action: Box<dyn FnOnce()> = match action.clone() {
                    Some(a) => {
                        let value = value.clone();
                        Box::new(move || a(&value))
                    }
                    None => Box::new(|| {}),
                };
                on_occurrence(Occurrence {
                    guard: bound_guard,
                    run_action: bound_action,
                });
            }),
            Rc::new(|_err| {}),
            Rc::new(|| {}),
        )
    }

    fn equality_key(&self) -> Option<crate::reactive::TriggerKey> {
        self.source.equality_key()
    }
}

// ------------------------------------------------------------------------------------------------
// Public Types: StateMachine
// ------------------------------------------------------------------------------------------------

/// The top-level state chart: one or more orthogonal top-level [`Region`]s, assembled once and
/// then run by [`crate::engine`].
pub struct StateMachine {
    pub(crate) id: Id,
    pub(crate) name: String,
    pub(crate) regions: RefCell<Vec<Region>>,
    /// Shared with every region and state transitively attached to this machine. Set once
    /// `assemble` succeeds, after which every `with_*` attach method anywhere in the tree starts
    /// rejecting further mutation with [`crate::error::ErrorKind::NotAllowed`].
    pub(crate) lock: Rc<Cell<bool>>,
    pub(crate) model: RefCell<Option<Rc<crate::validator::AssembledModel>>>,
    /// The running configuration tree, created by `assemble` and torn down by `terminate`.
    pub(crate) engine: RefCell<Option<Rc<crate::engine::Engine>>>,
}

// ------------------------------------------------------------------------------------------------
// Public Types: Region
// ------------------------------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegionOwner {
    StateMachine(Id),
    State(Id),
}

#[derive(Clone)]
pub struct Region(pub(crate) Rc<RegionData>);

pub(crate) struct RegionData {
    pub(crate) id: Id,
    pub(crate) name: RefCell<Option<String>>,
    pub(crate) owner: RefCell<Option<RegionOwner>>,
    pub(crate) attached: Cell<bool>,
    pub(crate) lock: RefCell<Option<Rc<Cell<bool>>>>,
    pub(crate) vertices: RefCell<Vec<Vertex>>,
    pub(crate) transitions: RefCell<Vec<Transition>>,
}

// ------------------------------------------------------------------------------------------------
// Public Types: Vertex (State | Pseudostate | FinalState)
// ------------------------------------------------------------------------------------------------

#[derive(Clone)]
pub enum Vertex {
    State(State),
    Pseudostate(Pseudostate),
    FinalState(FinalState),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateKind {
    Simple,
    Composite,
    Orthogonal,
    SubMachine,
}

#[derive(Clone)]
pub struct State(pub(crate) Rc<StateData>);

pub(crate) struct StateData {
    pub(crate) id: Id,
    pub(crate) name: String,
    pub(crate) owner: RefCell<Option<Id>>,
    pub(crate) attached: Cell<bool>,
    pub(crate) lock: RefCell<Option<Rc<Cell<bool>>>>,
    pub(crate) kind: Cell<StateKind>,
    pub(crate) regions: RefCell<Vec<Region>>,
    pub(crate) sub_machine: RefCell<Option<Id>>,
    pub(crate) entry: RefCell<Option<Action>>,
    pub(crate) exit: RefCell<Option<Action>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PseudostateKind {
    Initial,
    DeepHistory,
    ShallowHistory,
    Join,
    Fork,
    Junction,
    Choice,
    EntryPoint,
    ExitPoint,
    Terminate,
}

#[derive(Clone)]
pub struct Pseudostate(pub(crate) Rc<PseudostateData>);

pub(crate) struct PseudostateData {
    pub(crate) id: Id,
    pub(crate) name: String,
    pub(crate) owner: RefCell<Option<Id>>,
    pub(crate) attached: Cell<bool>,
    pub(crate) kind: PseudostateKind,
}

#[derive(Clone)]
pub struct FinalState(pub(crate) Rc<FinalStateData>);

pub(crate) struct FinalStateData {
    pub(crate) id: Id,
    pub(crate) name: String,
    pub(crate) owner: RefCell<Option<Id>>,
    pub(crate) attached: Cell<bool>,
}

// ------------------------------------------------------------------------------------------------
// Public Types: Transition
// ------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionKind {
    /// Source and target differ; the least common ancestor's vertices on the path are exited and
    /// entered.
    External,
    /// Source is a composite state and target is one of its own (possibly nested) vertices; the
    /// source is not exited or re-entered.
    Local,
    /// Source and target are the same state; no exit or entry occurs at all.
    Internal,
}

/// What causes a transition to become a candidate: a completion event synthesized once every
/// region of its source has reached a final state or is otherwise quiescent, a one-shot timeout
/// started when the source is entered, or an external event of caller-defined type `V` (erased
/// to [`ErasedEventSource`] at build time).
pub enum TransitionTrigger {
    Completion,
    /// A one-shot timer of the given duration, scheduled on the given [`crate::reactive::Scheduler`]
    /// (not necessarily the scheduler passed to `assemble`) the moment the source state is entered,
    /// and cancelled on exit.
    Timeout(Rc<dyn crate::reactive::Scheduler>, Duration),
    Event(Rc<dyn ErasedEventSource>),
}

pub struct UntriggeredBehavior {
    pub(crate) guard: Option<Rc<dyn Fn() -> bool>>,
    pub(crate) action: Option<Action>,
}

#[derive(Clone)]
pub struct Transition(pub(crate) Rc<TransitionData>);

pub(crate) struct TransitionData {
    pub(crate) id: Id,
    pub(crate) name: Option<String>,
    pub(crate) owner: RefCell<Option<Id>>,
    pub(crate) attached: Cell<bool>,
    pub(crate) kind: TransitionKind,
    pub(crate) source: Id,
    pub(crate) target: Option<Id>,
    pub(crate) trigger: TransitionTrigger,
    pub(crate) untriggered: RefCell<Option<UntriggeredBehavior>>,
    /// Set by [`StateMachine::assemble`] once the model is frozen; lets a `Transition` clone held
    /// by a caller resolve its own endpoints without keeping the whole model alive by itself. A
    /// dead weak reference means the owning `StateMachine` (and its assembled model) has been
    /// dropped, which [`Transition::source_state`]/[`Transition::target_state`] report as
    /// [`crate::error::ErrorKind::DeletedError`].
    pub(crate) model: RefCell<std::rc::Weak<crate::validator::AssembledModel>>,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("kind", &self.0.kind)
            .finish()
    }
}
