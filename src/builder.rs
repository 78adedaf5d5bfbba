/*!
Fluent construction of the descriptive model. Every `make_*` function creates a detached element;
every `with_*` method attaches one element to another, failing with
[`ErrorKind::NotAllowed`](crate::error::ErrorKind::NotAllowed) once the owning state machine has
been assembled (see [`crate::model::StateMachine::assemble`]).

Transitions are attached through [`TransitionSpec`], a small typestate builder that disambiguates
the three trigger families (completion, triggered, timeout) the way the model distinguishes them,
rather than by overloading a single method on parameter count.
*/

use crate::error::{self, ElementKind, Result};
use crate::model::{
    Action, ErasedEventSource, FinalState, Pseudostate, PseudostateKind, Region, RegionOwner,
    State, StateMachine, Transition, TransitionKind, TransitionTrigger, TypedTrigger,
    UntriggeredBehavior, Vertex,
};
use crate::reactive::{EventSource, Scheduler};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

// ------------------------------------------------------------------------------------------------
// Detached element constructors
// ------------------------------------------------------------------------------------------------

pub fn make_state(name: &str) -> State {
    State::new(name)
}

pub fn make_final_state(name: &str) -> FinalState {
    FinalState::new(name)
}

pub fn make_pseudostate(name: &str, kind: PseudostateKind) -> Pseudostate {
    Pseudostate::new(name, kind)
}

pub fn make_region(name: &str) -> Region {
    Region::new(Some(name))
}

pub fn make_state_machine(name: &str) -> StateMachine {
    StateMachine::new(name)
}

// ------------------------------------------------------------------------------------------------
// StateMachine attach methods
// ------------------------------------------------------------------------------------------------

impl StateMachine {
    pub fn new(name: &str) -> Self {
        Self {
            id: crate::core::Id::random_with_prefix("machine").unwrap_or_else(|_| crate::core::Id::random()),
            name: name.to_string(),
            regions: std::cell::RefCell::new(Vec::new()),
            lock: Rc::new(Cell::new(false)),
            model: std::cell::RefCell::new(None),
            engine: std::cell::RefCell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &crate::core::Id {
        &self.id
    }

    pub fn is_assembled(&self) -> bool {
        self.lock.get()
    }

    pub fn regions(&self) -> Vec<Region> {
        self.regions.borrow().clone()
    }

    /// Attach a detached region as one of this machine's top-level regions.
    pub fn with_region(&self, region: Region) -> Result<&Self> {
        self.check_unlocked("a new top-level region")?;
        region.set_owner(RegionOwner::StateMachine(self.id.clone()))?;
        region.set_lock(self.lock.clone());
        self.regions.borrow_mut().push(region);
        Ok(self)
    }

    pub(crate) fn check_unlocked(&self, what: &str) -> Result<()> {
        if self.is_assembled() {
            Err(error::ErrorKind::NotAllowed(error::context(
                Some(&self.name),
                ElementKind::StateMachine,
                &self.name,
                &format!("cannot accept {} once assembled", what),
            ))
            .into())
        } else {
            Ok(())
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Region attach methods
// ------------------------------------------------------------------------------------------------

impl Region {
    /// Attach a sub-vertex (state, pseudostate, or final state) to this region.
    pub fn with_sub_state(&self, vertex: Vertex) -> Result<&Self> {
        self.check_unlocked("a new sub-vertex")?;
        self.reject_duplicate_name(vertex.name())?;
        match &vertex {
            Vertex::State(s) => {
                s.set_owner(self.id().clone());
                if let Some(lock) = self.lock_handle() {
                    s.set_lock(lock);
                }
            }
            Vertex::Pseudostate(p) => p.set_owner(self.id().clone()),
            Vertex::FinalState(f) => f.set_owner(self.id().clone()),
        }
        self.push_vertex(vertex);
        Ok(self)
    }

    /// Attach a transition, built via [`TransitionSpec`], scoped to this region.
    pub fn with_transition(&self, spec: TransitionSpec) -> Result<&Self> {
        self.check_unlocked("a new transition")?;
        self.reject_duplicate_transition_name(spec.name.as_deref())?;
        let transition = spec.build();
        transition.set_owner(self.id().clone());
        self.push_transition(transition);
        Ok(self)
    }

    fn reject_duplicate_name(&self, name: &str) -> Result<()> {
        if self.vertices().iter().any(|v| v.name() == name) {
            Err(error::ErrorKind::NotAllowed(error::context(
                None,
                ElementKind::Region,
                &self.name().unwrap_or_default(),
                &format!("already has a sub-vertex named '{}'", name),
            ))
            .into())
        } else {
            Ok(())
        }
    }

    fn reject_duplicate_transition_name(&self, name: Option<&str>) -> Result<()> {
        let name = match name {
            Some(n) => n,
            None => return Ok(()),
        };
        if self.transitions().iter().any(|t| t.name() == Some(name)) {
            Err(error::ErrorKind::NotAllowed(error::context(
                None,
                ElementKind::Transition,
                name,
                "already exists on this region",
            ))
            .into())
        } else {
            Ok(())
        }
    }
}

// ------------------------------------------------------------------------------------------------
// State attach methods
// ------------------------------------------------------------------------------------------------

impl State {
    /// Attach a sub-state, auto-creating (and promoting to composite) an unnamed inner region if
    /// this state does not yet have one.
    pub fn with_sub_state(&self, vertex: Vertex) -> Result<&Self> {
        self.check_unlocked("a new sub-state")?;
        if self.sub_machine().is_some() {
            return Err(error::ErrorKind::NotAllowed(error::context(
                None,
                ElementKind::State,
                self.name(),
                "cannot own sub-states directly once it references a submachine",
            ))
            .into());
        }
        if self.regions().is_empty() {
            self.push_region(Region::new(None))?;
        }
        let region = self.regions().into_iter().next().expect("region just ensured");
        region.with_sub_state(vertex)?;
        Ok(self)
    }

    /// Attach an additional named region, promoting this state to orthogonal.
    pub fn with_region(&self, region: Region) -> Result<&Self> {
        self.push_region(region)?;
        Ok(self)
    }

    /// Reference a submachine by id; may not be combined with direct sub-states/regions. The
    /// referenced machine must not itself be assembled yet, since attaching it hands its
    /// top-level regions to this state's containment tree.
    pub fn with_state_machine(&self, machine: &StateMachine) -> Result<&Self> {
        if machine.is_assembled() {
            return Err(error::ErrorKind::NotAllowed(error::context(
                None,
                ElementKind::State,
                self.name(),
                "cannot reference a submachine that has already been assembled",
            ))
            .into());
        }
        self.set_sub_machine(machine.id().clone())?;
        Ok(self)
    }

    pub fn with_on_entry(&self, action: impl Fn() + 'static) -> Result<&Self> {
        self.set_entry(Rc::new(action) as Action)?;
        Ok(self)
    }

    pub fn with_on_exit(&self, action: impl Fn() + 'static) -> Result<&Self> {
        self.set_exit(Rc::new(action) as Action)?;
        Ok(self)
    }
}

// ------------------------------------------------------------------------------------------------
// TransitionSpec: typestate builder disambiguating completion / triggered / timeout families
// ------------------------------------------------------------------------------------------------

enum Family {
    Completion,
    Triggered(Rc<dyn ErasedEventSource>),
    Internal(Rc<dyn ErasedEventSource>),
    Timeout(Rc<dyn Scheduler>, Duration),
}

/// A transition under construction. Obtain one via [`TransitionSpec::completion`],
/// [`TransitionSpec::triggered`], [`TransitionSpec::internal`], or [`TransitionSpec::timeout`],
/// then chain `.guard(...)`/`.action(...)` before passing it to [`Region::with_transition`].
pub struct TransitionSpec {
    name: Option<String>,
    source: crate::core::Id,
    target: Option<crate::core::Id>,
    family: Family,
    guard: Option<Rc<dyn Fn() -> bool>>,
    action: Option<Action>,
}

impl TransitionSpec {
    /// `(name, source, target)` — fires once its source becomes quiescent (all regions final).
    pub fn completion(name: &str, source: &Vertex, target: &Vertex) -> Self {
        Self {
            name: Some(name.to_string()),
            source: source.id().clone(),
            target: Some(target.id().clone()),
            family: Family::Completion,
            guard: None,
            action: None,
        }
    }

    /// `(name, source, target, trigger)` — external event; `trigger` is erased at this call site
    /// so the model and trigger composer never see its concrete value type.
    /// `(name, source, target, trigger[, action][, guard])` — external event; `trigger`'s value
    /// type `V` is erased at this call site, along with any guard/action that needs to see the
    /// emitted value, so the model and trigger composer never deal in `V` again.
    pub fn triggered<V: Clone + 'static>(
        name: &str,
        source: &Vertex,
        target: &Vertex,
        trigger: Rc<dyn EventSource<V>>,
        action: Option<Rc<dyn Fn(&V)>>,
        guard: Option<Rc<dyn Fn(&V) -> bool>>,
    ) -> Self {
        Self {
            name: Some(name.to_string()),
            source: source.id().clone(),
            target: Some(target.id().clone()),
            family: Family::Triggered(Rc::new(TypedTrigger::new(trigger, guard, action))),
            guard: None,
            action: None,
        }
    }

    /// `(name, source, trigger[, action][, guard])` — no target: the action runs without exit or
    /// re-entry of `source`.
    pub fn internal<V: Clone + 'static>(
        name: &str,
        source: &Vertex,
        trigger: Rc<dyn EventSource<V>>,
        action: Option<Rc<dyn Fn(&V)>>,
        guard: Option<Rc<dyn Fn(&V) -> bool>>,
    ) -> Self {
        Self {
            name: Some(name.to_string()),
            source: source.id().clone(),
            target: None,
            family: Family::Internal(Rc::new(TypedTrigger::new(trigger, guard, action))),
            guard: None,
            action: None,
        }
    }

    /// `(name, source, target, scheduler, duration)` — one-shot timer started on entry to
    /// `source`, cancelled on exit.
    pub fn timeout(
        name: &str,
        source: &Vertex,
        target: &Vertex,
        scheduler: Rc<dyn Scheduler>,
        duration: Duration,
    ) -> Self {
        Self {
            name: Some(name.to_string()),
            source: source.id().clone(),
            target: Some(target.id().clone()),
            family: Family::Timeout(scheduler, duration),
            guard: None,
            action: None,
        }
    }

    /// Sets a guard with no knowledge of the trigger's payload; only meaningful for completion
    /// and timeout transitions. For triggered/internal transitions, pass the guard directly to
    /// [`TransitionSpec::triggered`]/[`TransitionSpec::internal`] instead, since it needs the
    /// emitted value.
    pub fn guard(mut self, guard: impl Fn() -> bool + 'static) -> Self {
        self.guard = Some(Rc::new(guard));
        self
    }

    pub fn action(mut self, action: impl Fn() + 'static) -> Self {
        self.action = Some(Rc::new(action));
        self
    }

    fn build(self) -> Transition {
        let kind = if self.target.is_none() {
            TransitionKind::Internal
        } else {
            TransitionKind::External
        };
        match self.family {
            Family::Completion => Transition::new(
                self.name.as_deref(),
                kind,
                self.source,
                self.target,
                TransitionTrigger::Completion,
                Some(UntriggeredBehavior {
                    guard: self.guard,
                    action: self.action,
                }),
            ),
            Family::Timeout(scheduler, duration) => Transition::new(
                self.name.as_deref(),
                kind,
                self.source,
                self.target,
                TransitionTrigger::Timeout(scheduler, duration),
                Some(UntriggeredBehavior {
                    guard: self.guard,
                    action: self.action,
                }),
            ),
            Family::Triggered(erased) => Transition::new(
                self.name.as_deref(),
                kind,
                self.source,
                self.target,
                TransitionTrigger::Event(erased),
                None,
            ),
            Family::Internal(erased) => Transition::new(
                self.name.as_deref(),
                TransitionKind::Internal,
                self.source,
                None,
                TransitionTrigger::Event(erased),
                None,
            ),
        }
    }
}
