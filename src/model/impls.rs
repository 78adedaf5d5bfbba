use super::*;
use crate::error::{self, ElementKind};

// ------------------------------------------------------------------------------------------------
// Region
// ------------------------------------------------------------------------------------------------

impl Region {
    pub(crate) fn new(name: Option<&str>) -> Self {
        Self(Rc::new(RegionData {
            id: Id::random_with_prefix("region").unwrap_or_else(|_| Id::random()),
            name: RefCell::new(name.map(str::to_string)),
            owner: RefCell::new(None),
            attached: Cell::new(false),
            lock: RefCell::new(None),
            vertices: RefCell::new(Vec::new()),
            transitions: RefCell::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> &Id {
        &self.0.id
    }

    pub fn name(&self) -> Option<String> {
        self.0.name.borrow().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.0.attached.get()
    }

    pub fn owner(&self) -> Option<RegionOwner> {
        self.0.owner.borrow().clone()
    }

    pub fn vertices(&self) -> Vec<Vertex> {
        self.0.vertices.borrow().clone()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.0.transitions.borrow().clone()
    }

    /// The region's one pseudostate of kind `Initial`, if it has been added.
    pub fn initial(&self) -> Option<Pseudostate> {
        self.0.vertices.borrow().iter().find_map(|v| match v {
            Vertex::Pseudostate(p) if p.kind() == PseudostateKind::Initial => Some(p.clone()),
            _ => None,
        })
    }

    pub(crate) fn set_owner(&self, owner: RegionOwner) -> error::Result<()> {
        if self.0.attached.get() {
            return Err(error::ErrorKind::NotAllowed(error::context(
                None,
                ElementKind::Region,
                &self.display_name(),
                "is already attached to an owner",
            ))
            .into());
        }
        *self.0.owner.borrow_mut() = Some(owner);
        self.0.attached.set(true);
        Ok(())
    }

    pub(crate) fn push_vertex(&self, vertex: Vertex) {
        self.0.vertices.borrow_mut().push(vertex);
    }

    pub(crate) fn push_transition(&self, transition: Transition) {
        self.0.transitions.borrow_mut().push(transition);
    }

    /// Reject an attach attempt once this region (or an ancestor) has been locked by `assemble`.
    pub(crate) fn check_unlocked(&self, what: &str) -> error::Result<()> {
        if self.is_locked() {
            Err(error::ErrorKind::NotAllowed(error::context(
                None,
                ElementKind::Region,
                &self.display_name(),
                &format!("cannot accept {} after its state machine has been assembled", what),
            ))
            .into())
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.0.lock.borrow().as_ref().map(|l| l.get()).unwrap_or(false)
    }

    pub(crate) fn lock_handle(&self) -> Option<Rc<Cell<bool>>> {
        self.0.lock.borrow().clone()
    }

    /// Shares `lock` with this region and, recursively, with every state it (transitively)
    /// contains, so a single flip of the owning state machine's lock freezes the whole subtree.
    pub(crate) fn set_lock(&self, lock: Rc<Cell<bool>>) {
        for vertex in self.0.vertices.borrow().iter() {
            if let Vertex::State(s) = vertex {
                s.set_lock(lock.clone());
            }
        }
        *self.0.lock.borrow_mut() = Some(lock);
    }

    fn display_name(&self) -> String {
        self.name().unwrap_or_else(|| self.id().to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// Vertex (common accessors dispatched over the three variants)
// ------------------------------------------------------------------------------------------------

impl Vertex {
    pub fn id(&self) -> &Id {
        match self {
            Vertex::State(s) => s.id(),
            Vertex::Pseudostate(p) => p.id(),
            Vertex::FinalState(f) => f.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Vertex::State(s) => s.name(),
            Vertex::Pseudostate(p) => p.name(),
            Vertex::FinalState(f) => f.name(),
        }
    }

    pub fn owner(&self) -> Option<Id> {
        match self {
            Vertex::State(s) => s.owner(),
            Vertex::Pseudostate(p) => p.owner(),
            Vertex::FinalState(f) => f.owner(),
        }
    }

    pub fn is_attached(&self) -> bool {
        match self {
            Vertex::State(s) => s.is_attached(),
            Vertex::Pseudostate(p) => p.is_attached(),
            Vertex::FinalState(f) => f.is_attached(),
        }
    }

    pub fn as_state(&self) -> error::Result<&State> {
        match self {
            Vertex::State(s) => Ok(s),
            _ => Err(mismatch(self, "a regular state")),
        }
    }

    pub fn as_pseudostate(&self) -> error::Result<&Pseudostate> {
        match self {
            Vertex::Pseudostate(p) => Ok(p),
            _ => Err(mismatch(self, "a pseudostate")),
        }
    }

    pub fn as_final_state(&self) -> error::Result<&FinalState> {
        match self {
            Vertex::FinalState(f) => Ok(f),
            _ => Err(mismatch(self, "a final state")),
        }
    }

    fn kind_label(&self) -> ElementKind {
        match self {
            Vertex::State(_) => ElementKind::State,
            Vertex::Pseudostate(_) => ElementKind::Pseudostate,
            Vertex::FinalState(_) => ElementKind::FinalState,
        }
    }
}

fn mismatch(vertex: &Vertex, expected: &str) -> error::Error {
    error::ErrorKind::StateError(error::context(
        None,
        vertex.kind_label(),
        vertex.name(),
        &format!("was expected to be {} but is not", expected),
    ))
    .into()
}

impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

// ------------------------------------------------------------------------------------------------
// State
// ------------------------------------------------------------------------------------------------

impl State {
    pub(crate) fn new(name: &str) -> Self {
        Self(Rc::new(StateData {
            id: Id::random_with_prefix("state").unwrap_or_else(|_| Id::random()),
            name: name.to_string(),
            owner: RefCell::new(None),
            attached: Cell::new(false),
            lock: RefCell::new(None),
            kind: Cell::new(StateKind::Simple),
            regions: RefCell::new(Vec::new()),
            sub_machine: RefCell::new(None),
            entry: RefCell::new(None),
            exit: RefCell::new(None),
        }))
    }

    pub fn id(&self) -> &Id {
        &self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn owner(&self) -> Option<Id> {
        self.0.owner.borrow().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.0.attached.get()
    }

    pub fn kind(&self) -> StateKind {
        self.0.kind.get()
    }

    pub fn regions(&self) -> Vec<Region> {
        self.0.regions.borrow().clone()
    }

    pub fn sub_machine(&self) -> Option<Id> {
        self.0.sub_machine.borrow().clone()
    }

    pub fn entry(&self) -> Option<Action> {
        self.0.entry.borrow().clone()
    }

    pub fn exit(&self) -> Option<Action> {
        self.0.exit.borrow().clone()
    }

    pub(crate) fn set_owner(&self, owner: Id) {
        *self.0.owner.borrow_mut() = Some(owner);
        self.0.attached.set(true);
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.0.lock.borrow().as_ref().map(|l| l.get()).unwrap_or(false)
    }

    pub(crate) fn set_lock(&self, lock: Rc<Cell<bool>>) {
        for region in self.0.regions.borrow().iter() {
            region.set_lock(lock.clone());
        }
        *self.0.lock.borrow_mut() = Some(lock);
    }

    pub(crate) fn check_unlocked(&self, what: &str) -> error::Result<()> {
        if self.is_locked() {
            Err(error::ErrorKind::NotAllowed(error::context(
                None,
                ElementKind::State,
                self.name(),
                &format!("cannot accept {} after its state machine has been assembled", what),
            ))
            .into())
        } else {
            Ok(())
        }
    }

    pub(crate) fn set_entry(&self, action: Action) -> error::Result<()> {
        self.check_unlocked("a new on-entry behavior")?;
        self.check_unset(&self.0.entry, "on-entry behavior")?;
        *self.0.entry.borrow_mut() = Some(action);
        Ok(())
    }

    pub(crate) fn set_exit(&self, action: Action) -> error::Result<()> {
        self.check_unlocked("a new on-exit behavior")?;
        self.check_unset(&self.0.exit, "on-exit behavior")?;
        *self.0.exit.borrow_mut() = Some(action);
        Ok(())
    }

    fn check_unset(&self, slot: &RefCell<Option<Action>>, what: &str) -> error::Result<()> {
        if slot.borrow().is_some() {
            Err(error::ErrorKind::NotAllowed(error::context(
                None,
                ElementKind::State,
                self.name(),
                &format!("already has a {} set", what),
            ))
            .into())
        } else {
            Ok(())
        }
    }

    /// Attach `region` as one of this state's owned regions. Adding a second region promotes the
    /// state's derived [`StateKind`] from `Composite` to `Orthogonal`.
    pub(crate) fn push_region(&self, region: Region) -> error::Result<()> {
        self.check_unlocked("a new region")?;
        region.set_owner(RegionOwner::State(self.0.id.clone()))?;
        if let Some(lock) = self.0.lock.borrow().clone() {
            region.set_lock(lock);
        }
        self.0.regions.borrow_mut().push(region);
        let count = self.0.regions.borrow().len();
        self.0.kind.set(if count > 1 {
            StateKind::Orthogonal
        } else {
            StateKind::Composite
        });
        Ok(())
    }

    pub(crate) fn set_sub_machine(&self, machine: Id) -> error::Result<()> {
        self.check_unlocked("a submachine reference")?;
        if !self.0.regions.borrow().is_empty() {
            return Err(error::ErrorKind::NotAllowed(error::context(
                None,
                ElementKind::State,
                self.name(),
                "cannot reference a submachine once it owns regions directly",
            ))
            .into());
        }
        *self.0.sub_machine.borrow_mut() = Some(machine);
        self.0.kind.set(StateKind::SubMachine);
        Ok(())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

// ------------------------------------------------------------------------------------------------
// Pseudostate
// ------------------------------------------------------------------------------------------------

impl Pseudostate {
    pub(crate) fn new(name: &str, kind: PseudostateKind) -> Self {
        Self(Rc::new(PseudostateData {
            id: Id::random_with_prefix("pseudostate").unwrap_or_else(|_| Id::random()),
            name: name.to_string(),
            owner: RefCell::new(None),
            attached: Cell::new(false),
            kind,
        }))
    }

    pub fn id(&self) -> &Id {
        &self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn owner(&self) -> Option<Id> {
        self.0.owner.borrow().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.0.attached.get()
    }

    pub fn kind(&self) -> PseudostateKind {
        self.0.kind
    }

    pub fn is_initial(&self) -> bool {
        self.kind() == PseudostateKind::Initial
    }

    pub fn is_deep_history(&self) -> bool {
        self.kind() == PseudostateKind::DeepHistory
    }

    pub fn is_shallow_history(&self) -> bool {
        self.kind() == PseudostateKind::ShallowHistory
    }

    pub fn is_history(&self) -> bool {
        self.is_deep_history() || self.is_shallow_history()
    }

    pub fn is_fork(&self) -> bool {
        self.kind() == PseudostateKind::Fork
    }

    pub fn is_join(&self) -> bool {
        self.kind() == PseudostateKind::Join
    }

    pub fn is_terminate(&self) -> bool {
        self.kind() == PseudostateKind::Terminate
    }

    pub(crate) fn set_owner(&self, owner: Id) {
        *self.0.owner.borrow_mut() = Some(owner);
        self.0.attached.set(true);
    }
}

impl PartialEq for Pseudostate {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

// ------------------------------------------------------------------------------------------------
// FinalState
// ------------------------------------------------------------------------------------------------

impl FinalState {
    pub(crate) fn new(name: &str) -> Self {
        Self(Rc::new(FinalStateData {
            id: Id::random_with_prefix("final").unwrap_or_else(|_| Id::random()),
            name: name.to_string(),
            owner: RefCell::new(None),
            attached: Cell::new(false),
        }))
    }

    pub fn id(&self) -> &Id {
        &self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn owner(&self) -> Option<Id> {
        self.0.owner.borrow().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.0.attached.get()
    }

    pub(crate) fn set_owner(&self, owner: Id) {
        *self.0.owner.borrow_mut() = Some(owner);
        self.0.attached.set(true);
    }
}

impl PartialEq for FinalState {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

// ------------------------------------------------------------------------------------------------
// Transition
// ------------------------------------------------------------------------------------------------

impl Transition {
    pub(crate) fn new(
        name: Option<&str>,
        kind: TransitionKind,
        source: Id,
        target: Option<Id>,
        trigger: TransitionTrigger,
        untriggered: Option<UntriggeredBehavior>,
    ) -> Self {
        Self(Rc::new(TransitionData {
            id: Id::random_with_prefix("transition").unwrap_or_else(|_| Id::random()),
            name: name.map(str::to_string),
            owner: RefCell::new(None),
            attached: Cell::new(false),
            kind,
            source,
            target,
            trigger,
            untriggered: RefCell::new(untriggered),
            model: RefCell::new(std::rc::Weak::new()),
        }))
    }

    /// Binds this handle to the model frozen by the `assemble` call it belongs to, so that
    /// [`Transition::source_state`]/[`Transition::target_state`] can resolve `source()`/`target()`
    /// into live vertices for as long as the owning state machine stays alive.
    pub(crate) fn set_model(&self, model: &Rc<crate::validator::AssembledModel>) {
        *self.0.model.borrow_mut() = Rc::downgrade(model);
    }

    /// Resolves [`Transition::source`] into the live [`Vertex`] it names.
    ///
    /// Errs with [`crate::error::ErrorKind::DeletedError`] if the owning state machine (and with
    /// it, the assembled model this transition was resolved against) has already been dropped.
    pub fn source_state(&self) -> crate::error::Result<Vertex> {
        let model = self.resolve_model()?;
        model.vertex(&self.0.source).cloned().ok_or_else(|| {
            crate::error::ErrorKind::InternalError(error::context(
                None,
                ElementKind::Transition,
                &self.display_name(),
                "sources a vertex missing from its own model",
            ))
            .into()
        })
    }

    /// Resolves [`Transition::target`] into the live [`Vertex`] it names, or `None` for an
    /// internal transition with no target.
    ///
    /// Errs with [`crate::error::ErrorKind::DeletedError`] if the owning state machine has
    /// already been dropped.
    pub fn target_state(&self) -> crate::error::Result<Option<Vertex>> {
        let target = match self.0.target.as_ref() {
            None => return Ok(None),
            Some(id) => id.clone(),
        };
        let model = self.resolve_model()?;
        Ok(model.vertex(&target).cloned())
    }

    fn resolve_model(&self) -> crate::error::Result<Rc<crate::validator::AssembledModel>> {
        self.0.model.borrow().upgrade().ok_or_else(|| {
            crate::error::ErrorKind::DeletedError(error::context(
                None,
                ElementKind::Transition,
                &self.display_name(),
                "was used after its owning state machine was dropped",
            ))
            .into()
        })
    }

    fn display_name(&self) -> String {
        self.name().map(str::to_string).unwrap_or_else(|| self.0.id.to_string())
    }

    pub fn id(&self) -> &Id {
        &self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn kind(&self) -> TransitionKind {
        self.0.kind
    }

    pub fn source(&self) -> &Id {
        &self.0.source
    }

    pub fn target(&self) -> Option<&Id> {
        self.0.target.as_ref()
    }

    pub fn trigger(&self) -> &TransitionTrigger {
        &self.0.trigger
    }

    pub fn is_completion(&self) -> bool {
        matches!(self.0.trigger, TransitionTrigger::Completion)
    }

    pub fn is_internal(&self) -> bool {
        self.0.kind == TransitionKind::Internal
    }

    pub(crate) fn set_owner(&self, owner: Id) {
        *self.0.owner.borrow_mut() = Some(owner);
        self.0.attached.set(true);
    }

    /// True if this (necessarily untriggered) transition was built with an explicit guard, as
    /// opposed to having none at all. Distinguishes "the default arm" from "a guard that happens
    /// to currently evaluate true" for the validator's fork/choice/junction rules.
    pub fn has_guard(&self) -> bool {
        self.0
            .untriggered
            .borrow()
            .as_ref()
            .map(|b| b.guard.is_some())
            .unwrap_or(false)
    }

    /// Runs the guard for an untriggered (completion or timeout) transition; absent guards are
    /// always-true.
    pub(crate) fn eval_untriggered_guard(&self) -> bool {
        match self.0.untriggered.borrow().as_ref() {
            Some(b) => b.guard.as_ref().map(|g| g()).unwrap_or(true),
            None => true,
        }
    }

    pub(crate) fn run_untriggered_action(&self) {
        if let Some(b) = self.0.untriggered.borrow().as_ref() {
            if let Some(action) = &b.action {
                action();
            }
        }
    }
}

impl PartialEq for Transition {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
