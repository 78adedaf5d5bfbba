/*!
The execution engine (§4.4): gives a validated [`crate::model::StateMachine`] a running
configuration tree, drives compound transitions (exit, action, entry, in that order), and
publishes every transition taken as a [`TransitionEvent`].

The configuration is an append-only tree of [`ConfigNode`]s, one per currently-active region,
addressed by `Rc`/`Weak` rather than by the stable-index arena the "Cyclic graphs" design note in
`DESIGN.md` originally suggests: a node's children are owned strongly (dropping them tears down
their subscriptions' `Rc`s), its parent is held weakly, and there are no reference cycles to
break, so the simpler representation gets the same one-sweep cancellation the note asks for
without a separate index table. There is exactly one root node, holding no region and no vertex of
its own, whose children are this machine's top-level regions — the same "one child per region"
rule a composite or orthogonal state's own node follows, generalized one level up.
*/

use crate::core::Id;
use crate::error::{self, ElementKind, Result};
use crate::model::{StateKind, StateMachine, Transition, TransitionKind, Vertex};
use crate::reactive::{CancellationHandle, CompositeCancellation, EventSource, Scheduler, SimpleSubject, Worker};
use crate::trigger::{Decision, TriggerComposer};
use crate::validator::AssembledModel;
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

// ------------------------------------------------------------------------------------------------
// TransitionEvent: the public record published for every transition taken
// ------------------------------------------------------------------------------------------------

/// One transition taken, published by the [`crate::reactive::EventSource`] that
/// [`StateMachine::assemble`] returns. `source`/`target` are the structural vertices involved;
/// callers that only care about one kind of vertex narrow with
/// [`Vertex::as_state`]/[`Vertex::as_pseudostate`]/[`Vertex::as_final_state`] on the value
/// returned here, exactly as they would on a vertex obtained from the builder.
#[derive(Clone)]
pub struct TransitionEvent {
    name: Option<String>,
    kind: TransitionKind,
    source: Vertex,
    target: Option<Vertex>,
}

impl TransitionEvent {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    pub fn source(&self) -> &Vertex {
        &self.source
    }

    /// `None` for an internal transition, which has no target.
    pub fn target(&self) -> Option<&Vertex> {
        self.target.as_ref()
    }
}

// ------------------------------------------------------------------------------------------------
// Output: the transition feed, buffered until a subscriber actually attaches
// ------------------------------------------------------------------------------------------------

enum Recorded {
    Next(TransitionEvent),
    Error(Rc<crate::error::Error>),
    Complete,
}

/// `assemble` enters every top-level region's default target before it returns the feed a caller
/// then subscribes to, so the very first transitions taken (the initial pseudostate resolutions)
/// would otherwise fire into an empty [`SimpleSubject`] and be lost to any caller following the
/// documented "subscribe to the returned source" pattern. This wraps the real subject and records
/// whatever is published before the first subscriber attaches, replaying it to that subscriber
/// before switching to ordinary hot delivery.
struct ReplayFirstSubscriber {
    inner: SimpleSubject<TransitionEvent>,
    backlog: RefCell<Vec<Recorded>>,
    has_subscriber: Cell<bool>,
}

impl ReplayFirstSubscriber {
    fn new() -> Self {
        Self { inner: SimpleSubject::new(), backlog: RefCell::new(Vec::new()), has_subscriber: Cell::new(false) }
    }

    fn on_next(&self, value: TransitionEvent) {
        if self.has_subscriber.get() {
            self.inner.on_next(value);
        } else {
            self.backlog.borrow_mut().push(Recorded::Next(value));
        }
    }

    fn on_error(&self, error: Rc<crate::error::Error>) {
        if self.has_subscriber.get() {
            self.inner.on_error(error);
        } else {
            self.backlog.borrow_mut().push(Recorded::Error(error));
        }
    }

    fn on_completed(&self) {
        if self.has_subscriber.get() {
            self.inner.on_completed();
        } else {
            self.backlog.borrow_mut().push(Recorded::Complete);
        }
    }
}

impl EventSource<TransitionEvent> for ReplayFirstSubscriber {
    fn subscribe(
        &self,
        worker: &dyn Worker,
        on_next: Rc<dyn Fn(TransitionEvent)>,
        on_error: Rc<dyn Fn(Rc<crate::error::Error>)>,
        on_complete: Rc<dyn Fn()>,
    ) -> Box<dyn CancellationHandle> {
        if !self.has_subscriber.replace(true) {
            for item in self.backlog.borrow_mut().drain(..) {
                match item {
                    Recorded::Next(event) => on_next(event),
                    Recorded::Error(error) => on_error(error),
                    Recorded::Complete => on_complete(),
                }
            }
        }
        self.inner.subscribe(worker, on_next, on_error, on_complete)
    }
}

// ------------------------------------------------------------------------------------------------
// History: per-region snapshots captured on exit, consulted by shallow/deep history pseudostates
// ------------------------------------------------------------------------------------------------

/// Supplements the distilled description of history pseudostates with the one behavior it left
/// implicit: restoring shallow history re-runs the recorded top-level substate's own default entry
/// chain, while deep history reconstructs the full nested leaf configuration directly, bypassing
/// every intermediate region's `initial` pseudostate.
#[derive(Default)]
struct HistoryStore {
    shallow: RefCell<HashMap<Id, Id>>,
    deep: RefCell<HashMap<Id, HashMap<Id, Id>>>,
}

impl HistoryStore {
    fn set_shallow(&self, region: Id, vertex: Id) {
        self.shallow.borrow_mut().insert(region, vertex);
    }

    fn shallow(&self, region: &Id) -> Option<Id> {
        self.shallow.borrow().get(region).cloned()
    }

    fn set_deep(&self, region: Id, snapshot: HashMap<Id, Id>) {
        self.deep.borrow_mut().insert(region, snapshot);
    }

    fn deep(&self, region: &Id) -> Option<HashMap<Id, Id>> {
        self.deep.borrow().get(region).cloned()
    }
}

// ------------------------------------------------------------------------------------------------
// ConfigNode: one (region, active vertex) pair in the running configuration tree
// ------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeStatus {
    Active,
    AwaitJoin,
    AwaitFinalize,
}

struct ConfigNode {
    /// `None` only for the single virtual root.
    region: Option<Id>,
    /// The vertex currently active in `region`: a regular state or final state while `Active`, or
    /// the target pseudostate/final state while awaiting the rest of an orthogonal state's regions.
    vertex: RefCell<Option<Id>>,
    status: Cell<NodeStatus>,
    /// Cancelling this cancels `state_lifetime` and every descendant's `lifetime`; used for a
    /// single arena-wide sweep on `terminate`.
    lifetime: CompositeCancellation,
    /// Just this node's own event-source subscription(s); cancelled on every exit, re-subscribed
    /// fresh on every (re-)entry.
    state_lifetime: CompositeCancellation,
    parent: Option<Weak<ConfigNode>>,
    children: RefCell<Vec<Rc<ConfigNode>>>,
    entered: Cell<bool>,
}

impl ConfigNode {
    fn new_root() -> Rc<Self> {
        Rc::new(Self {
            region: None,
            vertex: RefCell::new(None),
            status: Cell::new(NodeStatus::Active),
            lifetime: CompositeCancellation::new(),
            state_lifetime: CompositeCancellation::new(),
            parent: None,
            children: RefCell::new(Vec::new()),
            entered: Cell::new(false),
        })
    }

    fn new_child(parent: &Rc<ConfigNode>, region: Id) -> Rc<Self> {
        let node = Rc::new(Self {
            region: Some(region),
            vertex: RefCell::new(None),
            status: Cell::new(NodeStatus::Active),
            lifetime: CompositeCancellation::new(),
            state_lifetime: CompositeCancellation::new(),
            parent: Some(Rc::downgrade(parent)),
            children: RefCell::new(Vec::new()),
            entered: Cell::new(false),
        });
        parent.lifetime.add(Box::new(node.lifetime.clone()));
        parent.children.borrow_mut().push(node.clone());
        node
    }

    fn depth(self: &Rc<Self>) -> usize {
        let mut depth = 0;
        let mut current = self.parent.clone();
        while let Some(weak) = current {
            match weak.upgrade() {
                Some(p) => {
                    depth += 1;
                    current = p.parent.clone();
                }
                None => break,
            }
        }
        depth
    }
}

fn find_or_create_child(parent: &Rc<ConfigNode>, region: &Id) -> Rc<ConfigNode> {
    if let Some(existing) = parent.children.borrow().iter().find(|c| c.region.as_ref() == Some(region)) {
        return existing.clone();
    }
    ConfigNode::new_child(parent, region.clone())
}

fn collect_for_exit(node: &Rc<ConfigNode>, include_self: bool, out: &mut Vec<Rc<ConfigNode>>) {
    for child in node.children.borrow().iter() {
        collect_for_exit(child, true, out);
    }
    if include_self && node.region.is_some() {
        out.push(node.clone());
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// One running configuration for an assembled machine. Shared (via `Rc`) between every active
/// node's subscription closures, which is why almost every method takes `self: &Rc<Self>`.
pub struct Engine {
    model: Rc<AssembledModel>,
    composer: TriggerComposer,
    worker: Box<dyn Worker>,
    output: Rc<ReplayFirstSubscriber>,
    root: Rc<ConfigNode>,
    history: HistoryStore,
    terminated: Cell<bool>,
    machine_name: String,
    active_nodes: RefCell<HashMap<Id, Rc<ConfigNode>>>,
    top_regions: Vec<crate::model::Region>,
}

impl Engine {
    fn new(
        model: Rc<AssembledModel>,
        machine_name: String,
        worker: Box<dyn Worker>,
        top_regions: Vec<crate::model::Region>,
    ) -> Rc<Self> {
        Rc::new(Self {
            model,
            composer: TriggerComposer::new(),
            worker,
            output: Rc::new(ReplayFirstSubscriber::new()),
            root: ConfigNode::new_root(),
            history: HistoryStore::default(),
            terminated: Cell::new(false),
            machine_name,
            active_nodes: RefCell::new(HashMap::new()),
            top_regions,
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.get()
    }

    pub(crate) fn output(&self) -> Rc<ReplayFirstSubscriber> {
        self.output.clone()
    }

    /// Cancels every active subscription in one sweep and completes the output observable. Runs
    /// no exit behaviors, matching §4.4.6: a terminate transition (or a direct call to
    /// [`StateMachine::terminate`]) stops the machine in place.
    pub(crate) fn terminate(&self) {
        if self.terminated.replace(true) {
            return;
        }
        self.root.lifetime.cancel();
        self.output.on_completed();
    }

    /// Enters every top-level region's default target. Called once by `assemble`.
    fn activate(self: &Rc<Self>) -> Result<()> {
        let mut leaves = Vec::new();
        for region in &self.top_regions {
            leaves.extend(self.resolve_region_default(region)?);
        }
        self.enter_targets(&self.root.clone(), None, leaves)
    }

    // --------------------------------------------------------------------------------------------
    // Entry behavior, deferred per §4.5
    // --------------------------------------------------------------------------------------------

    fn ensure_entered_node(&self, node: &Rc<ConfigNode>, state: &crate::model::State) {
        if node.entered.replace(true) {
            return;
        }
        debug!("{}", error::context(Some(&self.machine_name), ElementKind::State, state.name(), "entered"));
        if let Some(action) = state.entry() {
            action();
        }
    }

    /// The hook handed to [`TriggerComposer::subscribe`]: runs `vertex_id`'s entry behavior the
    /// first time any of its guards is about to be evaluated, if it has not already run.
    fn ensure_entered(&self, vertex_id: &Id) {
        let node = self.active_nodes.borrow().get(vertex_id).cloned();
        if let (Some(node), Some(Vertex::State(state))) = (node, self.model.vertex(vertex_id).cloned()) {
            self.ensure_entered_node(&node, &state);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Target resolution (§4.4.3 table), synchronous pseudostate traversal
    // --------------------------------------------------------------------------------------------

    fn resolve_region_default(&self, region: &crate::model::Region) -> Result<Vec<Id>> {
        let initial = region
            .initial()
            .ok_or_else(|| self.internal_error("region has no initial pseudostate at entry time"))?;
        self.resolve_vertex(initial.id())
    }

    /// Resolves `vertex_id` to the leaf (regular state or final state) vertices a compound
    /// transition into it ultimately activates, running and publishing every pseudostate
    /// transition traversed along the way.
    fn resolve_vertex(&self, vertex_id: &Id) -> Result<Vec<Id>> {
        let vertex = self
            .model
            .vertex(vertex_id)
            .cloned()
            .ok_or_else(|| self.internal_error("resolving a vertex missing from the model"))?;
        match vertex {
            Vertex::FinalState(_) => Ok(vec![vertex_id.clone()]),
            Vertex::State(state) => match state.kind() {
                StateKind::Simple | StateKind::SubMachine => Ok(vec![vertex_id.clone()]),
                StateKind::Composite => {
                    let region = state
                        .regions()
                        .into_iter()
                        .next()
                        .ok_or_else(|| self.internal_error("composite state has no region"))?;
                    self.resolve_region_default(&region)
                }
                StateKind::Orthogonal => {
                    let mut out = Vec::new();
                    for region in state.regions() {
                        out.extend(self.resolve_region_default(&region)?);
                    }
                    Ok(out)
                }
            },
            Vertex::Pseudostate(p) => self.resolve_pseudostate(vertex_id, &p),
        }
    }

    fn resolve_pseudostate(&self, vertex_id: &Id, p: &crate::model::Pseudostate) -> Result<Vec<Id>> {
        use crate::model::PseudostateKind::*;
        match p.kind() {
            Initial | EntryPoint | ExitPoint => {
                let outgoing = self.model.outgoing(vertex_id);
                let t = outgoing
                    .first()
                    .ok_or_else(|| self.internal_error("pseudostate has no outgoing transition"))?
                    .clone();
                self.run_and_emit(&t);
                let target = t
                    .target()
                    .ok_or_else(|| self.internal_error("pseudostate's transition has no target"))?;
                self.resolve_vertex(target)
            }
            Fork => {
                let mut out = Vec::new();
                for t in self.model.outgoing(vertex_id).to_vec() {
                    self.run_and_emit(&t);
                    let target = t
                        .target()
                        .ok_or_else(|| self.internal_error("fork's outgoing transition has no target"))?;
                    out.extend(self.resolve_vertex(target)?);
                }
                Ok(out)
            }
            Choice | Junction => {
                let outgoing = self.model.outgoing(vertex_id);
                let chosen = outgoing
                    .iter()
                    .find(|t| t.has_guard() && t.eval_untriggered_guard())
                    .or_else(|| outgoing.iter().find(|t| !t.has_guard()))
                    .ok_or_else(|| self.internal_error("choice/junction has no eligible outgoing transition"))?
                    .clone();
                self.run_and_emit(&chosen);
                let target = chosen
                    .target()
                    .ok_or_else(|| self.internal_error("choice/junction's transition has no target"))?;
                self.resolve_vertex(target)
            }
            ShallowHistory => {
                let region = p
                    .owner()
                    .ok_or_else(|| self.internal_error("history pseudostate is not attached to a region"))?;
                match self.history.shallow(&region) {
                    Some(recorded) => self.resolve_vertex(&recorded),
                    None => {
                        let region = self
                            .model
                            .region(&region)
                            .ok_or_else(|| self.internal_error("history pseudostate's region missing from model"))?;
                        self.resolve_region_default(region)
                    }
                }
            }
            DeepHistory => {
                let region_id = p
                    .owner()
                    .ok_or_else(|| self.internal_error("history pseudostate is not attached to a region"))?;
                match self.history.deep(&region_id) {
                    Some(snapshot) => self.resolve_deep(&region_id, &snapshot),
                    None => {
                        let region = self
                            .model
                            .region(&region_id)
                            .ok_or_else(|| self.internal_error("history pseudostate's region missing from model"))?;
                        self.resolve_region_default(region)
                    }
                }
            }
            Join => {
                // A join reached other than as a live transition target (see `fire_final_or_join`)
                // has no sibling regions to wait on; best effort is to follow its single outgoing
                // transition immediately.
                match self.model.outgoing(vertex_id).first().cloned() {
                    Some(t) => {
                        self.run_and_emit(&t);
                        match t.target() {
                            Some(target) => self.resolve_vertex(target),
                            None => Ok(vec![]),
                        }
                    }
                    None => Ok(vec![]),
                }
            }
            Terminate => Ok(vec![]),
        }
    }

    fn resolve_deep(&self, region_id: &Id, snapshot: &HashMap<Id, Id>) -> Result<Vec<Id>> {
        let vertex_id = match snapshot.get(region_id) {
            Some(v) => v.clone(),
            None => {
                let region = self
                    .model
                    .region(region_id)
                    .ok_or_else(|| self.internal_error("deep history region missing from model"))?;
                return self.resolve_region_default(region);
            }
        };
        match self.model.vertex(&vertex_id).cloned() {
            Some(Vertex::State(state)) if matches!(state.kind(), StateKind::Composite | StateKind::Orthogonal) => {
                let mut out = Vec::new();
                for region in state.regions() {
                    out.extend(self.resolve_deep(region.id(), snapshot)?);
                }
                Ok(out)
            }
            _ => Ok(vec![vertex_id]),
        }
    }

    /// Runs a pseudostate transition's action and publishes it. Pseudostate traversal never exits
    /// or enters anything itself; only the compound transition's real source and destination do.
    fn run_and_emit(&self, transition: &Transition) {
        transition.run_untriggered_action();
        self.emit(transition);
    }

    fn emit(&self, transition: &Transition) {
        let source = match self.model.vertex(transition.source()).cloned() {
            Some(v) => v,
            None => return,
        };
        let target = transition.target().and_then(|t| self.model.vertex(t).cloned());
        debug!(
            "{}",
            error::context(
                Some(&self.machine_name),
                ElementKind::Transition,
                transition.name().unwrap_or(source.name()),
                "taken"
            )
        );
        self.output.on_next(TransitionEvent {
            name: transition.name().map(str::to_string),
            kind: transition.kind(),
            source,
            target,
        });
    }

    // --------------------------------------------------------------------------------------------
    // Exit (§4.4.2), including history capture
    // --------------------------------------------------------------------------------------------

    fn exit_below(&self, common: &Rc<ConfigNode>, include_common: bool) {
        let mut list = Vec::new();
        collect_for_exit(common, include_common, &mut list);
        for node in &list {
            self.snapshot_history_for(node);
        }
        for node in &list {
            self.exit_node(node);
        }
        common.children.borrow_mut().clear();
    }

    fn snapshot_history_for(&self, node: &Rc<ConfigNode>) {
        let region_id = match &node.region {
            Some(r) => r.clone(),
            None => return,
        };
        let vertex_id = match node.vertex.borrow().clone() {
            Some(v) => v,
            None => return,
        };
        let region = match self.model.region(&region_id) {
            Some(r) => r,
            None => return,
        };
        for v in region.vertices() {
            if let Vertex::Pseudostate(p) = &v {
                if p.is_shallow_history() {
                    self.history.set_shallow(region_id.clone(), vertex_id.clone());
                } else if p.is_deep_history() {
                    let mut snapshot = HashMap::new();
                    build_deep_snapshot(node, &mut snapshot);
                    self.history.set_deep(region_id.clone(), snapshot);
                }
            }
        }
    }

    fn exit_node(&self, node: &Rc<ConfigNode>) {
        if let Some(vid) = node.vertex.borrow().clone() {
            if let Some(Vertex::State(state)) = self.model.vertex(&vid) {
                // Deferred entry (§4.5): a vertex that never had a guard evaluated still runs its
                // entry behavior once, immediately before its exit behavior.
                self.ensure_entered_node(node, state);
                debug!("{}", error::context(Some(&self.machine_name), ElementKind::State, state.name(), "exited"));
                if let Some(exit) = state.exit() {
                    exit();
                }
            }
            self.active_nodes.borrow_mut().remove(&vid);
        }
        node.state_lifetime.cancel();
        node.vertex.replace(None);
        node.entered.set(false);
        node.status.set(NodeStatus::Active);
    }

    // --------------------------------------------------------------------------------------------
    // Entry (§4.4.3), activation order
    // --------------------------------------------------------------------------------------------

    fn enter_targets(self: &Rc<Self>, common: &Rc<ConfigNode>, common_role: Option<Id>, leaves: Vec<Id>) -> Result<()> {
        let mut newly: Vec<Rc<ConfigNode>> = Vec::new();
        let mut seen: HashSet<Id> = HashSet::new();

        if let Some(cid) = &common_role {
            *common.vertex.borrow_mut() = Some(cid.clone());
            self.active_nodes.borrow_mut().insert(cid.clone(), common.clone());
            if let Some(region) = &common.region {
                seen.insert(region.clone());
            }
            newly.push(common.clone());
        }

        for leaf in &leaves {
            let full_chain = self.model.ancestors(leaf).to_vec();
            let start = match &common_role {
                Some(cid) => full_chain.iter().position(|s| s.id() == cid).map(|i| i + 1).unwrap_or(0),
                None => 0,
            };
            let mut parent = common.clone();
            for state in &full_chain[start..] {
                let region_id = state
                    .owner()
                    .ok_or_else(|| self.internal_error("ancestor state has no owning region"))?;
                let child = find_or_create_child(&parent, &region_id);
                *child.vertex.borrow_mut() = Some(state.id().clone());
                self.active_nodes.borrow_mut().insert(state.id().clone(), child.clone());
                if seen.insert(region_id) {
                    newly.push(child.clone());
                }
                parent = child;
            }

            let leaf_vertex = self
                .model
                .vertex(leaf)
                .cloned()
                .ok_or_else(|| self.internal_error("resolved target missing from model"))?;
            let leaf_region = leaf_vertex
                .owner()
                .ok_or_else(|| self.internal_error("resolved target has no owning region"))?;
            let leaf_node = find_or_create_child(&parent, &leaf_region);
            *leaf_node.vertex.borrow_mut() = Some(leaf.clone());
            self.active_nodes.borrow_mut().insert(leaf.clone(), leaf_node.clone());
            if seen.insert(leaf_region) {
                newly.push(leaf_node.clone());
            }
        }

        let mut by_depth: Vec<(usize, Rc<ConfigNode>)> = newly.into_iter().map(|n| (n.depth(), n)).collect();
        by_depth.sort_by_key(|(depth, _)| *depth);

        for (_, node) in by_depth {
            self.activate_node(&node)?;
        }
        Ok(())
    }

    fn activate_node(self: &Rc<Self>, node: &Rc<ConfigNode>) -> Result<()> {
        let vid = node
            .vertex
            .borrow()
            .clone()
            .ok_or_else(|| self.internal_error("activating a node with no vertex"))?;
        match self.model.vertex(&vid).cloned() {
            Some(Vertex::State(state)) => {
                if matches!(state.kind(), StateKind::Composite | StateKind::Orthogonal) {
                    self.composer.gates().close(&vid);
                }
                self.subscribe_node(node, &vid);
                self.ensure_entered_node(node, &state);
                Ok(())
            }
            Some(Vertex::FinalState(_)) => Ok(()),
            _ => Err(self.internal_error("activated node's vertex is neither a state nor a final state")),
        }
    }

    fn subscribe_node(self: &Rc<Self>, node: &Rc<ConfigNode>, vertex_id: &Id) {
        let own = self.model.outgoing(vertex_id).to_vec();

        let mut ancestor_lists: Vec<Vec<Transition>> = Vec::new();
        let mut cursor = node.parent.clone();
        while let Some(weak) = cursor {
            match weak.upgrade() {
                Some(ancestor) => {
                    if let Some(avid) = ancestor.vertex.borrow().clone() {
                        ancestor_lists.push(self.model.outgoing(&avid).to_vec());
                    }
                    cursor = ancestor.parent.clone();
                }
                None => break,
            }
        }
        let ancestor_refs: Vec<&[Transition]> = ancestor_lists.iter().map(Vec::as_slice).collect();

        let engine = self.clone();
        let ensure_entered: Rc<dyn Fn(&Id)> = Rc::new(move |vid: &Id| engine.ensure_entered(vid));

        let engine = self.clone();
        let node_for_decision = node.clone();
        let on_decision: Rc<dyn Fn(Decision)> = Rc::new(move |decision: Decision| {
            let engine = engine.clone();
            let node = node_for_decision.clone();
            if let Err(err) = engine.handle_decision(&node, decision) {
                warn!("{}", err);
                engine.output.on_error(Rc::new(err));
            }
        });

        let handle = self
            .composer
            .subscribe(self.worker.as_ref(), &own, &ancestor_refs, ensure_entered, on_decision);
        node.state_lifetime.add(handle);
        node.lifetime.add(Box::new(node.state_lifetime.clone()));
    }

    fn handle_decision(self: &Rc<Self>, node: &Rc<ConfigNode>, decision: Decision) -> Result<()> {
        let transition = self
            .model
            .transition(&decision.transition_id)
            .cloned()
            .ok_or_else(|| self.internal_error("decision references a transition missing from the model"))?;
        self.fire_transition(node, &transition, decision.run)
    }

    // --------------------------------------------------------------------------------------------
    // The transitioning algorithm (§4.4.4), final/join deferral (§4.4.5), terminate (§4.4.6)
    // --------------------------------------------------------------------------------------------

    fn compute_common(&self, node: &Rc<ConfigNode>, target: &Id) -> (Rc<ConfigNode>, Option<Id>) {
        let ancestor_ids: HashSet<Id> = self.model.ancestors(target).iter().map(|s| s.id().clone()).collect();
        let mut cursor = node.clone();
        loop {
            if let Some(vid) = cursor.vertex.borrow().clone() {
                if ancestor_ids.contains(&vid) {
                    return (cursor.clone(), Some(vid));
                }
            }
            if Rc::ptr_eq(&cursor, &self.root) {
                return (cursor, None);
            }
            match cursor.parent.clone().and_then(|w| w.upgrade()) {
                Some(parent) => cursor = parent,
                None => return (self.root.clone(), None),
            }
        }
    }

    fn fire_transition(self: &Rc<Self>, node: &Rc<ConfigNode>, transition: &Transition, run: Box<dyn FnOnce()>) -> Result<()> {
        if self.terminated.get() {
            return Ok(());
        }
        let target_id = match transition.target() {
            None => {
                run();
                self.emit(transition);
                return Ok(());
            }
            Some(id) => id.clone(),
        };
        let target_vertex = self
            .model
            .vertex(&target_id)
            .cloned()
            .ok_or_else(|| self.internal_error("transition targets a vertex missing from the model"))?;

        match &target_vertex {
            Vertex::Pseudostate(p) if p.is_terminate() => {
                run();
                self.emit(transition);
                self.terminate();
                Ok(())
            }
            Vertex::FinalState(_) => self.fire_final_or_join(node, transition, run, target_id),
            Vertex::Pseudostate(p) if p.is_join() => self.fire_final_or_join(node, transition, run, target_id),
            _ => {
                let (common, common_role) = self.compute_common(node, &target_id);
                self.exit_below(&common, true);
                run();
                self.emit(transition);
                let leaves = self.resolve_vertex(&target_id)?;
                self.enter_targets(&common, common_role, leaves)
            }
        }
    }

    /// §4.4.5: a transition into a final state or a join only ever affects its own region. The
    /// enclosing state's completion (for a final state) or the join's onward transition (once
    /// every sibling region agrees) is deferred until every region reaches quiescence.
    fn fire_final_or_join(self: &Rc<Self>, node: &Rc<ConfigNode>, transition: &Transition, run: Box<dyn FnOnce()>, target_id: Id) -> Result<()> {
        // Per §4.4.5, "only the current region's exit path runs": the region's own currently
        // active vertex is exited (running its exit behavior and cancelling its subscriptions)
        // even though `node` itself is reused to hold the final/join vertex afterwards, rather
        // than being torn down and recreated.
        self.exit_below(node, true);
        run();
        self.emit(transition);

        let is_final = matches!(self.model.vertex(&target_id), Some(Vertex::FinalState(_)));
        *node.vertex.borrow_mut() = Some(target_id.clone());
        node.status.set(if is_final { NodeStatus::AwaitFinalize } else { NodeStatus::AwaitJoin });

        let parent = match node.parent.clone().and_then(|w| w.upgrade()) {
            Some(p) => p,
            None => return Ok(()),
        };
        let siblings = parent.children.borrow().clone();
        if siblings.iter().any(|s| s.status.get() == NodeStatus::Active) {
            debug!(
                "{}",
                error::context(Some(&self.machine_name), ElementKind::Region, "orthogonal", "region quiesced, awaiting siblings")
            );
            return Ok(());
        }

        let all_finalize = siblings.iter().all(|s| s.status.get() == NodeStatus::AwaitFinalize);
        let all_join = siblings.iter().all(|s| s.status.get() == NodeStatus::AwaitJoin);

        if !all_finalize && !all_join {
            let owner_name = parent
                .vertex
                .borrow()
                .as_ref()
                .and_then(|id| self.model.vertex(id))
                .map(|v| v.name().to_string())
                .unwrap_or_default();
            return Err(error::ErrorKind::JoinError(error::context(
                Some(&self.machine_name),
                ElementKind::State,
                &owner_name,
                "has sibling regions that disagree on join vs. finalize",
            ))
            .into());
        }

        let owner_id = match parent.vertex.borrow().clone() {
            Some(id) => id,
            None => return Ok(()), // a top-level region has no enclosing state to notify
        };

        if all_finalize {
            self.composer.gates().open(&owner_id);
            Ok(())
        } else {
            match self.model.outgoing(&target_id).first().cloned() {
                Some(next) => self.fire_transition(&parent, &next, Box::new(|| {})),
                None => Ok(()),
            }
        }
    }

    fn internal_error(&self, detail: &str) -> error::Error {
        error::ErrorKind::InternalError(error::context(Some(&self.machine_name), ElementKind::StateMachine, &self.machine_name, detail)).into()
    }
}

fn build_deep_snapshot(node: &Rc<ConfigNode>, out: &mut HashMap<Id, Id>) {
    if let (Some(region), Some(vertex)) = (&node.region, node.vertex.borrow().clone()) {
        out.insert(region.clone(), vertex);
    }
    for child in node.children.borrow().iter() {
        build_deep_snapshot(child, out);
    }
}

// ------------------------------------------------------------------------------------------------
// StateMachine: assemble / start / terminate
// ------------------------------------------------------------------------------------------------

impl StateMachine {
    /// Validates and freezes the model, builds a fresh running configuration on `scheduler`, and
    /// enters every top-level region's default target. Returns the transition feed; subscribe to
    /// it before (or instead of) calling [`StateMachine::start`] if you need every taken
    /// transition rather than just a termination/cancellation signal.
    pub fn assemble(&self, scheduler: Rc<dyn Scheduler>) -> Result<Rc<dyn EventSource<TransitionEvent>>> {
        self.check_unlocked("assembly")?;
        let model = Rc::new(crate::validator::validate(self)?);
        self.lock.set(true);
        for transition in model.all_transitions() {
            transition.set_model(&model);
        }

        let engine = Engine::new(model.clone(), self.name.clone(), scheduler.worker(), self.regions());
        engine.activate()?;

        *self.model.borrow_mut() = Some(model);
        *self.engine.borrow_mut() = Some(engine.clone());

        Ok(engine.output() as Rc<dyn EventSource<TransitionEvent>>)
    }

    /// Convenience over [`StateMachine::assemble`] for callers who only want the machine running,
    /// with transition errors logged rather than inspected: `assemble` then subscribe, discarding
    /// individual transition notifications.
    pub fn start(&self, scheduler: Rc<dyn Scheduler>) -> Result<Box<dyn CancellationHandle>> {
        let source = self.assemble(scheduler.clone())?;
        let worker = scheduler.worker();
        let machine_name = self.name.clone();
        Ok(source.subscribe(
            worker.as_ref(),
            Rc::new(|_event: TransitionEvent| {}),
            Rc::new(move |err: Rc<crate::error::Error>| {
                warn!("{}", error::context(Some(&machine_name), ElementKind::StateMachine, &machine_name, &format!("{}", err)));
            }),
            Rc::new(|| {}),
        ))
    }

    /// Stops the machine in place: cancels every active subscription without running any exit
    /// behavior, matching what a `terminate` pseudostate does internally (§4.4.6).
    pub fn terminate(&self) {
        if let Some(engine) = self.engine.borrow().as_ref() {
            engine.terminate();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.engine.borrow().as_ref().map(|e| e.is_terminated()).unwrap_or(false)
    }

    /// Names of vertices neither reachable as a transition target nor a top-level `initial`.
    /// Only meaningful after [`StateMachine::assemble`].
    pub fn find_unreachable_states(&self) -> Vec<String> {
        match self.model.borrow().as_ref() {
            Some(model) => model
                .find_unreachable_states(self)
                .iter()
                .filter_map(|id| model.vertex(id).map(|v| v.name().to_string()))
                .collect(),
            None => Vec::new(),
        }
    }
}
