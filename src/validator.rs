/*!
The structural validator: runs once, at the start of
[`StateMachine::assemble`](crate::model::StateMachine), and either rejects an ill-formed model or
freezes it and emits the maps the execution engine and trigger composer need at runtime.
*/

use crate::core::Id;
use crate::error::{self, ElementKind, Result};
use crate::model::{PseudostateKind, Region, RegionOwner, State, StateKind, StateMachine, Transition, Vertex};
use log::trace;
use std::collections::{HashMap, HashSet};

// ------------------------------------------------------------------------------------------------
// Public Types
// ------------------------------------------------------------------------------------------------

/// Everything the validator computes from a frozen model: the full element registry plus the
/// derived maps §4.2 promises on success.
pub struct AssembledModel {
    pub(crate) vertices: HashMap<Id, Vertex>,
    pub(crate) regions: HashMap<Id, Region>,
    pub(crate) transitions: HashMap<Id, Transition>,
    /// Outermost-first list of enclosing states, keyed by vertex id.
    pub(crate) ancestors: HashMap<Id, Vec<State>>,
    /// For each `join` pseudostate, the source vertices of its incoming transitions.
    pub(crate) join_sources: HashMap<Id, Vec<Id>>,
    /// Every vertex referenced as the target of some transition.
    pub(crate) target_states: HashSet<Id>,
    /// Every transition owned by (i.e. with source =) a given vertex, declaration order.
    pub(crate) outgoing: HashMap<Id, Vec<Transition>>,
}

impl AssembledModel {
    pub fn vertex(&self, id: &Id) -> Option<&Vertex> {
        self.vertices.get(id)
    }

    pub fn region(&self, id: &Id) -> Option<&Region> {
        self.regions.get(id)
    }

    pub fn transition(&self, id: &Id) -> Option<&Transition> {
        self.transitions.get(id)
    }

    /// Every transition in the model, in no particular order. Used by `assemble` to bind each
    /// handle back to this model (see [`crate::model::Transition::source_state`]).
    pub(crate) fn all_transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.values()
    }

    pub fn ancestors(&self, id: &Id) -> &[State] {
        self.ancestors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn join_sources(&self, id: &Id) -> &[Id] {
        self.join_sources.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_target(&self, id: &Id) -> bool {
        self.target_states.contains(id)
    }

    /// The transitions owned by (sourced at) `id`, in declaration order. Empty for vertices with
    /// no outgoing transitions (final states, most simple states).
    pub fn outgoing(&self, id: &Id) -> &[Transition] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Vertices never reachable as a transition target and not the top-level initial — dead
    /// structure the caller probably did not intend.
    pub fn find_unreachable_states(&self, machine: &StateMachine) -> Vec<Id> {
        let mut reachable: HashSet<Id> = HashSet::new();
        for region in machine.regions() {
            if let Some(initial) = region.initial() {
                reachable.insert(initial.id().clone());
            }
        }
        reachable.extend(self.target_states.iter().cloned());
        self.vertices
            .keys()
            .filter(|id| !reachable.contains(*id))
            .cloned()
            .collect()
    }
}

// ------------------------------------------------------------------------------------------------
// Entry point
// ------------------------------------------------------------------------------------------------

pub fn validate(machine: &StateMachine) -> Result<AssembledModel> {
    let top_regions = machine.regions();
    if top_regions.is_empty() {
        return Err(not_allowed(machine, "must have at least one top-level region"));
    }

    let mut vertices = HashMap::new();
    let mut regions = HashMap::new();
    let mut transitions = HashMap::new();
    let mut ancestors = HashMap::new();
    let mut outgoing: HashMap<Id, Vec<Transition>> = HashMap::new();

    for region in &top_regions {
        index_region(region, &[], &mut vertices, &mut regions, &mut transitions, &mut ancestors, &mut outgoing);
    }

    let has_top_level_initial = top_regions.iter().any(|r| r.initial().is_some());
    if !has_top_level_initial {
        return Err(not_allowed(machine, "must have an initial pseudostate in its top-level region"));
    }

    let mut target_states = HashSet::new();
    for transition in transitions.values() {
        if let Some(target) = transition.target() {
            target_states.insert(target.clone());
        }
    }

    for region in regions.values() {
        validate_region(machine, region, &vertices, &regions, &target_states)?;
    }

    let join_sources = collect_join_sources(&vertices, &transitions);

    trace!(
        "{}",
        error::context(
            Some(&machine.name),
            ElementKind::StateMachine,
            &machine.name,
            &format!(
                "validated: {} vertices, {} regions, {} transitions",
                vertices.len(),
                regions.len(),
                transitions.len()
            ),
        )
    );

    Ok(AssembledModel {
        vertices,
        regions,
        transitions,
        ancestors,
        join_sources,
        target_states,
        outgoing,
    })
}

// ------------------------------------------------------------------------------------------------
// Indexing: walk the tree once, building the registries and the ancestor map
// ------------------------------------------------------------------------------------------------

fn index_region(
    region: &Region,
    enclosing: &[State],
    vertices: &mut HashMap<Id, Vertex>,
    regions: &mut HashMap<Id, Region>,
    transitions: &mut HashMap<Id, Transition>,
    ancestors: &mut HashMap<Id, Vec<State>>,
    outgoing: &mut HashMap<Id, Vec<Transition>>,
) {
    regions.insert(region.id().clone(), region.clone());
    for transition in region.transitions() {
        outgoing.entry(transition.source().clone()).or_default().push(transition.clone());
        transitions.insert(transition.id().clone(), transition);
    }
    for vertex in region.vertices() {
        ancestors.insert(vertex.id().clone(), enclosing.to_vec());
        if let Vertex::State(state) = &vertex {
            let mut nested = enclosing.to_vec();
            nested.push(state.clone());
            for sub_region in state.regions() {
                index_region(&sub_region, &nested, vertices, regions, transitions, ancestors, outgoing);
            }
        }
        vertices.insert(vertex.id().clone(), vertex);
    }
}

// ------------------------------------------------------------------------------------------------
// Per-element structural rules (§4.2)
// ------------------------------------------------------------------------------------------------

fn validate_region(
    machine: &StateMachine,
    region: &Region,
    vertices: &HashMap<Id, Vertex>,
    regions: &HashMap<Id, Region>,
    target_states: &HashSet<Id>,
) -> Result<()> {
    let owned = region.vertices();
    let incoming_by_target = incoming_transitions_by_target(region);

    let mut initial_count = 0;
    let mut shallow_history_count = 0;
    let mut deep_history_count = 0;

    for vertex in &owned {
        match vertex {
            Vertex::Pseudostate(p) => {
                let outgoing: Vec<_> = region
                    .transitions()
                    .into_iter()
                    .filter(|t| *t.source() == *p.id())
                    .collect();
                let incoming = incoming_by_target.get(p.id()).cloned().unwrap_or_default();

                match p.kind() {
                    PseudostateKind::Initial => {
                        initial_count += 1;
                        if !incoming.is_empty() {
                            return Err(not_allowed(machine, "an 'initial' pseudostate may not have incoming transitions"));
                        }
                        if outgoing.len() != 1 {
                            return Err(not_allowed(machine, "an 'initial' pseudostate must have exactly one outgoing transition"));
                        }
                        let target = outgoing[0].target().ok_or_else(|| {
                            not_allowed(machine, "an 'initial' pseudostate's transition must have a target")
                        })?;
                        if !region.vertices().iter().any(|v| v.id() == target) {
                            return Err(not_allowed(machine, "an 'initial' pseudostate must target a vertex in the same region"));
                        }
                        if matches!(vertices.get(target), Some(Vertex::Pseudostate(_))) {
                            return Err(not_allowed(machine, "an 'initial' pseudostate may not target another pseudostate"));
                        }
                    }
                    PseudostateKind::Terminate => {
                        if !outgoing.is_empty() {
                            return Err(not_allowed(machine, "a 'terminate' pseudostate may not have outgoing transitions"));
                        }
                    }
                    PseudostateKind::EntryPoint | PseudostateKind::ExitPoint => {
                        if outgoing.len() != 1 {
                            return Err(not_allowed(machine, "an entry/exit point must have exactly one outgoing transition"));
                        }
                        let edge = &outgoing[0];
                        if edge.has_guard() {
                            return Err(not_allowed(machine, "an entry/exit point's outgoing transition may not be guarded"));
                        }
                        let owner_state = region_owner_state(machine, region, vertices)?;
                        match owner_state.kind() {
                            StateKind::Composite | StateKind::SubMachine => {}
                            _ => return Err(not_allowed(machine, "an entry/exit point must be owned by a composite or submachine state")),
                        }
                        let target = edge
                            .target()
                            .ok_or_else(|| not_allowed(machine, "an entry/exit point's transition must have a target"))?;
                        let target_region = vertices.get(target).and_then(|v| v.owner());
                        if p.kind() == PseudostateKind::EntryPoint {
                            if target_region.as_ref() != Some(region.id()) {
                                return Err(not_allowed(machine, "an entry point must target a vertex in the owning state's own region"));
                            }
                        } else {
                            let enclosing_region = owner_state.owner();
                            if target_region != enclosing_region || target_region.as_ref() == Some(region.id()) {
                                return Err(not_allowed(
                                    machine,
                                    "an exit point must target a vertex in the parent state's enclosing region, not its own",
                                ));
                            }
                        }
                    }
                    PseudostateKind::Choice | PseudostateKind::Junction => {
                        if incoming.is_empty() {
                            return Err(not_allowed(machine, "a choice/junction pseudostate must have at least one incoming transition"));
                        }
                        if outgoing.is_empty() {
                            return Err(not_allowed(machine, "a choice/junction pseudostate must have at least one outgoing transition"));
                        }
                        let unguarded = outgoing.iter().filter(|t| !t.has_guard()).count();
                        if unguarded != 1 {
                            return Err(not_allowed(machine, "a choice/junction pseudostate must have exactly one unguarded default transition"));
                        }
                    }
                    PseudostateKind::Fork => {
                        if outgoing.len() < 2 {
                            return Err(not_allowed(machine, "a fork pseudostate must have at least two outgoing transitions"));
                        }
                        if outgoing.iter().any(|t| t.has_guard()) {
                            return Err(not_allowed(machine, "a fork pseudostate's outgoing transitions may not be guarded"));
                        }
                        validate_fork_join_coverage(machine, &outgoing, vertices, regions, true)?;
                    }
                    PseudostateKind::Join => {
                        if incoming.len() < 2 {
                            return Err(not_allowed(machine, "a join pseudostate must have at least two incoming transitions"));
                        }
                        if outgoing.len() != 1 {
                            return Err(not_allowed(machine, "a join pseudostate must have exactly one outgoing transition"));
                        }
                        validate_fork_join_coverage(machine, &incoming, vertices, regions, false)?;
                    }
                    PseudostateKind::ShallowHistory => {
                        shallow_history_count += 1;
                        validate_history(machine, &outgoing)?;
                    }
                    PseudostateKind::DeepHistory => {
                        deep_history_count += 1;
                        validate_history(machine, &outgoing)?;
                    }
                }
            }
            Vertex::FinalState(f) => {
                if region.transitions().iter().any(|t| *t.source() == *f.id()) {
                    return Err(not_allowed(machine, "a final state may not have outgoing transitions"));
                }
            }
            Vertex::State(_) => {}
        }
    }

    if initial_count > 1 {
        return Err(not_allowed(machine, "a region may have at most one 'initial' pseudostate"));
    }
    if shallow_history_count > 1 {
        return Err(not_allowed(machine, "a region may have at most one shallow-history pseudostate"));
    }
    if deep_history_count > 1 {
        return Err(not_allowed(machine, "a region may have at most one deep-history pseudostate"));
    }

    if let Some(RegionOwner::State(owner_id)) = region.owner() {
        if let Some(Vertex::State(owner)) = vertices.get(&owner_id) {
            if matches!(owner.kind(), StateKind::Composite | StateKind::Orthogonal) && target_states.contains(owner.id()) {
                let has_initial = owned.iter().any(|v| matches!(v, Vertex::Pseudostate(p) if p.is_initial()));
                let has_regular_state = owned.iter().any(|v| matches!(v, Vertex::State(_)));
                if !has_initial || !has_regular_state {
                    return Err(not_allowed(
                        machine,
                        "a region targeted by a transition must contain an initial pseudostate and at least one regular state",
                    ));
                }
            }
        }
    }

    Ok(())
}

fn validate_history(machine: &StateMachine, outgoing: &[Transition]) -> Result<()> {
    if outgoing.len() > 1 {
        return Err(not_allowed(machine, "a history pseudostate may have at most one outgoing (default) transition"));
    }
    if outgoing.iter().any(|t| t.has_guard()) {
        return Err(not_allowed(machine, "a history pseudostate's default transition may not be guarded"));
    }
    Ok(())
}

/// Checks the shared fork/join rule: every branch lands in a distinct region of one orthogonal
/// state, and every one of that state's regions is covered by some branch. `edges` is the fork's
/// outgoing transitions (one per branch, keyed by target) or the join's incoming transitions (one
/// per branch, keyed by source).
fn validate_fork_join_coverage(
    machine: &StateMachine,
    edges: &[Transition],
    vertices: &HashMap<Id, Vertex>,
    regions: &HashMap<Id, Region>,
    is_fork: bool,
) -> Result<()> {
    let label = if is_fork { "fork pseudostate" } else { "join pseudostate" };
    let mut seen_regions = HashSet::new();
    let mut owner_state_id: Option<Id> = None;

    for edge in edges {
        let vertex_id = if is_fork {
            edge.target().ok_or_else(|| not_allowed(machine, &format!("a {}'s outgoing transition must have a target", label)))?
        } else {
            edge.source()
        };
        let region_id = vertices
            .get(vertex_id)
            .and_then(|v| v.owner())
            .ok_or_else(|| not_allowed(machine, &format!("a {}'s branch vertex must belong to a region", label)))?;
        let branch_region = regions
            .get(&region_id)
            .ok_or_else(|| not_allowed(machine, &format!("a {}'s branch vertex's region is not indexed", label)))?;
        let state_id = match branch_region.owner() {
            Some(RegionOwner::State(id)) => id,
            _ => {
                return Err(not_allowed(
                    machine,
                    &format!("a {}'s branches must lead into regions owned by an orthogonal state, not a top-level region", label),
                ))
            }
        };
        match &owner_state_id {
            None => owner_state_id = Some(state_id),
            Some(existing) if *existing != state_id => {
                return Err(not_allowed(machine, &format!("a {}'s branches must all belong to regions of the same orthogonal state", label)))
            }
            _ => {}
        }
        if !seen_regions.insert(region_id) {
            return Err(not_allowed(machine, &format!("a {} may have at most one branch per region", label)));
        }
    }

    let owner_state_id = owner_state_id.expect("edges is non-empty, checked by the caller's arity rule");
    let owner_state = match vertices.get(&owner_state_id) {
        Some(Vertex::State(s)) => s,
        _ => return Err(not_allowed(machine, &format!("a {}'s coordinating vertex must be a regular state", label))),
    };
    if owner_state.kind() != StateKind::Orthogonal {
        return Err(not_allowed(machine, &format!("a {} must coordinate the regions of an orthogonal state", label)));
    }
    let all_regions: HashSet<Id> = owner_state.regions().iter().map(|r| r.id().clone()).collect();
    if seen_regions != all_regions {
        return Err(not_allowed(machine, &format!("a {} must cover every region of its orthogonal state", label)));
    }

    Ok(())
}

fn incoming_transitions_by_target(region: &Region) -> HashMap<Id, Vec<Transition>> {
    let mut map: HashMap<Id, Vec<Transition>> = HashMap::new();
    for transition in region.transitions() {
        if let Some(target) = transition.target() {
            map.entry(target.clone()).or_default().push(transition.clone());
        }
    }
    map
}

fn region_owner_state<'a>(machine: &StateMachine, region: &Region, vertices: &'a HashMap<Id, Vertex>) -> Result<&'a State> {
    match region.owner() {
        Some(RegionOwner::State(id)) => match vertices.get(&id) {
            Some(Vertex::State(s)) => Ok(s),
            _ => Err(not_allowed(machine, "a region's owner must be a regular state")),
        },
        _ => Err(not_allowed(machine, "a region with a pseudostate owned by it must itself be owned by a state")),
    }
}

fn collect_join_sources(vertices: &HashMap<Id, Vertex>, transitions: &HashMap<Id, Transition>) -> HashMap<Id, Vec<Id>> {
    let mut map: HashMap<Id, Vec<Id>> = HashMap::new();
    for vertex in vertices.values() {
        if let Vertex::Pseudostate(p) = vertex {
            if p.is_join() {
                let sources: Vec<Id> = transitions
                    .values()
                    .filter(|t| t.target().map(|target| target == p.id()).unwrap_or(false))
                    .map(|t| t.source().clone())
                    .collect();
                map.insert(p.id().clone(), sources);
            }
        }
    }
    map
}

fn not_allowed(machine: &StateMachine, detail: &str) -> error::Error {
    error::ErrorKind::NotAllowed(error::context(Some(&machine.name), ElementKind::StateMachine, &machine.name, detail)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{make_pseudostate, make_region, make_state, make_state_machine};
    use crate::model::{PseudostateKind, Vertex};

    fn simple_two_state_machine() -> StateMachine {
        let machine = make_state_machine("flip_flop");
        let region = make_region("r");
        let initial = make_pseudostate("init", PseudostateKind::Initial);
        let off = make_state("off");
        let on = make_state("on");
        region.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
        region.with_sub_state(Vertex::State(off.clone())).unwrap();
        region.with_sub_state(Vertex::State(on)).unwrap();
        region
            .with_transition(crate::builder::TransitionSpec::completion(
                "start",
                &Vertex::Pseudostate(initial),
                &Vertex::State(off),
            ))
            .unwrap();
        machine.with_region(region).unwrap();
        machine
    }

    #[test]
    fn test_validate_accepts_well_formed_machine() {
        let machine = simple_two_state_machine();
        assert!(validate(&machine).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_initial() {
        let machine = make_state_machine("no_initial");
        let region = make_region("r");
        region.with_sub_state(Vertex::State(make_state("only"))).unwrap();
        machine.with_region(region).unwrap();
        assert!(validate(&machine).is_err());
    }

    #[test]
    fn test_find_unreachable_states() {
        let machine = simple_two_state_machine();
        let model = validate(&machine).unwrap();
        let unreachable = model.find_unreachable_states(&machine);
        // "on" is never targeted by any transition and isn't the initial target.
        assert_eq!(unreachable.len(), 1);
    }

    fn machine_with_entry_point(target_outside_own_region: bool) -> StateMachine {
        let machine = make_state_machine("entry_point_machine");
        let top = make_region("top");
        let initial = make_pseudostate("init", PseudostateKind::Initial);
        let composite = make_state("composite");
        let outside = make_state("outside");
        top.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
        top.with_sub_state(Vertex::State(composite.clone())).unwrap();
        top.with_sub_state(Vertex::State(outside.clone())).unwrap();
        top.with_transition(crate::builder::TransitionSpec::completion(
            "start",
            &Vertex::Pseudostate(initial),
            &Vertex::State(composite.clone()),
        ))
        .unwrap();

        let entry_point = make_pseudostate("ep", PseudostateKind::EntryPoint);
        composite.with_sub_state(Vertex::Pseudostate(entry_point.clone())).unwrap();
        let inner_init = make_pseudostate("inner_init", PseudostateKind::Initial);
        let inner_state = make_state("inner");
        composite.with_sub_state(Vertex::Pseudostate(inner_init.clone())).unwrap();
        composite.with_sub_state(Vertex::State(inner_state.clone())).unwrap();
        let inner_region = composite.regions().into_iter().next().unwrap();
        inner_region
            .with_transition(crate::builder::TransitionSpec::completion(
                "enter_inner",
                &Vertex::Pseudostate(inner_init),
                &Vertex::State(inner_state.clone()),
            ))
            .unwrap();

        let entry_target = if target_outside_own_region { Vertex::State(outside) } else { Vertex::State(inner_state) };
        inner_region
            .with_transition(crate::builder::TransitionSpec::completion("via_ep", &Vertex::Pseudostate(entry_point), &entry_target))
            .unwrap();

        machine.with_region(top).unwrap();
        machine
    }

    #[test]
    fn test_entry_point_targeting_own_region_accepted() {
        let machine = machine_with_entry_point(false);
        assert!(validate(&machine).is_ok());
    }

    #[test]
    fn test_entry_point_targeting_outside_own_region_rejected() {
        let machine = machine_with_entry_point(true);
        assert!(validate(&machine).is_err());
    }

    /// Builds an orthogonal `split` state with three regions (`a`, `b`, `c`), each with a work
    /// state feeding a join `j`. `covered` controls how many of the three regions the join's
    /// incoming transitions are wired from, to probe the coverage rule.
    fn machine_with_join(covered: &[&str]) -> StateMachine {
        let machine = make_state_machine("join_machine");
        let top = make_region("top");
        let initial = make_pseudostate("init", PseudostateKind::Initial);
        let split = make_state("split");
        let join = make_pseudostate("j", PseudostateKind::Join);
        let merged = make_state("merged");
        top.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
        top.with_sub_state(Vertex::State(split.clone())).unwrap();
        top.with_sub_state(Vertex::Pseudostate(join.clone())).unwrap();
        top.with_sub_state(Vertex::State(merged.clone())).unwrap();
        top.with_transition(crate::builder::TransitionSpec::completion("start", &Vertex::Pseudostate(initial), &Vertex::State(split.clone())))
            .unwrap();
        top.with_transition(crate::builder::TransitionSpec::completion("merge", &Vertex::Pseudostate(join.clone()), &Vertex::State(merged)))
            .unwrap();

        for label in ["a", "b", "c"] {
            let region = make_region(label);
            let r_init = make_pseudostate(&format!("init_{}", label), PseudostateKind::Initial);
            let work = make_state(&format!("work_{}", label));
            region.with_sub_state(Vertex::Pseudostate(r_init.clone())).unwrap();
            region.with_sub_state(Vertex::State(work.clone())).unwrap();
            region
                .with_transition(crate::builder::TransitionSpec::completion(&format!("enter_{}", label), &Vertex::Pseudostate(r_init), &Vertex::State(work.clone())))
                .unwrap();
            if covered.contains(&label) {
                region
                    .with_transition(crate::builder::TransitionSpec::completion(&format!("to_join_{}", label), &Vertex::State(work), &Vertex::Pseudostate(join.clone())))
                    .unwrap();
            }
            split.with_region(region).unwrap();
        }

        machine.with_region(top).unwrap();
        machine
    }

    #[test]
    fn test_join_covering_all_regions_accepted() {
        let machine = machine_with_join(&["a", "b", "c"]);
        assert!(validate(&machine).is_ok());
    }

    #[test]
    fn test_join_not_covering_every_region_rejected() {
        // Only two of `split`'s three regions feed the join.
        let machine = machine_with_join(&["a", "b"]);
        assert!(validate(&machine).is_err());
    }

    #[test]
    fn test_join_from_same_region_twice_rejected() {
        let machine = make_state_machine("join_same_region");
        let top = make_region("top");
        let initial = make_pseudostate("init", PseudostateKind::Initial);
        let split = make_state("split");
        let join = make_pseudostate("j", PseudostateKind::Join);
        let merged = make_state("merged");
        top.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
        top.with_sub_state(Vertex::State(split.clone())).unwrap();
        top.with_sub_state(Vertex::Pseudostate(join.clone())).unwrap();
        top.with_sub_state(Vertex::State(merged.clone())).unwrap();
        top.with_transition(crate::builder::TransitionSpec::completion("start", &Vertex::Pseudostate(initial), &Vertex::State(split.clone())))
            .unwrap();
        top.with_transition(crate::builder::TransitionSpec::completion("merge", &Vertex::Pseudostate(join.clone()), &Vertex::State(merged)))
            .unwrap();

        let region_a = make_region("a");
        let init_a = make_pseudostate("init_a", PseudostateKind::Initial);
        let work_a1 = make_state("work_a1");
        let work_a2 = make_state("work_a2");
        region_a.with_sub_state(Vertex::Pseudostate(init_a.clone())).unwrap();
        region_a.with_sub_state(Vertex::State(work_a1.clone())).unwrap();
        region_a.with_sub_state(Vertex::State(work_a2.clone())).unwrap();
        region_a
            .with_transition(crate::builder::TransitionSpec::completion("enter_a1", &Vertex::Pseudostate(init_a), &Vertex::State(work_a1.clone())))
            .unwrap();
        // Two distinct vertices of the *same* region both feed the join, instead of one per
        // sibling region.
        region_a
            .with_transition(crate::builder::TransitionSpec::completion("a1_to_join", &Vertex::State(work_a1), &Vertex::Pseudostate(join.clone())))
            .unwrap();
        region_a
            .with_transition(crate::builder::TransitionSpec::completion("a2_to_join", &Vertex::State(work_a2), &Vertex::Pseudostate(join.clone())))
            .unwrap();

        let region_b = make_region("b");
        let init_b = make_pseudostate("init_b", PseudostateKind::Initial);
        let work_b = make_state("work_b");
        region_b.with_sub_state(Vertex::Pseudostate(init_b.clone())).unwrap();
        region_b.with_sub_state(Vertex::State(work_b.clone())).unwrap();
        region_b
            .with_transition(crate::builder::TransitionSpec::completion("enter_b", &Vertex::Pseudostate(init_b), &Vertex::State(work_b)))
            .unwrap();

        split.with_region(region_a).unwrap();
        split.with_region(region_b).unwrap();
        machine.with_region(top).unwrap();

        assert!(validate(&machine).is_err());
    }
}
