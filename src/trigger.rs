/*!
The trigger composer (§4.3): turns a vertex's outgoing transitions, plus whichever ancestor
transitions are "equally triggered" to one of them, into a single subscription that delivers at
most one [`Decision`] per underlying occurrence.

Most transitions never need anything beyond a plain, independent subscription: their underlying
[`crate::reactive::EventSource::equality_key`] returns `None`, so [`build_cohorts`] never merges
them with anything owned by an ancestor. The mutual-exclusion machinery in this module
([`Blockers`]) only activates for the rarer case where a descendant vertex's own transition is
"equally triggered" (same key) to one owned further up the active state hierarchy: UML semantics
say the more specific (descendant) transition wins, even though the ancestor vertex is still
active and would otherwise fire its own copy independently.
*/

use crate::core::Id;
use crate::model::{Occurrence, Transition, TransitionTrigger};
use crate::reactive::{CancellationHandle, CompositeCancellation, NoopCancellation, Worker};
use log::trace;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

// ------------------------------------------------------------------------------------------------
// Decision
// ------------------------------------------------------------------------------------------------

/// One transition that has won its cohort: its guard (if any) already evaluated true, and `run`
/// executes the bound action (if any) exactly once.
pub struct Decision {
    pub transition_id: Id,
    pub run: Box<dyn FnOnce()>,
}

// ------------------------------------------------------------------------------------------------
// Blockers: cross-subscription mutual exclusion for equally-triggered ancestor transitions
// ------------------------------------------------------------------------------------------------

/// A per-transition reference-counted "is something more specific currently watching this
/// transition" flag. A vertex's own cohort subscription blocks every ancestor-owned transition it
/// merges in for as long as that subscription lives; the ancestor's own (separate) subscription of
/// that same transition checks the flag before firing and stays silent while blocked.
#[derive(Default)]
pub struct Blockers {
    counts: RefCell<HashMap<Id, usize>>,
}

impl Blockers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blocked(&self, id: &Id) -> bool {
        self.counts.borrow().get(id).copied().unwrap_or(0) > 0
    }
}

/// RAII handle returned by blocking a transition; releases on cancel or drop, whichever comes
/// first, and is idempotent so both paths can run.
pub struct BlockGuard {
    blockers: Rc<Blockers>,
    id: Id,
    released: Cell<bool>,
}

/// Associated function rather than a `&self` method: a `&Rc<Blockers>` receiver is not a stable
/// self type, and the guard needs to hold its own clone of the `Rc` to release on drop.
fn block(blockers: &Rc<Blockers>, id: Id) -> BlockGuard {
    *blockers.counts.borrow_mut().entry(id.clone()).or_insert(0) += 1;
    BlockGuard {
        blockers: blockers.clone(),
        id,
        released: Cell::new(false),
    }
}

impl BlockGuard {
    fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        let mut counts = self.blockers.counts.borrow_mut();
        if let Some(count) = counts.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.id);
            }
        }
    }
}

impl CancellationHandle for BlockGuard {
    fn cancel(&self) {
        self.release();
    }

    fn is_cancelled(&self) -> bool {
        self.released.get()
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

// ------------------------------------------------------------------------------------------------
// CompletionGates: the latch a composite/orthogonal state's completion transitions wait on
// ------------------------------------------------------------------------------------------------

/// Keyed by the `Id` of the state (not region) whose composite completion the gate tracks. A
/// simple state's completion gate is never explicitly closed, so [`CompletionGates::is_open`]
/// defaults to `true`: its completion transition is a candidate the instant the state is entered.
#[derive(Default)]
pub struct CompletionGates {
    gates: RefCell<HashMap<Id, GateState>>,
}

struct GateState {
    open: bool,
    waiters: Vec<Box<dyn FnOnce()>>,
}

impl Default for GateState {
    /// A gate nobody has ever closed belongs to a simple state, whose completion transitions are
    /// candidates the instant it's entered — so the default is open, not closed.
    fn default() -> Self {
        Self { open: true, waiters: Vec::new() }
    }
}

impl CompletionGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called the moment a composite/orthogonal state is (re-)entered, before its completion
    /// cohort subscribes, so that subscription's own `on_open` registration cannot race an
    /// already-open gate left over from a previous activation.
    pub fn close(&self, owner: &Id) {
        self.gates.borrow_mut().entry(owner.clone()).or_default().open = false;
    }

    pub fn is_open(&self, owner: &Id) -> bool {
        self.gates.borrow().get(owner).map(|g| g.open).unwrap_or(true)
    }

    /// Opens the gate and runs every waiter registered since it was last closed, in registration
    /// order. Called once every region of an orthogonal/composite state has reached quiescence.
    pub fn open(&self, owner: &Id) {
        let waiters = {
            let mut gates = self.gates.borrow_mut();
            let gate = gates.entry(owner.clone()).or_default();
            gate.open = true;
            std::mem::take(&mut gate.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// Runs `on_ready` once `owner`'s gate is open, synchronously if it already is.
    fn on_open(&self, owner: &Id, on_ready: Box<dyn FnOnce()>) {
        let mut gates = self.gates.borrow_mut();
        let gate = gates.entry(owner.clone()).or_default();
        if gate.open {
            drop(gates);
            on_ready();
        } else {
            gate.waiters.push(on_ready);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Cohort construction
// ------------------------------------------------------------------------------------------------

fn equality_key_of(t: &Transition) -> Option<crate::reactive::TriggerKey> {
    match t.trigger() {
        TransitionTrigger::Event(source) => source.equality_key(),
        _ => None,
    }
}

/// Groups `own` (a vertex's own outgoing transitions, in declaration order) with whichever
/// `ancestors_outgoing` transitions (nearest ancestor first) share an equality key with one of
/// them. Transitions in `own` whose source has no equality key (the common case) come back as
/// singleton cohorts. Ancestor transitions that match nobody in `own` are not this vertex's
/// concern: they are subscribed at the ancestor's own activation instead.
pub fn build_cohorts(own: &[Transition], ancestors_outgoing: &[&[Transition]]) -> Vec<Vec<Transition>> {
    own.iter()
        .map(|t| {
            let mut cohort = vec![t.clone()];
            if let Some(key) = equality_key_of(t) {
                for level in ancestors_outgoing {
                    for candidate in level.iter() {
                        if equality_key_of(candidate).as_ref() == Some(&key) {
                            cohort.push(candidate.clone());
                        }
                    }
                }
            }
            cohort
        })
        .collect()
}

// ------------------------------------------------------------------------------------------------
// TriggerComposer
// ------------------------------------------------------------------------------------------------

/// One composer is shared by an entire assembled machine: its [`Blockers`] and [`CompletionGates`]
/// state must be visible across every vertex's subscription for the mutual-exclusion and
/// deferred-completion mechanisms to work machine-wide.
pub struct TriggerComposer {
    blockers: Rc<Blockers>,
    gates: Rc<CompletionGates>,
}

impl TriggerComposer {
    pub fn new() -> Self {
        Self {
            blockers: Rc::new(Blockers::new()),
            gates: Rc::new(CompletionGates::new()),
        }
    }

    pub fn gates(&self) -> &Rc<CompletionGates> {
        &self.gates
    }

    /// Subscribes the merged stream for one active vertex. `own` is that vertex's own outgoing
    /// transitions; `ancestors_outgoing` lists every enclosing active ancestor's outgoing
    /// transitions, nearest first, used only to find equally-triggered cohort members.
    /// `ensure_entered` is called with a candidate's source vertex id immediately before its guard
    /// is evaluated, so a vertex whose entry behavior has not run yet (the deferred-entry case in
    /// §4.5) always runs it before the first guard that could fire off of it.
    pub fn subscribe(
        &self,
        worker: &dyn Worker,
        own: &[Transition],
        ancestors_outgoing: &[&[Transition]],
        ensure_entered: Rc<dyn Fn(&Id)>,
        on_decision: Rc<dyn Fn(Decision)>,
    ) -> Box<dyn CancellationHandle> {
        let composite = CompositeCancellation::new();
        for cohort in build_cohorts(own, ancestors_outgoing) {
            composite.add(self.subscribe_cohort(worker, &cohort, ensure_entered.clone(), on_decision.clone()));
        }
        Box::new(composite)
    }

    fn subscribe_cohort(
        &self,
        worker: &dyn Worker,
        cohort: &[Transition],
        ensure_entered: Rc<dyn Fn(&Id)>,
        on_decision: Rc<dyn Fn(Decision)>,
    ) -> Box<dyn CancellationHandle> {
        let anchor = &cohort[0];
        match anchor.trigger() {
            TransitionTrigger::Completion => {
                let owner = anchor.source().clone();
                let t = anchor.clone();
                self.gates.on_open(
                    &owner,
                    Box::new(move || {
                        ensure_entered(t.source());
                        let fires = t.eval_untriggered_guard();
                        trace!("completion transition {:?} guard evaluated to {}", t.id(), fires);
                        if fires {
                            let fired = t.clone();
                            on_decision(Decision {
                                transition_id: t.id().clone(),
                                run: Box::new(move || fired.run_untriggered_action()),
                            });
                        }
                    }),
                );
                Box::new(NoopCancellation)
            }
            TransitionTrigger::Timeout(scheduler, duration) => {
                let t = anchor.clone();
                let timer_worker = scheduler.worker();
                timer_worker.schedule_after(
                    *duration,
                    Box::new(move || {
                        ensure_entered(t.source());
                        let fires = t.eval_untriggered_guard();
                        trace!("timeout transition {:?} guard evaluated to {}", t.id(), fires);
                        if fires {
                            let fired = t.clone();
                            on_decision(Decision {
                                transition_id: t.id().clone(),
                                run: Box::new(move || fired.run_untriggered_action()),
                            });
                        }
                    }),
                )
            }
            TransitionTrigger::Event(_) => self.subscribe_event_cohort(worker, cohort, ensure_entered, on_decision),
        }
    }

    fn subscribe_event_cohort(
        &self,
        worker: &dyn Worker,
        cohort: &[Transition],
        ensure_entered: Rc<dyn Fn(&Id)>,
        on_decision: Rc<dyn Fn(Decision)>,
    ) -> Box<dyn CancellationHandle> {
        let composite = CompositeCancellation::new();
        let decided = Rc::new(Cell::new(false));

        for (idx, t) in cohort.iter().enumerate() {
            let source = match t.trigger() {
                TransitionTrigger::Event(source) => source.clone(),
                _ => continue,
            };
            if idx > 0 {
                composite.add(Box::new(block(&self.blockers, t.id().clone())));
            }
            let decided = decided.clone();
            let blockers = self.blockers.clone();
            let t_id = t.id().clone();
            let t_source = t.source().clone();
            let ensure_entered = ensure_entered.clone();
            let on_decision = on_decision.clone();
            let handle = source.subscribe(
                worker,
                Rc::new(move |occurrence: Occurrence| {
                    if idx == 0 {
                        decided.set(false);
                        if blockers.is_blocked(&t_id) {
                            trace!("candidate transition suppressed by a more specific active cohort");
                            return;
                        }
                    }
                    if decided.get() {
                        return;
                    }
                    ensure_entered(&t_source);
                    let fires = occurrence.guard.as_ref().map(|g| g()).unwrap_or(true);
                    trace!("event transition {:?} guard evaluated to {}", t_id, fires);
                    if fires {
                        decided.set(true);
                        on_decision(Decision {
                            transition_id: t_id.clone(),
                            run: occurrence.run_action,
                        });
                    }
                }),
            );
            composite.add(handle);
        }
        Box::new(composite)
    }
}

impl Default for TriggerComposer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_gate_defaults_open() {
        let gates = CompletionGates::new();
        let owner = Id::random();
        assert!(gates.is_open(&owner));
    }

    #[test]
    fn test_completion_gate_close_then_open_runs_waiters() {
        let gates = CompletionGates::new();
        let owner = Id::random();
        gates.close(&owner);
        assert!(!gates.is_open(&owner));

        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        gates.on_open(&owner, Box::new(move || ran2.set(true)));
        assert!(!ran.get());

        gates.open(&owner);
        assert!(ran.get());
    }

    #[test]
    fn test_completion_gate_on_open_runs_immediately_when_never_closed() {
        let gates = CompletionGates::new();
        let owner = Id::random();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        gates.on_open(&owner, Box::new(move || ran2.set(true)));
        assert!(ran.get());
    }

    #[test]
    fn test_blocker_suppresses_while_held() {
        let blockers = Rc::new(Blockers::new());
        let id = Id::random();
        assert!(!blockers.is_blocked(&id));
        let guard = block(&blockers, id.clone());
        assert!(blockers.is_blocked(&id));
        drop(guard);
        assert!(!blockers.is_blocked(&id));
    }

    #[test]
    fn test_build_cohorts_singleton_without_equality_key() {
        use crate::builder::{make_region, make_state, TransitionSpec};
        use crate::model::Vertex;
        use crate::reactive::SimpleSubject;

        let region = make_region("r");
        let off = make_state("off");
        let on = make_state("on");
        region.with_sub_state(Vertex::State(off.clone())).unwrap();
        region.with_sub_state(Vertex::State(on.clone())).unwrap();

        let subject: Rc<SimpleSubject<bool>> = Rc::new(SimpleSubject::new());
        let spec = TransitionSpec::triggered(
            "flip",
            &Vertex::State(off.clone()),
            &Vertex::State(on.clone()),
            subject as Rc<dyn crate::reactive::EventSource<bool>>,
            None,
            None,
        );
        region.with_transition(spec).unwrap();

        let own: Vec<Transition> = region.transitions();
        let cohorts = build_cohorts(&own, &[]);
        assert_eq!(cohorts.len(), own.len());
        assert!(cohorts.iter().all(|c| c.len() == 1));
    }
}
