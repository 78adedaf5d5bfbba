//! End-to-end scenarios driving a whole assembled machine through its public API: building it
//! with [`uml_state_machine::builder`], assembling it onto a scheduler, and observing the
//! transition feed and entry/exit side effects a caller would actually see.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use uml_state_machine::builder::{make_pseudostate, make_region, make_state, make_state_machine, TransitionSpec};
use uml_state_machine::model::{PseudostateKind, Vertex};
use uml_state_machine::reactive::{CancellationHandle, EventSource, ImmediateScheduler, Scheduler, SimpleSubject, Worker};
use uml_state_machine::TransitionEvent;

/// Initializes the env-logger once per test binary so `debug!`/`trace!` output from the engine
/// can be enabled with `RUST_LOG=uml_state_machine=trace cargo test -- --nocapture`.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Subscribes to a machine's transition feed and returns the shared log of transition names, in
/// the order they were taken.
fn subscribe_names(source: &Rc<dyn EventSource<TransitionEvent>>, scheduler: &Rc<dyn Scheduler>) -> Rc<RefCell<Vec<String>>> {
    let names = Rc::new(RefCell::new(Vec::new()));
    let names2 = names.clone();
    let worker = scheduler.worker();
    let _ = source.subscribe(
        worker.as_ref(),
        Rc::new(move |e: TransitionEvent| names2.borrow_mut().push(e.name().unwrap_or("").to_string())),
        Rc::new(|_| {}),
        Rc::new(|| {}),
    );
    names
}

// ------------------------------------------------------------------------------------------------
// Scenario 1: a two-state flip, driven by two independently triggered transitions
// ------------------------------------------------------------------------------------------------

#[test]
fn two_state_flip_alternates_on_each_trigger() {
    init_logging();
    let machine = make_state_machine("flip");
    let region = make_region("r");
    let initial = make_pseudostate("init", PseudostateKind::Initial);
    let s1 = make_state("s1");
    let s2 = make_state("s2");

    let entries: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let entries = entries.clone();
        s1.with_on_entry(move || entries.borrow_mut().push("s1".to_string())).unwrap();
    }
    {
        let entries = entries.clone();
        s2.with_on_entry(move || entries.borrow_mut().push("s2".to_string())).unwrap();
    }

    region.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
    region.with_sub_state(Vertex::State(s1.clone())).unwrap();
    region.with_sub_state(Vertex::State(s2.clone())).unwrap();
    region
        .with_transition(TransitionSpec::completion("enter_s1", &Vertex::Pseudostate(initial), &Vertex::State(s1.clone())))
        .unwrap();

    let t1: Rc<SimpleSubject<String>> = Rc::new(SimpleSubject::new());
    region
        .with_transition(TransitionSpec::triggered(
            "T1",
            &Vertex::State(s1.clone()),
            &Vertex::State(s2.clone()),
            t1.clone() as Rc<dyn EventSource<String>>,
            None,
            None,
        ))
        .unwrap();

    let t2: Rc<SimpleSubject<String>> = Rc::new(SimpleSubject::new());
    region
        .with_transition(TransitionSpec::triggered(
            "T2",
            &Vertex::State(s2.clone()),
            &Vertex::State(s1.clone()),
            t2.clone() as Rc<dyn EventSource<String>>,
            None,
            None,
        ))
        .unwrap();

    machine.with_region(region).unwrap();

    let scheduler: Rc<dyn Scheduler> = Rc::new(ImmediateScheduler::new());
    let source = machine.assemble(scheduler.clone()).unwrap();
    let names = subscribe_names(&source, &scheduler);

    t1.on_next("a".to_string());
    t2.on_next("b".to_string());

    assert_eq!(*names.borrow(), vec!["enter_s1", "T1", "T2"]);
    assert_eq!(*entries.borrow(), vec!["s1", "s2", "s1"]);
}

// ------------------------------------------------------------------------------------------------
// Scenario 2: a composite state's own completion transition, gated on an explicitly-driven inner
// region reaching its final state; cancelling the machine before that happens must suppress it.
// ------------------------------------------------------------------------------------------------

fn build_composite_with_delayed_completion() -> (uml_state_machine::StateMachine, Rc<SimpleSubject<()>>) {
    let machine = make_state_machine("composite_delayed");
    let region = make_region("r");
    let initial = make_pseudostate("init", PseudostateKind::Initial);
    let s1 = make_state("s1");
    let s2 = make_state("s2");
    region.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
    region.with_sub_state(Vertex::State(s1.clone())).unwrap();
    region.with_sub_state(Vertex::State(s2.clone())).unwrap();
    region
        .with_transition(TransitionSpec::completion("enter_s1", &Vertex::Pseudostate(initial), &Vertex::State(s1.clone())))
        .unwrap();
    region
        .with_transition(TransitionSpec::completion("done", &Vertex::State(s1.clone()), &Vertex::State(s2.clone())))
        .unwrap();

    let inner = make_region("inner");
    let inner_init = make_pseudostate("inner_init", PseudostateKind::Initial);
    let sa = make_state("sA");
    let sb = make_state("sB");
    let sfinal = uml_state_machine::builder::make_final_state("final_inner");
    inner.with_sub_state(Vertex::Pseudostate(inner_init.clone())).unwrap();
    inner.with_sub_state(Vertex::State(sa.clone())).unwrap();
    inner.with_sub_state(Vertex::State(sb.clone())).unwrap();
    inner.with_sub_state(Vertex::FinalState(sfinal.clone())).unwrap();
    inner
        .with_transition(TransitionSpec::completion("enter_a", &Vertex::Pseudostate(inner_init), &Vertex::State(sa.clone())))
        .unwrap();

    let advance: Rc<SimpleSubject<()>> = Rc::new(SimpleSubject::new());
    inner
        .with_transition(TransitionSpec::triggered(
            "advance",
            &Vertex::State(sa.clone()),
            &Vertex::State(sb.clone()),
            advance.clone() as Rc<dyn EventSource<()>>,
            None,
            None,
        ))
        .unwrap();
    inner
        .with_transition(TransitionSpec::completion("reach_final", &Vertex::State(sb.clone()), &Vertex::FinalState(sfinal)))
        .unwrap();

    s1.with_region(inner).unwrap();
    machine.with_region(region).unwrap();
    (machine, advance)
}

#[test]
fn composite_completion_fires_once_inner_region_finalizes() {
    init_logging();
    let (machine, advance) = build_composite_with_delayed_completion();
    let scheduler: Rc<dyn Scheduler> = Rc::new(ImmediateScheduler::new());
    let source = machine.assemble(scheduler.clone()).unwrap();
    let names = subscribe_names(&source, &scheduler);

    assert_eq!(*names.borrow(), vec!["enter_s1", "enter_a"]);

    advance.on_next(());

    assert_eq!(*names.borrow(), vec!["enter_s1", "enter_a", "advance", "reach_final", "done"]);
    assert_eq!(names.borrow().iter().filter(|n| *n == "done").count(), 1);
}

#[test]
fn terminating_before_inner_region_finalizes_suppresses_composite_completion() {
    init_logging();
    let (machine, advance) = build_composite_with_delayed_completion();
    let scheduler: Rc<dyn Scheduler> = Rc::new(ImmediateScheduler::new());
    let source = machine.assemble(scheduler.clone()).unwrap();
    let names = subscribe_names(&source, &scheduler);

    machine.terminate();
    assert!(machine.is_terminated());

    // The inner `advance` subject is still a live Rc, but the subscription that would have
    // carried it forward was cancelled by `terminate`, so publishing to it now is a no-op.
    advance.on_next(());

    assert!(!names.borrow().iter().any(|n| n == "done"));
    assert!(!names.borrow().iter().any(|n| n == "advance"));
}

// ------------------------------------------------------------------------------------------------
// Scenario 3: an orthogonal state with three regions and an explicit join, driven one region at a
// time; the join's single outgoing transition only fires once every region has reached it.
// ------------------------------------------------------------------------------------------------

#[test]
fn orthogonal_join_waits_for_all_three_regions() {
    init_logging();
    let machine = make_state_machine("fork_join");
    let top = make_region("top");
    let initial = make_pseudostate("init", PseudostateKind::Initial);
    let split = make_state("split");
    let join = make_pseudostate("j", PseudostateKind::Join);
    let s3 = make_state("s3");

    top.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
    top.with_sub_state(Vertex::State(split.clone())).unwrap();
    top.with_sub_state(Vertex::Pseudostate(join.clone())).unwrap();
    top.with_sub_state(Vertex::State(s3.clone())).unwrap();
    top.with_transition(TransitionSpec::completion("enter_split", &Vertex::Pseudostate(initial), &Vertex::State(split.clone())))
        .unwrap();
    top.with_transition(TransitionSpec::completion("reach_s3", &Vertex::Pseudostate(join.clone()), &Vertex::State(s3.clone())))
        .unwrap();

    let mut advances = Vec::new();
    for label in ["a", "b", "c"] {
        let region = make_region(&format!("r_{}", label));
        let r_init = make_pseudostate(&format!("init_{}", label), PseudostateKind::Initial);
        let work = make_state(&format!("work_{}", label));
        region.with_sub_state(Vertex::Pseudostate(r_init.clone())).unwrap();
        region.with_sub_state(Vertex::State(work.clone())).unwrap();
        region
            .with_transition(TransitionSpec::completion(&format!("enter_work_{}", label), &Vertex::Pseudostate(r_init), &Vertex::State(work.clone())))
            .unwrap();

        let advance: Rc<SimpleSubject<()>> = Rc::new(SimpleSubject::new());
        region
            .with_transition(TransitionSpec::triggered(
                &format!("advance_{}", label),
                &Vertex::State(work),
                &Vertex::Pseudostate(join.clone()),
                advance.clone() as Rc<dyn EventSource<()>>,
                None,
                None,
            ))
            .unwrap();
        split.with_region(region).unwrap();
        advances.push(advance);
    }

    machine.with_region(top).unwrap();

    let scheduler: Rc<dyn Scheduler> = Rc::new(ImmediateScheduler::new());
    let source = machine.assemble(scheduler.clone()).unwrap();
    let names = subscribe_names(&source, &scheduler);

    advances[0].on_next(());
    assert!(!names.borrow().iter().any(|n| n == "reach_s3"));

    advances[1].on_next(());
    assert!(!names.borrow().iter().any(|n| n == "reach_s3"));

    advances[2].on_next(());
    assert!(names.borrow().iter().any(|n| n == "reach_s3"));

    let seen = names.borrow().clone();
    let pos_c = seen.iter().position(|n| n == "advance_c").unwrap();
    let pos_join = seen.iter().position(|n| n == "reach_s3").unwrap();
    assert!(pos_join > pos_c, "join's outgoing transition must fire only after the third region arrives");
}

// ------------------------------------------------------------------------------------------------
// Scenario 4/5: history — a three-level nesting so shallow history (which only remembers the
// top-level substate and re-runs its own default entry) is distinguishable from deep history
// (which reconstructs the exact leaf that was active at exit).
// ------------------------------------------------------------------------------------------------

fn build_with_history(kind: PseudostateKind) -> (uml_state_machine::StateMachine, Rc<SimpleSubject<()>>, Rc<SimpleSubject<()>>, Rc<SimpleSubject<()>>) {
    let machine = make_state_machine("history");
    let top = make_region("top");
    let initial = make_pseudostate("init", PseudostateKind::Initial);
    let s1 = make_state("s1");
    let s2 = make_state("s2");
    top.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
    top.with_sub_state(Vertex::State(s1.clone())).unwrap();
    top.with_sub_state(Vertex::State(s2.clone())).unwrap();
    top.with_transition(TransitionSpec::completion("enter_s1", &Vertex::Pseudostate(initial), &Vertex::State(s1.clone())))
        .unwrap();

    let leave: Rc<SimpleSubject<()>> = Rc::new(SimpleSubject::new());
    top.with_transition(TransitionSpec::triggered(
        "leave",
        &Vertex::State(s1.clone()),
        &Vertex::State(s2.clone()),
        leave.clone() as Rc<dyn EventSource<()>>,
        None,
        None,
    ))
    .unwrap();

    let region1 = make_region("region1");
    let init1 = make_pseudostate("init1", PseudostateKind::Initial);
    let mid = make_state("mid");
    let history = make_pseudostate("history", kind);
    region1.with_sub_state(Vertex::Pseudostate(init1.clone())).unwrap();
    region1.with_sub_state(Vertex::State(mid.clone())).unwrap();
    region1.with_sub_state(Vertex::Pseudostate(history.clone())).unwrap();
    region1
        .with_transition(TransitionSpec::completion("enter_mid", &Vertex::Pseudostate(init1), &Vertex::State(mid.clone())))
        .unwrap();

    let return_subject: Rc<SimpleSubject<()>> = Rc::new(SimpleSubject::new());
    top.with_transition(TransitionSpec::triggered(
        "return",
        &Vertex::State(s2.clone()),
        &Vertex::Pseudostate(history),
        return_subject.clone() as Rc<dyn EventSource<()>>,
        None,
        None,
    ))
    .unwrap();

    let region2 = make_region("region2");
    let init2 = make_pseudostate("init2", PseudostateKind::Initial);
    let inner_a = make_state("inner_a");
    let inner_b = make_state("inner_b");
    region2.with_sub_state(Vertex::Pseudostate(init2.clone())).unwrap();
    region2.with_sub_state(Vertex::State(inner_a.clone())).unwrap();
    region2.with_sub_state(Vertex::State(inner_b.clone())).unwrap();
    region2
        .with_transition(TransitionSpec::completion("enter_inner_a", &Vertex::Pseudostate(init2), &Vertex::State(inner_a.clone())))
        .unwrap();

    let advance: Rc<SimpleSubject<()>> = Rc::new(SimpleSubject::new());
    region2
        .with_transition(TransitionSpec::triggered(
            "advance",
            &Vertex::State(inner_a),
            &Vertex::State(inner_b),
            advance.clone() as Rc<dyn EventSource<()>>,
            None,
            None,
        ))
        .unwrap();

    mid.with_region(region2).unwrap();
    s1.with_region(region1).unwrap();
    machine.with_region(top).unwrap();

    (machine, advance, leave, return_subject)
}

#[test]
fn deep_history_restores_the_exact_leaf_active_at_exit() {
    init_logging();
    let (machine, advance, leave, return_subject) = build_with_history(PseudostateKind::DeepHistory);
    let scheduler: Rc<dyn Scheduler> = Rc::new(ImmediateScheduler::new());
    let source = machine.assemble(scheduler.clone()).unwrap();
    let names = subscribe_names(&source, &scheduler);

    advance.on_next(()); // inner_a -> inner_b
    leave.on_next(()); // s1 -> s2, capturing history
    return_subject.on_next(()); // s2 -> deep history, should land back on inner_b directly

    assert_eq!(
        *names.borrow(),
        vec!["enter_s1", "enter_mid", "enter_inner_a", "advance", "leave", "return"]
    );

    // If deep history had actually restored inner_a (not inner_b), this would re-fire "advance"
    // a second time, since inner_a's own "advance" transition would be live again.
    advance.on_next(());
    assert_eq!(names.borrow().iter().filter(|n| *n == "advance").count(), 1);
}

#[test]
fn shallow_history_reruns_the_restored_substates_own_default_entry() {
    init_logging();
    let (machine, advance, leave, return_subject) = build_with_history(PseudostateKind::ShallowHistory);
    let scheduler: Rc<dyn Scheduler> = Rc::new(ImmediateScheduler::new());
    let source = machine.assemble(scheduler.clone()).unwrap();
    let names = subscribe_names(&source, &scheduler);

    advance.on_next(()); // inner_a -> inner_b
    leave.on_next(()); // s1 -> s2, capturing history
    return_subject.on_next(()); // s2 -> shallow history, remembers only "mid"

    // Shallow history only remembers region1's own top-level substate ("mid"); resolving "mid"
    // re-runs region2's own `initial` pseudostate, landing on inner_a again rather than inner_b.
    assert_eq!(
        *names.borrow(),
        vec!["enter_s1", "enter_mid", "enter_inner_a", "advance", "leave", "return", "enter_inner_a"]
    );
}

// ------------------------------------------------------------------------------------------------
// Scenario 6 (numbered 5 in this file's ordering): a guarded junction with two guarded branches
// and a default, exercised under every combination of guard values.
// ------------------------------------------------------------------------------------------------

fn build_guarded_junction(g1: bool, g2: bool) -> uml_state_machine::StateMachine {
    let machine = make_state_machine("junction");
    let region = make_region("r");
    let initial = make_pseudostate("init", PseudostateKind::Initial);
    let junction = make_pseudostate("junction", PseudostateKind::Junction);
    let y1 = make_state("y1");
    let y2 = make_state("y2");
    let y3 = make_state("y3");
    region.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
    region.with_sub_state(Vertex::Pseudostate(junction.clone())).unwrap();
    region.with_sub_state(Vertex::State(y1.clone())).unwrap();
    region.with_sub_state(Vertex::State(y2.clone())).unwrap();
    region.with_sub_state(Vertex::State(y3.clone())).unwrap();
    region
        .with_transition(TransitionSpec::completion("enter_junction", &Vertex::Pseudostate(initial), &Vertex::Pseudostate(junction.clone())))
        .unwrap();
    region
        .with_transition(TransitionSpec::completion("take_g1", &Vertex::Pseudostate(junction.clone()), &Vertex::State(y1)).guard(move || g1))
        .unwrap();
    region
        .with_transition(TransitionSpec::completion("take_g2", &Vertex::Pseudostate(junction.clone()), &Vertex::State(y2)).guard(move || g2))
        .unwrap();
    region
        .with_transition(TransitionSpec::completion("take_default", &Vertex::Pseudostate(junction), &Vertex::State(y3)))
        .unwrap();
    machine.with_region(region).unwrap();
    machine
}

#[test]
fn guarded_junction_picks_first_true_guard_else_default() {
    init_logging();
    let scheduler: Rc<dyn Scheduler> = Rc::new(ImmediateScheduler::new());

    let cases = [
        (true, true, "take_g1"),
        (true, false, "take_g1"),
        (false, true, "take_g2"),
        (false, false, "take_default"),
    ];

    for (g1, g2, expected) in cases {
        let machine = build_guarded_junction(g1, g2);
        let source = machine.assemble(scheduler.clone()).unwrap();
        let names = subscribe_names(&source, &scheduler);
        assert_eq!(*names.borrow(), vec!["enter_junction", expected]);
    }
}

// ------------------------------------------------------------------------------------------------
// Scenario 6: terminate — runs its own action, completes the output feed, never runs exit
// behaviors, and cancels every pending timer.
// ------------------------------------------------------------------------------------------------

struct ManualScheduler(Rc<RefCell<Vec<(Rc<Cell<bool>>, Box<dyn FnOnce()>)>>>);

struct CancelFlag(Rc<Cell<bool>>);

impl CancellationHandle for CancelFlag {
    fn cancel(&self) {
        self.0.set(true);
    }

    fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

impl Clone for ManualScheduler {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl ManualScheduler {
    fn new() -> Self {
        Self(Rc::new(RefCell::new(Vec::new())))
    }

    /// Runs every not-yet-cancelled pending action, in submission order.
    fn fire_all(&self) {
        let items = std::mem::take(&mut *self.0.borrow_mut());
        for (cancelled, action) in items {
            if !cancelled.get() {
                action();
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn worker(&self) -> Box<dyn Worker> {
        Box::new(self.clone())
    }
}

impl Worker for ManualScheduler {
    fn schedule(&self, action: Box<dyn FnOnce()>) -> Box<dyn CancellationHandle> {
        let flag = Rc::new(Cell::new(false));
        self.0.borrow_mut().push((flag.clone(), action));
        Box::new(CancelFlag(flag))
    }

    fn schedule_after(&self, _delay: Duration, action: Box<dyn FnOnce()>) -> Box<dyn CancellationHandle> {
        self.schedule(action)
    }

    fn is_serialized(&self) -> bool {
        true
    }
}

#[test]
fn terminate_runs_its_action_skips_exits_and_cancels_pending_timers() {
    init_logging();
    let machine = make_state_machine("terminate");
    let region = make_region("r");
    let initial = make_pseudostate("init", PseudostateKind::Initial);
    let s1 = make_state("s1");
    let terminate_pseudo = make_pseudostate("stop", PseudostateKind::Terminate);

    let exited: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let exited = exited.clone();
        s1.with_on_exit(move || exited.borrow_mut().push("s1".to_string())).unwrap();
    }

    region.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
    region.with_sub_state(Vertex::State(s1.clone())).unwrap();
    region.with_sub_state(Vertex::Pseudostate(terminate_pseudo.clone())).unwrap();
    region
        .with_transition(TransitionSpec::completion("enter_s1", &Vertex::Pseudostate(initial), &Vertex::State(s1.clone())))
        .unwrap();

    let timer_scheduler = ManualScheduler::new();
    let timer_scheduler_rc: Rc<dyn Scheduler> = Rc::new(timer_scheduler.clone());
    let never = make_state("never");
    region.with_sub_state(Vertex::State(never.clone())).unwrap();
    region
        .with_transition(TransitionSpec::timeout(
            "timeout_never_fires",
            &Vertex::State(s1.clone()),
            &Vertex::State(never),
            timer_scheduler_rc,
            Duration::from_millis(10),
        ))
        .unwrap();

    let terminate_action_ran = Rc::new(Cell::new(false));
    let terminate_trigger: Rc<SimpleSubject<()>> = Rc::new(SimpleSubject::new());
    {
        let terminate_action_ran = terminate_action_ran.clone();
        region
            .with_transition(
                TransitionSpec::triggered(
                    "to_terminate",
                    &Vertex::State(s1.clone()),
                    &Vertex::Pseudostate(terminate_pseudo),
                    terminate_trigger.clone() as Rc<dyn EventSource<()>>,
                    Some(Rc::new(move |_: &()| terminate_action_ran.set(true))),
                    None,
                )
                .action(|| {}),
            )
            .unwrap();
    }

    machine.with_region(region).unwrap();

    let scheduler: Rc<dyn Scheduler> = Rc::new(ImmediateScheduler::new());
    let source = machine.assemble(scheduler.clone()).unwrap();
    let names = subscribe_names(&source, &scheduler);

    let completed = Rc::new(Cell::new(false));
    {
        let completed = completed.clone();
        let worker = scheduler.worker();
        let _ = source.subscribe(worker.as_ref(), Rc::new(|_| {}), Rc::new(|_| {}), Rc::new(move || completed.set(true)));
    }

    terminate_trigger.on_next(());

    assert!(terminate_action_ran.get(), "the transition into the terminate pseudostate must run its own action");
    assert!(machine.is_terminated());
    assert!(completed.get(), "terminate must complete the output feed");
    assert!(!exited.borrow().contains(&"s1".to_string()), "terminate must not run exit behaviors");
    assert!(names.borrow().iter().any(|n| n == "to_terminate"));

    // The timer was cancelled by terminate; draining it now must not let it fire.
    timer_scheduler.fire_all();
    assert!(!names.borrow().iter().any(|n| n == "timeout_never_fires"));

    // Idempotent: terminating again does nothing further.
    machine.terminate();
    assert!(machine.is_terminated());
}
