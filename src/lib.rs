/*!
A reasonably faithful implementation of the [Unified Modeling Language (UML)](http://uml.org/) State Machine.

The goal is to not just provide another state machine crate but to do so with a formal specification
that describes the description and execution semantics. This implementation is based upon the
[2.5.1](https://www.omg.org/spec/UML/2.5.1/PDF) version, dated 5th December 2017. Wherever possible
the documentation in each module references the specification, especially the constraints and
semantic rules it names.

The crate is organized around the distinction UML itself draws between a state machine's
*descriptive* model and its *execution*:

* [`builder`] and [`model`] describe the structure — regions, vertices, transitions — built
  detached and then attached into a containment tree via fluent `with_*` methods.
* [`validator`] runs once, at [`model::StateMachine::assemble`], checking the structural rules in
  §4.2 and freezing the model into an [`validator::AssembledModel`].
* [`trigger`] composes a vertex's outgoing transitions (plus any equally-triggered ancestor
  transitions) into the single merged subscription §4.3 describes.
* [`engine`] gives an assembled model a running configuration tree and drives the transitioning
  algorithm in §4.4.
* [`reactive`] is the abstract capability set (event sources, schedulers, subjects, cancellation)
  the engine consumes but does not implement, plus the minimal synchronous adapters this crate's
  own tests use.
* [`core`] holds the opaque [`core::Id`] type used as a stable back-reference throughout.

# Example

```rust
use std::rc::Rc;
use std::time::Duration;
use uml_state_machine::builder::{make_pseudostate, make_region, make_state, make_state_machine, TransitionSpec};
use uml_state_machine::model::{PseudostateKind, Vertex};
use uml_state_machine::reactive::{ImmediateScheduler, Scheduler};

let machine = make_state_machine("blinker");
let region = make_region("r");
let initial = make_pseudostate("init", PseudostateKind::Initial);
let off = make_state("off");
let on = make_state("on");
region.with_sub_state(Vertex::Pseudostate(initial.clone())).unwrap();
region.with_sub_state(Vertex::State(off.clone())).unwrap();
region.with_sub_state(Vertex::State(on.clone())).unwrap();

let scheduler: Rc<dyn Scheduler> = Rc::new(ImmediateScheduler::new());
region
    .with_transition(TransitionSpec::completion("start", &Vertex::Pseudostate(initial), &Vertex::State(off.clone())))
    .unwrap();
region
    .with_transition(TransitionSpec::timeout("flip", &Vertex::State(off), &Vertex::State(on), scheduler.clone(), Duration::from_millis(10)))
    .unwrap();
machine.with_region(region).unwrap();

let _ = machine.assemble(scheduler).unwrap();
assert!(machine.is_assembled());
```

# See Also

* [OMG Unified Modeling Language, Version 2.5.1](https://www.omg.org/spec/UML/2.5.1/PDF)
* [State Diagram (Wikipedia)](https://en.wikipedia.org/wiki/State_diagram)
* [UML State Machine (Wikipedia)](https://en.wikipedia.org/wiki/UML_state_machine)
* [StateMachines: A Visual Formalism for Complex Systems](https://www.inf.ed.ac.uk/teaching/courses/seoc/2005_2006/resources/StateMachines.pdf)
* [State Chart XML (SCXML): State Machine Notation for Control Abstraction](https://www.w3.org/TR/scxml/)

*/

#![warn(
    // ---------- Stylistic
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    // ---------- Public
    // missing_debug_implementations,
    // missing_docs,
    unreachable_pub,
    // ---------- Unsafe
    unsafe_code,
    // ---------- Unused
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
)]

#[macro_use]
extern crate error_chain;

// ------------------------------------------------------------------------------------------------
// Modules
// ------------------------------------------------------------------------------------------------

pub mod core;

pub mod error;

pub mod model;

pub mod builder;

pub mod validator;

pub mod trigger;

pub mod reactive;

pub mod engine;

pub use engine::TransitionEvent;
pub use model::StateMachine;
