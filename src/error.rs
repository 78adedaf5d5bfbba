/*!
Provides a common error implementation, error kind enumeration, and constrained result type.

Every error kind carries a single formatted `String` built by [`context`], which applies the
diagnostic prefix `"In state machine '<name>': <element kind> '<name>' "` that every error message
from this crate shares.
*/

error_chain! {
    types {
        ChainError, ErrorKind, ResultExt, ChainResult;
    }

    errors {
        #[doc = "A structural rule was violated, or a builder method was called after `assemble`."]
        NotAllowed(context: String) {
            description("structural rule violated, or mutation attempted after assembly")
            display("{}", context)
        }

        #[doc = "An orthogonal region tried to finalize while a sibling awaits join, or vice versa."]
        JoinError(context: String) {
            description("sibling regions of an orthogonal state disagree on join vs. finalize")
            display("{}", context)
        }

        #[doc = "A transition (or other) handle was used after its owning state machine was dropped."]
        DeletedError(context: String) {
            description("handle used after its owning state machine was dropped")
            display("{}", context)
        }

        #[doc = "A typed accessor was invoked against a vertex of the wrong variant."]
        StateError(context: String) {
            description("typed accessor invoked with a mismatched vertex variant")
            display("{}", context)
        }

        #[doc = "An invariant the engine is responsible for preserving was broken."]
        InternalError(context: String) {
            description("an internal invariant was broken")
            display("{}", context)
        }
    }
}

// ------------------------------------------------------------------------------------------------
// `Error`: a cheaply-`Clone`-able wrapper around the `error_chain`-generated error
// ------------------------------------------------------------------------------------------------

/// The crate's error type. `error_chain!` itself generates a non-`Clone` error (it carries a
/// backtrace); this wraps it in an `Rc` so that [`crate::reactive::Subject::on_error`] can hand
/// the same error to every observer without re-running the fallible body that produced it.
#[derive(Clone, Debug)]
pub struct Error(std::rc::Rc<ChainError>);

/// The crate-wide result alias; every fallible builder, validator, and engine operation returns
/// this, with `?` converting from [`ChainError`]/[`ErrorKind`] via the `From` impls below.
pub type Result<T> = std::result::Result<T, Error>;

impl From<ChainError> for Error {
    fn from(e: ChainError) -> Self {
        Error(std::rc::Rc::new(e))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(std::rc::Rc::new(kind.into()))
    }
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.kind()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(self.0.as_ref())
    }
}

/// Element kind names used in the `context` prefix, kept as a small closed set so messages stay
/// consistent between the validator, the builder, and the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    StateMachine,
    Region,
    State,
    Pseudostate,
    FinalState,
    Transition,
}

impl ElementKind {
    fn as_str(self) -> &'static str {
        match self {
            ElementKind::StateMachine => "state machine",
            ElementKind::Region => "region",
            ElementKind::State => "state",
            ElementKind::Pseudostate => "pseudostate",
            ElementKind::FinalState => "final state",
            ElementKind::Transition => "transition",
        }
    }
}

/// Builds the `"In state machine '<machine>': <kind> '<name>' <detail>"` prefix shared by every
/// error and log line the crate emits. `machine_name` is `None` for elements that have not yet
/// been attached to a state machine (the builder phase, before `assemble`), in which case the
/// leading clause is omitted.
pub fn context(machine_name: Option<&str>, kind: ElementKind, element_name: &str, detail: &str) -> String {
    match machine_name {
        Some(name) => format!(
            "In state machine '{}': {} '{}' {}",
            name,
            kind.as_str(),
            element_name,
            detail
        ),
        None => format!("{} '{}' {}", kind.as_str(), element_name, detail),
    }
}
