//! Continuations and the trampoline contract.
//!
//! A continuation is an opaque, resumable computation: stepping it either
//! produces the next continuation to run or the terminal sentinel
//! ([`Next`] is `None`). Continuations are single-owner — at any moment a
//! live one sits in exactly one of the suspended table, the ready queue,
//! or the trampoline's local variable.

use crate::dispatcher::Dispatcher;
use crate::error::Result;

/// What a step produced: more work, or done.
pub type Next = Option<Cont>;

/// A resumable computation unit.
///
/// `step` consumes the continuation and returns the next state. Suspension
/// happens by handing `self` to one of the dispatcher's primitives
/// (`sleep`, `io`, `wait`, `yield_now`, ...) and returning whatever the
/// primitive returns. `clone_cont` is the polymorphic shallow copy `fork`
/// relies on; for `Clone` types it is just `Cont::new(self.clone())`.
pub trait Continuation: 'static {
    fn step(self: Box<Self>, disp: &mut Dispatcher) -> Result<Next>;

    fn clone_cont(&self) -> Cont;
}

/// An owned, type-erased continuation.
pub struct Cont(Box<dyn Continuation>);

impl Cont {
    pub fn new<C: Continuation>(c: C) -> Cont {
        Cont(Box::new(c))
    }

    /// Build a single-step continuation from a closure.
    ///
    /// The closure receives the dispatcher and returns the next state —
    /// typically the result of a suspension primitive, `Ok(None)` to
    /// finish, or `Ok(Some(...))` to chain another step inline.
    pub fn from_fn<F>(f: F) -> Cont
    where
        F: FnOnce(&mut Dispatcher) -> Result<Next> + Clone + 'static,
    {
        Cont::new(StepFn(f))
    }

    pub(crate) fn step(self, disp: &mut Dispatcher) -> Result<Next> {
        self.0.step(disp)
    }
}

impl Clone for Cont {
    fn clone(&self) -> Cont {
        self.0.clone_cont()
    }
}

impl std::fmt::Debug for Cont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cont(..)")
    }
}

struct StepFn<F>(F);

impl<F> Continuation for StepFn<F>
where
    F: FnOnce(&mut Dispatcher) -> Result<Next> + Clone + 'static,
{
    fn step(self: Box<Self>, disp: &mut Dispatcher) -> Result<Next> {
        (self.0)(disp)
    }

    fn clone_cont(&self) -> Cont {
        Cont::new(StepFn(self.0.clone()))
    }
}
