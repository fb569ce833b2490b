//! Opt-in thread-local dispatcher.
//!
//! The primary API passes a `&mut Dispatcher` explicitly; this module
//! serves call sites that want a per-thread singleton instead. Each thread
//! gets its own independent dispatcher, created on first touch.
//!
//! CRITICAL: the cell stays borrowed for the whole duration of a call, and
//! `run` keeps it borrowed while continuations execute. Step bodies must
//! therefore use the `&mut Dispatcher` they are handed, never the
//! functions in this module — re-entering the cell panics.

use std::cell::RefCell;
use std::time::Duration;

use crate::cont::Cont;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::semaphore::Semaphore;

thread_local! {
    static DISPATCHER: RefCell<Dispatcher> = RefCell::new(Dispatcher::new());
}

/// Run `f` against this thread's dispatcher.
pub fn with<R>(f: impl FnOnce(&mut Dispatcher) -> R) -> R {
    DISPATCHER.with(|cell| f(&mut cell.borrow_mut()))
}

pub fn spawn(c: Cont) -> Result<()> {
    with(|disp| disp.spawn(c))
}

pub fn trampoline(c: Cont) -> Result<()> {
    with(|disp| disp.trampoline(c))
}

pub fn run(interval: Duration) -> Result<()> {
    with(|disp| disp.run(interval))
}

pub fn stop() -> Result<()> {
    with(|disp| disp.stop())
}

pub fn len() -> usize {
    with(|disp| disp.len())
}

pub fn new_semaphore() -> Result<Semaphore> {
    with(|disp| disp.new_semaphore())
}
