//! kappa: a single-threaded continuation dispatcher.
//!
//! Multiplexes user-level continuations — resumable computations shaped as
//! "given the current state, return the next state" — over OS readiness
//! events: fd readability/writability, timers, a user-triggered wake-up,
//! and a semaphore coordination primitive. Strictly cooperative, strictly
//! one thread; there is one independent dispatcher per thread.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use kappa::{Cont, Dispatcher};
//!
//! let mut disp = Dispatcher::new();
//! let sem = disp.new_semaphore()?;
//!
//! let waiter = {
//!     let sem = sem.clone();
//!     Cont::from_fn(move |disp| {
//!         let after = Cont::from_fn(|_| {
//!             println!("signalled!");
//!             Ok(None)
//!         });
//!         disp.wait(after, &sem)
//!     })
//! };
//! let signaller = {
//!     let sem = sem.clone();
//!     Cont::from_fn(move |disp| {
//!         let sem = sem.clone();
//!         disp.sleep(
//!             Cont::from_fn(move |disp| {
//!                 disp.signal(&sem)?;
//!                 Ok(None)
//!             }),
//!             Duration::from_millis(10),
//!         )
//!     })
//! };
//!
//! disp.spawn(waiter)?;
//! disp.spawn(signaller)?;
//! disp.run(Duration::ZERO)?;   // returns once everything finished
//! ```
//!
//! Continuations suspend only inside the dispatcher's primitives
//! (`yield_now`, `sleep`, `io`, `wait`, `fork`, ...); between suspension
//! points a step body runs to completion. See [`Dispatcher`] for the full
//! contract.

// Registration tracing and per-step timing, compiled in by the
// `telemetry` feature and free otherwise.
macro_rules! trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "telemetry")]
        eprintln!("[dispatch] {}", format_args!($($arg)*));
    };
}
pub(crate) use trace;

mod cont;
mod dispatcher;
mod error;
mod id;
mod selector;
mod semaphore;
mod waiting;

pub mod local;

pub use cont::{Cont, Continuation, Next};
pub use dispatcher::{Dispatcher, State};
pub use error::{Error, Result};
pub use id::Id;
pub use selector::{READ, WRITE};
pub use semaphore::Semaphore;
pub use waiting::INITIAL_WAITING_CAPACITY;
