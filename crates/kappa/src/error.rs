//! Dispatcher error taxonomy.

use std::io;

use thiserror::Error;

use crate::id::Id;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while scheduling or polling.
#[derive(Debug, Error)]
pub enum Error {
    /// A primitive was invoked with an argument outside its contract,
    /// e.g. a sub-millisecond sleep or an empty readiness interest set.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A readiness event fired for an id with no suspended continuation.
    /// This is an invariant violation, not something callers can recover
    /// from; it is not expected in correct programs.
    #[error("no continuation registered for id {0}")]
    MissingRegistration(Id),

    /// The underlying selector failed.
    #[error("selector error: {0}")]
    Os(#[from] io::Error),
}
