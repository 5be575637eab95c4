//! Top-level error taxonomy.
//!
//! Per-component errors (`CounterError`, `ProcessError`, `RuntimeSessionError`,
//! `DmvError`, `StoreError`) live next to the component that raises them,
//! following the teacher's convention of one hand-rolled error enum per
//! collector file. The HTTP Reconstructor raises no error type of its own —
//! its only fallible leaf is the same `RuntimeSessionError` the Managed
//! Runtime Session uses, since both attach over the diagnostic channel.
//! `CoreError` is the narrow band
//! that is allowed to escape the Orchestrator's tick loop: spec.md §7
//! classifies everything else (`PrivilegeDenied`, `ResourceUnavailable`,
//! `TransientReadFailure`, `AttachFailed`, `Cancelled`) as non-propagating —
//! those are logged at the point of occurrence and turn into an absent field
//! or a skipped tick, never a `Result::Err` that reaches here.

use std::fmt;

use crate::store::StoreError;

/// Errors that are allowed to terminate a run (spec.md §7 "Fatal").
#[derive(Debug)]
pub enum CoreError {
    /// The store could not be opened, or a write failed unrecoverably.
    Store(StoreError),
    /// Any other condition severe enough to abandon the run.
    Other(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Store(e) => write!(f, "store error: {}", e),
            CoreError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Store(e)
    }
}
