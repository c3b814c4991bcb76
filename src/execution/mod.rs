// src/execution/mod.rs

//! Two-phase futures used throughout runbridge.
//!
//! An [`Execution`] represents an asynchronous operation with two observable
//! checkpoints: *started* (the operation is up and usable) and *ended* (it
//! finished). Either phase can instead be rejected with a [`Failure`].
//!
//! - [`deferred`] holds the controller ([`DeferredExecution`]) and the
//!   read-only handle ([`Execution`]).
//!
//! The only way to move an execution forward is through the controller's
//! `start` / `end` / `fail` methods (or the timers built on top of them).

use thiserror::Error;

pub mod deferred;

pub use deferred::{DeferredExecution, Execution};

/// Rejection reason carried by a failed execution phase.
///
/// `Cancelled` is raised when a stop was explicitly requested while the
/// operation was in flight; `Error` is everything else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("{0}")]
    Cancelled(String),
    #[error("{0}")]
    Error(String),
}

impl Failure {
    pub fn error(message: impl Into<String>) -> Self {
        Failure::Error(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Failure::Cancelled(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Failure::Cancelled(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Failure::Cancelled(msg) | Failure::Error(msg) => msg,
        }
    }

    pub(crate) fn abandoned() -> Self {
        Failure::Error("execution abandoned before it settled".to_string())
    }
}

/// Snapshot of an execution's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState<S, E> {
    Pending,
    Started(S),
    Ended(S, E),
    StartFailed(Failure),
    EndFailed(S, Failure),
}

impl<S, E> ExecutionState<S, E> {
    /// Ended or failed in either phase.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Ended(..) | ExecutionState::StartFailed(_) | ExecutionState::EndFailed(..)
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ExecutionState::Pending)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ExecutionState::StartFailed(f) | ExecutionState::EndFailed(_, f) => Some(f),
            _ => None,
        }
    }
}
