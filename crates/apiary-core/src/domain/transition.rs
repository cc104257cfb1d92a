//! Who may move a task, and why a move was refused.

use chrono::{DateTime, Utc};
use std::fmt;

use super::WorkerId;

/// The caller requesting a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// A worker acting on a task it claimed (or wants to claim).
    Worker(WorkerId),

    /// The lease reaper.
    Reaper,

    /// An external retry / admin policy.
    Operator,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Worker(worker) => write!(f, "worker {worker}"),
            Actor::Reaper => f.write_str("reaper"),
            Actor::Operator => f.write_str("operator"),
        }
    }
}

/// The guard that refused a transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardViolation {
    #[error("not an edge of the state machine")]
    NotAllowed,

    #[error("{caller} is not the assignee")]
    NotAssignee { caller: Actor },

    #[error("already assigned to {0}")]
    AlreadyAssigned(WorkerId),

    #[error("lease still active until {0}")]
    LeaseActive(DateTime<Utc>),

    #[error("retry budget exhausted after {failures} failures")]
    RetryExhausted { failures: u32 },

    #[error("retry backoff pending until {0}")]
    BackoffPending(DateTime<Utc>),

    #[error("{0} may not perform this transition")]
    WrongActor(Actor),
}
