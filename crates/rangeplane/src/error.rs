//! Controller-side error taxonomy.
//!
//! Errors never unwind a tick: they are recorded on the entity involved,
//! surfaced through operator completion handles and logs, and the next tick
//! re-evaluates from current state.

use crate::range::Action;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A state transition was disallowed by the placement/range state machine
    /// or an operation gate. Retried on the next tick.
    #[error("transition rejected: {0}")]
    TransitionRejected(String),

    /// A catalog write failed; the in-memory mutation was rolled back.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// A node-facing command failed after retries.
    #[error("{action} failed on {node}: {reason}")]
    RpcFailed {
        action: Action,
        node: String,
        reason: String,
    },

    /// A split/join cannot proceed; the operator channel receives this.
    #[error("operation aborted: {0}")]
    OperationAborted(String),

    /// Detected by the reconciler; escalated to a human operator.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// No healthy node satisfies the placement constraint.
    #[error("no candidate node available")]
    NoCandidate,

    #[error("not found: {0}")]
    NotFound(String),
}
