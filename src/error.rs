//! Harness error types

use std::time::Duration;

use lincheck::{ClientId, HistoryError, Key, OpId, Value, Violation};
use thiserror::Error;

use crate::observer::{PathCounts, PathProperty};
use crate::protocol::{CommitPath, LaunchError, ReplicaId, SeqNum, TransportError, View};
use crate::replica::ReplicaState;

/// Result alias used throughout the harness
pub type Result<T> = std::result::Result<T, HarnessError>;

/// A failed scenario step
///
/// None of these are retried by the harness itself. Client requests are
/// retried inside the client, and only surface here once retries run out.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{replica} did not become {target} within {timeout:?}")]
    ReplicaTransitionTimeout {
        replica: ReplicaId,
        target: ReplicaState,
        timeout: Duration,
    },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("unknown replica {0}")]
    UnknownReplica(ReplicaId),

    #[error("view of {replica} did not reach the expected value within {timeout:?} (last observed: {last_view:?})")]
    ViewTimeout {
        replica: ReplicaId,
        last_view: Option<View>,
        timeout: Duration,
    },

    #[error("{property} does not hold: {counts}")]
    PathAssertion {
        property: PathProperty,
        counts: PathCounts,
    },

    #[error("{property} did not hold within {timeout:?} (last observed: {last})")]
    PathAssertionTimeout {
        property: PathProperty,
        last: PathCounts,
        timeout: Duration,
    },

    #[error("sequence number {seq} was reported as {reported:?} after being recorded as {recorded:?}")]
    InconsistentPath {
        seq: SeqNum,
        recorded: CommitPath,
        reported: CommitPath,
    },

    #[error("{client} operation {op:?} failed: {reason}")]
    OperationFailure {
        client: ClientId,
        op: Option<OpId>,
        reason: FailureReason,
    },

    #[error("key '{key}' holds {actual:?}, expected {expected:?}")]
    UnexpectedValue {
        key: Key,
        expected: Option<Value>,
        actual: Option<Value>,
    },

    #[error("history is not linearizable: {0}")]
    LinearizabilityViolation(#[from] Violation),

    #[error("protocol introspection failed: {0}")]
    Introspection(TransportError),

    #[error("network control failed: {0}")]
    Network(TransportError),

    #[error("recorded history is malformed: {0}")]
    InvalidHistory(#[from] HistoryError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("task failed: {0}")]
    Task(String),
}

impl HarnessError {
    /// Whether this is a client-level failure that some scenarios tolerate
    pub fn is_operation_failure(&self) -> bool {
        matches!(self, HarnessError::OperationFailure { .. })
    }
}

/// Why a client request did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("rejected by the cluster")]
    Rejected,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },

    #[error(transparent)]
    Transport(TransportError),
}
