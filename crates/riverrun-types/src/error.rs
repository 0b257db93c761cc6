use thiserror::Error;
use uuid::Uuid;

/// Fatal violations of the engine's consistency invariants. Never retried.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("execution {child} references parent {parent} which is not persisted")]
    DanglingParent { child: Uuid, parent: Uuid },

    #[error("removed execution {0} still has live children at delete time")]
    RemovedNodeHasLiveChildren(Uuid),

    #[error("join at '{node}' saw {arrived} arrivals but expects {expected}")]
    JoinArity {
        node: String,
        expected: usize,
        arrived: u64,
    },

    #[error("execution {0} cannot join at '{1}' outside of a forked branch")]
    JoinOutsideFork(Uuid, String),

    #[error("unrecognized variable blob marker: {0}")]
    UnknownBlobMarker(u8),

    #[error("malformed variable blob: {0}")]
    MalformedBlob(String),

    #[error("unknown node '{0}' in process definition")]
    UnknownNode(String),

    #[error("unknown transition '{0}' in process definition")]
    UnknownTransition(String),

    #[error("execution {0} has no current node")]
    NoCurrentNode(Uuid),

    #[error("execution {0} is not waiting and cannot be signaled")]
    NotWaiting(Uuid),

    #[error("node '{0}' has {1} outgoing transitions where exactly one is required")]
    AmbiguousContinuation(String, usize),
}

/// Errors surfaced by the storage backend. Propagated unchanged; the owning
/// unit of work rolls back, the caller decides whether to retry.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("row not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// A required collaborator or precondition is absent. Raised immediately at
/// the point of use, never silently defaulted.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("process engine cannot delegate tasks without a delegate task factory")]
    MissingDelegateTaskFactory,

    #[error("process definition {0} is not deployed")]
    DefinitionNotDeployed(Uuid),

    #[error("command executed outside of an active unit of work")]
    CommandOutsideUnitOfWork,
}

/// Umbrella error for every engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),
}
