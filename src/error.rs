//! Crate-wide error taxonomy.
//!
//! Keeps small, focused error enums per operation (`ChangeConfigError`,
//! `ClientWriteError`, ...) that all convert into the single
//! `RuntimeError` surfaced to callers, rather than one flat catch-all.

use thiserror::Error;

use crate::NodeId;

/// The error kinds a caller can match on.
///
/// Every error carries enough information for a caller to decide whether to
/// retry (`retriable()`) and to correlate it with an originating request.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("optimistic concurrency conflict: expected version {expected}, actual {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("authorization denied: {0}")]
    AuthorizationError(String),

    #[error("no handler registered for type {0:?}")]
    HandlerNotFound(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("data corruption detected: {0}")]
    Corruption(String),

    #[error("storage is unusable: {0}")]
    StorageFatal(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("current leader is unknown")]
    LeaderUnknown,

    #[error("this node is not the leader{}", .0.as_ref().map(|l| format!(", leader is {l}")).unwrap_or_default())]
    NotLeader(Option<NodeId>),

    #[error("backpressure: too many in-flight operations")]
    Backpressure,

    #[error("quorum lost")]
    QuorumLost,

    #[error("the runtime is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Whether a caller may reasonably retry the operation that produced this error.
    pub fn retriable(&self) -> bool {
        !matches!(
            self,
            RuntimeError::ValidationError(_)
                | RuntimeError::AuthorizationError(_)
                | RuntimeError::HandlerNotFound(_)
                | RuntimeError::Corruption(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::ConcurrencyConflict { .. } => "ConcurrencyConflict",
            RuntimeError::ValidationError(_) => "ValidationError",
            RuntimeError::AuthorizationError(_) => "AuthorizationError",
            RuntimeError::HandlerNotFound(_) => "HandlerNotFound",
            RuntimeError::Timeout => "Timeout",
            RuntimeError::Cancelled => "Cancelled",
            RuntimeError::Corruption(_) => "Corruption",
            RuntimeError::StorageFatal(_) => "StorageFatal",
            RuntimeError::TransportUnavailable(_) => "TransportUnavailable",
            RuntimeError::LeaderUnknown => "LeaderUnknown",
            RuntimeError::NotLeader(_) => "NotLeader",
            RuntimeError::Backpressure => "Backpressure",
            RuntimeError::QuorumLost => "QuorumLost",
            RuntimeError::ShuttingDown => "ShuttingDown",
            RuntimeError::Internal(_) => "Internal",
        }
    }
}

/// An envelope carrying `{kind, message, retriable, correlation_id}` as required by .
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
    pub retriable: bool,
    pub correlation_id: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(err: &RuntimeError, correlation_id: Option<String>) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retriable: err.retriable(),
            correlation_id,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors specific to a `change_membership` request on the Raft facade.
#[derive(Error, Debug, Clone)]
pub enum ChangeConfigError {
    #[error("a configuration change is already in progress")]
    ChangeInProgress,
    #[error("the requested change is a no-op")]
    Noop,
    #[error("the resulting configuration would be inoperable (empty)")]
    InoperableConfig,
    #[error(transparent)]
    RuntimeError(#[from] RuntimeError),
}

/// Errors specific to `Raft::client_write`.
#[derive(Error, Debug, Clone)]
pub enum ClientWriteError {
    #[error(transparent)]
    ChangeConfigError(#[from] ChangeConfigError),
    #[error(transparent)]
    RuntimeError(#[from] RuntimeError),
}

/// Errors specific to `Raft::client_read` (linearizable reads).
#[derive(Error, Debug, Clone)]
pub enum ClientReadError {
    #[error(transparent)]
    RuntimeError(#[from] RuntimeError),
    #[error("could not confirm leadership against a quorum of peers")]
    QuorumNotReached,
}

/// Errors specific to `Raft::init_with_config`.
#[derive(Error, Debug, Clone)]
pub enum InitializeError {
    #[error("node is not in a pristine state and cannot be initialized")]
    NotAllowed,
    #[error(transparent)]
    RuntimeError(#[from] RuntimeError),
}
