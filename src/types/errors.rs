//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Variants correspond to the failure
//! categories a scheduling tick or lifecycle operation can produce; `severity`
//! tells callers whether a failure should abort the current tick or just be
//! recorded against the affected session and skipped.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the scheduler core.
#[derive(Error, Debug)]
pub enum Error {
    /// A predicate rejected a session during admission (map to gRPC FAILED_PRECONDITION).
    #[error("admission rejected: {0}")]
    Admission(String),

    /// No agent has enough free capacity for the requested slots.
    #[error("insufficient resources: {0}")]
    Capacity(String),

    /// Resource not found (map to gRPC NOT_FOUND).
    #[error("not found: {0}")]
    NotFound(String),

    /// Quota or concurrency-limit exhaustion (map to gRPC RESOURCE_EXHAUSTED).
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Invalid state transition (map to gRPC FAILED_PRECONDITION).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Agent is unreachable, lost its lease, or its RPC call failed.
    #[error("agent error: {0}")]
    Agent(String),

    /// Registry state disagrees with what the tick observed (stale version, orphaned row).
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Failed to acquire or lost a distributed lock.
    #[error("lock error: {0}")]
    Lock(String),

    /// The Postgres/Redis persistence boundary failed.
    #[error("storage backend error: {0}")]
    StorageBackend(String),

    /// Validation errors (map to gRPC INVALID_ARGUMENT).
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors (map to gRPC INTERNAL).
    #[error("internal error: {0}")]
    Internal(String),

    /// Cancellation (map to gRPC CANCELLED).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Timeout (map to gRPC DEADLINE_EXCEEDED).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// gRPC transport errors (boxed to reduce Result size).
    #[error("grpc error: {0}")]
    Grpc(#[from] Box<tonic::Status>),

    /// sqlx errors from the Registry's Postgres backend.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis errors from the fast concurrency counter / KV store.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classifies how a scheduler tick should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Record against the affected session and continue the tick.
    Soft,
    /// Abort the remainder of the tick; the scaling-group lock is released.
    Hard,
}

impl Error {
    /// Convert to gRPC status code.
    pub fn to_grpc_status(&self) -> tonic::Status {
        match self {
            Error::Admission(msg) => tonic::Status::failed_precondition(msg),
            Error::Capacity(msg) => tonic::Status::resource_exhausted(msg),
            Error::NotFound(msg) => tonic::Status::not_found(msg),
            Error::QuotaExceeded(msg) => tonic::Status::resource_exhausted(msg),
            Error::StateTransition(msg) => tonic::Status::failed_precondition(msg),
            Error::Agent(msg) => tonic::Status::unavailable(msg),
            Error::Consistency(msg) => tonic::Status::aborted(msg),
            Error::Lock(msg) => tonic::Status::aborted(msg),
            Error::StorageBackend(msg) => tonic::Status::unavailable(msg),
            Error::Validation(msg) => tonic::Status::invalid_argument(msg),
            Error::Cancelled(msg) => tonic::Status::cancelled(msg),
            Error::Timeout(msg) => tonic::Status::deadline_exceeded(msg),
            Error::Internal(msg) => tonic::Status::internal(msg),
            Error::Serialization(e) => tonic::Status::internal(format!("serialization error: {e}")),
            Error::Grpc(status) => (**status).clone(),
            Error::Database(e) => tonic::Status::unavailable(format!("database error: {e}")),
            Error::Redis(e) => tonic::Status::unavailable(format!("redis error: {e}")),
            Error::Io(e) => tonic::Status::internal(format!("io error: {e}")),
        }
    }

    /// Whether a scheduler tick should record-and-continue (`Soft`) or abort (`Hard`).
    ///
    /// Per-session admission/capacity/agent failures only affect the session
    /// that triggered them; lock, storage-backend and consistency failures
    /// mean the tick's view of the world may be stale and it must stop.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Admission(_)
            | Error::Capacity(_)
            | Error::Agent(_)
            | Error::QuotaExceeded(_)
            | Error::StateTransition(_)
            | Error::Validation(_)
            | Error::Timeout(_)
            | Error::Cancelled(_)
            | Error::NotFound(_) => Severity::Soft,
            Error::Consistency(_)
            | Error::Lock(_)
            | Error::StorageBackend(_)
            | Error::Database(_)
            | Error::Redis(_)
            | Error::Internal(_)
            | Error::Serialization(_)
            | Error::Grpc(_)
            | Error::Io(_) => Severity::Hard,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn admission(msg: impl Into<String>) -> Self {
        Self::Admission(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    pub fn storage_backend(msg: impl Into<String>) -> Self {
        Self::StorageBackend(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}

// Implement From<Error> for Status to enable the `?` operator in gRPC handlers.
impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        err.to_grpc_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_soft() {
        assert_eq!(Error::capacity("no room").severity(), Severity::Soft);
    }

    #[test]
    fn lock_errors_are_hard() {
        assert_eq!(Error::lock("advisory lock busy").severity(), Severity::Hard);
    }
}
