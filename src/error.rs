use thiserror::Error;

/// Caller-facing error classification.
///
/// Synchronous call errors are returned to the caller verbatim. Asynchronous
/// dispatch outcomes never surface here; they are recorded on the subscription
/// itself (`last_error`, `failed_payment_count`) and drive the backoff state
/// machine instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Caller input violates validation rules. No state change.
    #[error("validation: {0}")]
    Validation(String),

    /// Caller lacks the required role.
    #[error("authorization: {0}")]
    Authorization(String),

    /// The referenced subscription is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate sub_id, pending proposal already exists, wrong lifecycle
    /// state for the requested transition, and similar.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Outcall network error or timeout. Recovered via backoff when it occurs
    /// inside the scheduler; surfaced only for direct admin outcalls.
    #[error("transient: {0}")]
    Transient(String),

    /// The settlement contract refused the transaction.
    #[error("chain rejected: {0}")]
    ChainReject(String),

    /// Signer unavailable or persisted state corrupted. The service refuses
    /// all mutations until an operator intervenes.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
