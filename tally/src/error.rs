use thiserror::Error;

/// Failure taxonomy for the usage accounting core.
///
/// Database errors are treated as transient: an event whose processing hit
/// one is recycled through lease expiry rather than retried in place. The
/// remaining variants are terminal for the operation that produced them.
#[derive(Debug, Error)]
pub enum UsageError {
    /// Underlying store failure. Retryable via the lease protocol.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A referenced entity (user, job, event, worker) does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// An inbound payload was missing required fields or unparseable.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Outbound publication failed. Transient; the total is already
    /// committed and the gap closes through the admin resend operation.
    #[error("publish failure: {0}")]
    Publish(String),

    /// Decimal arithmetic overflowed or lost representability.
    #[error("arithmetic failure: {0}")]
    Arithmetic(String),

    /// Persisted state contradicts a documented invariant. Logged at error,
    /// never silently corrected.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid start-up configuration. The only fatal variant.
    #[error("configuration error: {0}")]
    Config(String),
}

impl UsageError {
    /// Whether this error identifies a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, UsageError::NotFound(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = UsageError> = std::result::Result<T, E>;
