use std::time::Duration;

/// Error type for this crate.
///
/// Validation variants are only produced while building rules and options. The
/// remaining variants describe a distributed evaluation that could not be
/// completed; see [`TokengateError::is_unavailable`].
#[derive(Debug, thiserror::Error)]
pub enum TokengateError {
    /// Malformed rule (negative or non-finite refill rate, zero window).
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// Malformed circuit breaker configuration.
    #[error("invalid circuit breaker config: {0}")]
    InvalidCircuitBreakerConfig(String),

    /// Malformed Redis key prefix.
    #[error("invalid key prefix: {0}")]
    InvalidKeyPrefix(String),

    /// Invalid connection count for the Redis connection pool.
    #[error("invalid connection count: {0}")]
    InvalidConnectionCount(String),

    /// Redis error.
    #[cfg(feature = "redis-tokio")]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// The backend did not answer within the configured timeout.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered with something that is not a valid evaluation.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The circuit breaker short-circuited the call without reaching the backend.
    #[error("circuit open, next probe in {retry_in:?}")]
    CircuitOpen {
        /// Time left before the breaker lets a trial call through.
        retry_in: Duration,
    },
}

impl TokengateError {
    /// Whether this error means the evaluation itself failed, as opposed to a
    /// configuration mistake.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::InvalidRule(_)
            | Self::InvalidCircuitBreakerConfig(_)
            | Self::InvalidKeyPrefix(_)
            | Self::InvalidConnectionCount(_) => false,
            #[cfg(feature = "redis-tokio")]
            Self::RedisError(_) => true,
            Self::Timeout(_) | Self::BackendUnavailable(_) | Self::CircuitOpen { .. } => true,
        }
    }
}
