//! Error types shared across abstain.
//!
//! `ConfigError` is the only error that aborts a run, and it is raised before
//! any trial executes. `ClientError` is defined here rather than in
//! `abstain-providers` so the session controller can classify failures for
//! retry decisions without string matching.

use thiserror::Error;

/// An experiment configuration that must be rejected before any trial runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// One of the payoff values is NaN or infinite.
    #[error("payoff values must be finite (correct={correct}, incorrect={incorrect}, blank={blank})")]
    NonFinitePayoff {
        correct: f64,
        incorrect: f64,
        blank: f64,
    },

    /// The ordering `incorrect <= blank < correct` does not hold.
    #[error(
        "payoffs must satisfy incorrect <= blank < correct (correct={correct}, incorrect={incorrect}, blank={blank})"
    )]
    PayoffOrdering {
        correct: f64,
        incorrect: f64,
        blank: f64,
    },

    /// Numeric tolerance is negative or not finite.
    #[error("numeric tolerance must be a finite, non-negative number, got {0}")]
    InvalidTolerance(f64),

    /// The fake-statistics prompt variant was requested without numbers to show.
    #[error("variant 'fake_statistics' requires a [fake_statistics] block")]
    MissingFakeStatistics,

    /// A session needs at least one question.
    #[error("session has no questions")]
    NoQuestions,

    /// A resumed session record does not match the session it is resumed into.
    #[error("cannot resume session: {0}")]
    InconsistentRecord(String),
}

/// Errors that can occur when sending a prompt to a model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// The API returned a 429 rate limit response.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Authentication failed (invalid API key).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The requested model was not found.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The API returned an error response.
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A network error occurred.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The API answered but carried no text.
    #[error("model returned an empty response")]
    EmptyResponse,
}

impl ClientError {
    /// Returns `true` if this error is permanent and should not be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ClientError::AuthenticationFailed(_) | ClientError::ModelNotFound(_)
        )
    }

    /// Returns the retry-after delay in milliseconds, if applicable.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ClientError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors() {
        assert!(ClientError::AuthenticationFailed("bad key".into()).is_permanent());
        assert!(ClientError::ModelNotFound("nope".into()).is_permanent());
        assert!(!ClientError::Timeout(30).is_permanent());
        assert!(!ClientError::EmptyResponse.is_permanent());
    }

    #[test]
    fn retry_after_hint() {
        let err = ClientError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.retry_after_ms(), Some(5000));
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
        assert_eq!(ClientError::NetworkError("x".into()).retry_after_ms(), None);
    }
}
