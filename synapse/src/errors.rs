//! Failure taxonomy for outbound engine calls, with retry classification.
//!
//! Providers return [`ProviderError`]. The retry executor turns those into a
//! terminal [`CallError`]. Callers query `is_retriable()` /
//! `retry_category()` instead of matching on messages.
//!
//! ## Retry categories
//!
//! | Category         | Retriable | Counts toward breaker |
//! |------------------|-----------|-----------------------|
//! | Transient        | yes       | yes (when exhausted)  |
//! | RateLimit        | yes       | yes (when exhausted)  |
//! | InvalidRequest   | no        | no                    |
//! | Unauthorized     | no        | no                    |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitState;

/// Classification used by the retry executor to decide whether to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Timeout, overload, transport hiccup, engine briefly unavailable.
    Transient,
    /// Provider throttled the caller; retry with back-off.
    RateLimit,
    /// Malformed or rejected request. Retrying sends the same bad request.
    InvalidRequest,
    /// Credential missing, invalid, or lacking permission.
    Unauthorized,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

/// Failure reported by a single provider `generate` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    // ── Retriable ─────────────────────────────────────────────────────────
    /// The request did not complete in time.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The provider is overloaded or returned a server error.
    #[error("Provider overloaded: {0}")]
    Overloaded(String),

    /// The provider throttled this caller.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Connection-level failure before a response arrived.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The engine is not reachable or not registered.
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    // ── Non-retriable ─────────────────────────────────────────────────────
    /// API key missing or rejected.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// The provider rejected the request as malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Credential is valid but not allowed to use this model.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The provider answered, but the payload could not be understood.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Classify this error for retry logic.
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Timeout(_) | Self::Overloaded(_) | Self::Transport(_) | Self::Unavailable(_) => {
                RetryCategory::Transient
            }
            Self::RateLimited(_) => RetryCategory::RateLimit,
            Self::BadRequest(_) | Self::Malformed(_) => RetryCategory::InvalidRequest,
            Self::InvalidCredential(_) | Self::PermissionDenied(_) => RetryCategory::Unauthorized,
        }
    }

    /// Returns `true` if the executor may retry after this error.
    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }

    /// Map an HTTP status and response body onto the taxonomy.
    ///
    /// Bodies that complain about the API key are treated as credential
    /// failures whatever the status says.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if body.contains("API key") || body.contains("api key") {
            return Self::InvalidCredential(body);
        }
        match status {
            400 | 404 | 413 | 422 => Self::BadRequest(body),
            401 => Self::InvalidCredential(body),
            403 => Self::PermissionDenied(body),
            408 | 504 => Self::Timeout(body),
            429 => Self::RateLimited(body),
            500..=599 => Self::Overloaded(body),
            _ => Self::BadRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Returned by [`CircuitBreaker::check`](crate::resilience::CircuitBreaker::check)
/// when calls are being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker is {state}; service degraded, retry in {}ms", retry_after.as_millis())]
pub struct CircuitOpenError {
    /// State at the time of rejection (Open, or HalfOpen with a probe in flight).
    pub state: CircuitState,
    /// Time left until the breaker will admit a probe.
    pub retry_after: Duration,
}

/// Terminal outcome of a call driven by the retry executor.
#[derive(Debug, Error)]
pub enum CallError {
    /// The breaker rejected the call before any attempt was made.
    #[error("{operation}: {source}")]
    CircuitOpen {
        operation: String,
        #[source]
        source: CircuitOpenError,
    },

    /// A client-side error; surfaced after a single attempt.
    #[error("{operation} rejected: {source}")]
    NonRetriable {
        operation: String,
        #[source]
        source: ProviderError,
    },

    /// Every allowed attempt failed with a retriable error.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    ExhaustedRetries {
        operation: String,
        attempts: u32,
        #[source]
        last: ProviderError,
    },

    /// The caller abandoned the call.
    #[error("{operation} cancelled after {attempts} attempts")]
    Cancelled { operation: String, attempts: u32 },

    /// No provider is registered for the selected engine; no attempt made.
    #[error("{operation}: {source}")]
    NoProvider {
        operation: String,
        #[source]
        source: ProviderError,
    },
}

impl CallError {
    /// Name of the operation that failed.
    pub fn operation(&self) -> &str {
        match self {
            Self::CircuitOpen { operation, .. }
            | Self::NonRetriable { operation, .. }
            | Self::ExhaustedRetries { operation, .. }
            | Self::Cancelled { operation, .. }
            | Self::NoProvider { operation, .. } => operation,
        }
    }

    /// Short machine-readable kind, used as the telemetry event suffix.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::NonRetriable { .. } => "NonRetriable",
            Self::ExhaustedRetries { .. } => "FinalFailure",
            Self::Cancelled { .. } => "Cancelled",
            Self::NoProvider { .. } => "Unavailable",
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retriable() {
        for err in [
            ProviderError::Timeout("t".into()),
            ProviderError::Overloaded("o".into()),
            ProviderError::Transport("x".into()),
            ProviderError::Unavailable("u".into()),
        ] {
            assert!(err.is_retriable(), "{err} should be retriable");
            assert_eq!(err.retry_category(), RetryCategory::Transient);
        }
        assert_eq!(
            ProviderError::RateLimited("slow down".into()).retry_category(),
            RetryCategory::RateLimit
        );
    }

    #[test]
    fn test_client_errors_are_terminal() {
        assert!(!ProviderError::BadRequest("b".into()).is_retriable());
        assert!(!ProviderError::InvalidCredential("k".into()).is_retriable());
        assert!(!ProviderError::PermissionDenied("p".into()).is_retriable());
        assert!(!ProviderError::Malformed("m".into()).is_retriable());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ProviderError::from_status(400, "bad"),
            ProviderError::BadRequest(_)
        ));
        assert!(matches!(
            ProviderError::from_status(401, "nope"),
            ProviderError::InvalidCredential(_)
        ));
        assert!(matches!(
            ProviderError::from_status(403, "nope"),
            ProviderError::PermissionDenied(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, "later"),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            ProviderError::from_status(503, "busy"),
            ProviderError::Overloaded(_)
        ));
        assert!(matches!(
            ProviderError::from_status(504, "slow"),
            ProviderError::Timeout(_)
        ));
    }

    #[test]
    fn test_api_key_body_is_credential_failure() {
        let err = ProviderError::from_status(500, "API key not valid. Please pass a valid API key.");
        assert!(matches!(err, ProviderError::InvalidCredential(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_call_error_kind_and_operation() {
        let err = CallError::ExhaustedRetries {
            operation: "generate".into(),
            attempts: 4,
            last: ProviderError::Timeout("deadline".into()),
        };
        assert_eq!(err.kind(), "FinalFailure");
        assert_eq!(err.operation(), "generate");
        assert!(err.to_string().contains("4 attempts"));
        assert!(!err.is_circuit_open());

        let err = CallError::NoProvider {
            operation: "route.deep".into(),
            source: ProviderError::Unavailable("no provider registered".into()),
        };
        assert_eq!(err.kind(), "Unavailable");
        assert_eq!(err.operation(), "route.deep");
    }
}
