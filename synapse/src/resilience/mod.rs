//! Failure gating, retry, and degraded-mode reporting.
//!
//! # Design
//!
//! ```text
//! engine call
//!   ├─ primary engine succeeds     → DegradationLevel::Full
//!   ├─ served after a fallback hop → DegradationLevel::Partial
//!   └─ unrecovered failure         → DegradationLevel::Unavailable (error-recovery result)
//! ```
//!
//! [`CircuitBreaker`] gates calls to a failing dependency, and
//! [`RetryExecutor`] drives the bounded retry loop against it.

pub mod circuit_breaker;
pub mod retry;

use serde::{Deserialize, Serialize};

pub use circuit_breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, STATE_CHANGE_EVENT,
};
pub use retry::{
    BackoffCalculator, RetryAttempt, RetryConfig, RetryExecutor, RETRY_SCHEDULED_EVENT,
};

/// How much of the requested capability served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// The engine the request asked for answered.
    Full,
    /// A fallback engine answered after the preferred one was unavailable.
    Partial,
    /// Nothing answered; the result is an error-recovery placeholder.
    Unavailable,
}

impl DegradationLevel {
    pub fn is_degraded(self) -> bool {
        self != Self::Full
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}
