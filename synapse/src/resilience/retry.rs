//! Bounded retry with exponential backoff and jitter, coordinated with the
//! shared [`CircuitBreaker`].
//!
//! ```text
//! with_retry(op)
//!   → breaker.check()            rejected? fail fast, no attempt made
//!   → loop:
//!       op(attempt)
//!         ├─ Ok                   → breaker.record_success(admission), return
//!         ├─ non-retriable Err    → breaker.release_probe(admission), return
//!         ├─ retriable, budget left → sleep(backoff), next attempt
//!         └─ retriable, exhausted → breaker.record_failure(admission), return
//! ```
//!
//! Cancellation is observed while an attempt is in flight and while sleeping
//! between attempts; the pending timer is dropped with the select arm.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::{CallError, ProviderError};
use crate::resilience::circuit_breaker::{Admission, CircuitBreaker};
use crate::telemetry::{SharedSink, TelemetryEvent};

/// Event recorded before each backoff sleep.
pub const RETRY_SCHEDULED_EVENT: &str = "Retry.Scheduled";

/// Retry tuning for one logical call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts ≤ `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay, jitter included.
    pub max_delay: Duration,
    /// Random extra delay is drawn from `[0, max_jitter]`.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// One scheduled retry: which attempt comes next and how long we wait first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based number of the attempt that will run after the delay.
    pub attempt_number: u32,
    pub delay_before_ms: u64,
}

/// Computes exponential backoff with additive jitter.
#[derive(Debug, Clone)]
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// Delay without jitter after the `failures`-th failed attempt (1-based):
    /// `base × 2^(failures−1)`, capped at `max_delay`.
    pub fn base_delay_for(config: &RetryConfig, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(config.max_delay)
    }

    /// Full delay: `min(base × 2^(failures−1) + U[0, max_jitter], max_delay)`.
    pub fn delay_for(config: &RetryConfig, failures: u32) -> Duration {
        let base = Self::base_delay_for(config, failures);
        let jitter_ms = config.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        base.saturating_add(jitter).min(config.max_delay)
    }
}

/// Runs operations under the retry policy, sharing one breaker.
#[derive(Clone)]
pub struct RetryExecutor {
    breaker: Arc<CircuitBreaker>,
    telemetry: SharedSink,
}

impl RetryExecutor {
    pub fn new(breaker: Arc<CircuitBreaker>, telemetry: SharedSink) -> Self {
        Self { breaker, telemetry }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Execute `op` with retries. `op` receives the 1-based attempt number.
    pub async fn with_retry<T, Op, Fut>(
        &self,
        operation: &str,
        config: &RetryConfig,
        op: Op,
    ) -> Result<T, CallError>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.with_retry_until(operation, config, &CancellationToken::new(), op)
            .await
    }

    /// Like [`with_retry`](Self::with_retry), abandoning the call as soon as
    /// `cancel` fires.
    pub async fn with_retry_until<T, Op, Fut>(
        &self,
        operation: &str,
        config: &RetryConfig,
        cancel: &CancellationToken,
        mut op: Op,
    ) -> Result<T, CallError>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let admission = match self.breaker.check() {
            Ok(admission) => admission,
            Err(source) => {
                let err = CallError::CircuitOpen {
                    operation: operation.to_string(),
                    source,
                };
                warn!(operation, error = %err, "Call rejected by circuit breaker");
                self.report_failure(&err, 0);
                return Err(err);
            }
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                out = op(attempt) => Some(out),
            };
            let Some(outcome) = outcome else {
                return Err(self.cancelled(operation, admission, attempt - 1));
            };

            let failure = match outcome {
                Ok(value) => {
                    self.breaker.record_success(admission);
                    debug!(
                        operation,
                        attempt,
                        probe = admission.is_probe(),
                        "Call succeeded"
                    );
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !failure.is_retriable() {
                // Client error: not a dependency-health signal.
                self.breaker.release_probe(admission);
                let err = CallError::NonRetriable {
                    operation: operation.to_string(),
                    source: failure,
                };
                warn!(operation, attempt, error = %err, "Non-retriable failure");
                self.report_failure(&err, attempt);
                return Err(err);
            }

            if attempt > config.max_retries {
                self.breaker.record_failure(admission);
                let err = CallError::ExhaustedRetries {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: failure,
                };
                error!(operation, attempts = attempt, error = %err, "Retries exhausted");
                self.report_failure(&err, attempt);
                return Err(err);
            }

            let delay = BackoffCalculator::delay_for(config, attempt);
            let next = RetryAttempt {
                attempt_number: attempt + 1,
                delay_before_ms: delay.as_millis() as u64,
            };
            warn!(
                operation,
                attempt,
                next_attempt = next.attempt_number,
                delay_ms = next.delay_before_ms,
                error = %failure,
                "Retrying after backoff"
            );
            self.telemetry.record_event(
                TelemetryEvent::new(RETRY_SCHEDULED_EVENT)
                    .flow(operation)
                    .attr("attempt", next.attempt_number)
                    .attr("delay_ms", next.delay_before_ms)
                    .attr("category", failure.retry_category().to_string())
                    .attr("last_error", failure.to_string()),
            );

            let slept = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            if !slept {
                return Err(self.cancelled(operation, admission, attempt));
            }
        }
    }

    fn cancelled(&self, operation: &str, admission: Admission, attempts: u32) -> CallError {
        self.breaker.release_probe(admission);
        let err = CallError::Cancelled {
            operation: operation.to_string(),
            attempts,
        };
        warn!(operation, attempts, "Call cancelled");
        self.report_failure(&err, attempts);
        err
    }

    fn report_failure(&self, err: &CallError, attempts: u32) {
        self.telemetry.record_error(
            err,
            TelemetryEvent::new(format!("{}.{}", err.operation(), err.kind()))
                .flow(err.operation())
                .attr("attempts", attempts)
                .attr("retriable", matches!(err, CallError::ExhaustedRetries { .. })),
        );
    }
}
