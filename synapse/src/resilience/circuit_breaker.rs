//! Circuit breaker guarding the outbound engine dependency.
//!
//! The breaker counts consecutive call failures. When the count reaches the
//! configured threshold the circuit *opens* and calls fail fast. Once the
//! reset timeout has elapsed since the last failure, the next `check()`
//! moves the circuit to *half-open* and lets exactly one probe through.
//!
//! ```text
//! Closed ──(failures ≥ threshold)──▶ Open ──(reset timeout elapsed, check)──▶ HalfOpen
//!   ▲                                  ▲                                          │
//!   └──────────(probe succeeds)────────┼──────────────────────────────────────────┤
//!                                      └──────────(probe fails)───────────────────┘
//! ```
//!
//! One instance is shared (`Arc<CircuitBreaker>`) by every call path that
//! talks to the same dependency. All counters live behind a single mutex so
//! the invariants hold under a multi-threaded runtime.
//!
//! `check()` hands out an [`Admission`] that the caller passes back when it
//! records the outcome. Only the current probe's admission can settle the
//! half-open state; late results from calls admitted while Closed cannot.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::CircuitOpenError;
use crate::telemetry::{SharedSink, TelemetryEvent};

/// Event name used for every state transition.
pub const STATE_CHANGE_EVENT: &str = "CircuitBreaker.StateChange";

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy; calls allowed.
    Closed,
    /// Tripped; calls rejected until the reset timeout expires.
    Open,
    /// Reset timeout expired; one probe call allowed.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before Open → HalfOpen.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of the breaker, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Milliseconds since the last recorded failure, if any.
    pub ms_since_last_failure: Option<u64>,
    pub probe_in_flight: bool,
}

/// What [`CircuitBreaker::check`] granted. Pass it back when recording the
/// outcome of the call.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted while Closed.
    Normal,
    /// Holder of the half-open probe slot.
    Probe { ticket: u64 },
}

impl Admission {
    pub fn is_probe(&self) -> bool {
        matches!(self, Self::Probe { .. })
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Ticket of the probe currently in flight.
    probe: Option<u64>,
    next_ticket: u64,
}

impl BreakerState {
    fn grant_probe(&mut self) -> Admission {
        self.next_ticket += 1;
        self.probe = Some(self.next_ticket);
        Admission::Probe {
            ticket: self.next_ticket,
        }
    }

    fn holds_probe(&self, admission: Admission) -> bool {
        match admission {
            Admission::Probe { ticket } => {
                self.state == CircuitState::HalfOpen && self.probe == Some(ticket)
            }
            Admission::Normal => false,
        }
    }
}

/// A state change to report once the lock is released.
struct Transition {
    from: CircuitState,
    to: CircuitState,
    reason: String,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
    telemetry: SharedSink,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker in the Closed state.
    pub fn new(config: CircuitBreakerConfig, telemetry: SharedSink) -> Self {
        Self {
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe: None,
                next_ticket: 0,
            }),
            config,
            telemetry,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    // Counters are plain data; a panic elsewhere cannot leave them torn.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gate a call.
    ///
    /// Fails fast while Open and the reset timeout has not elapsed, and while
    /// a half-open probe is already in flight. Otherwise admits the call; if
    /// the circuit was Open and the timeout has elapsed, transitions to
    /// HalfOpen and hands the probe slot to this caller.
    pub fn check(&self) -> Result<Admission, CircuitOpenError> {
        let (admission, transition) = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => (Admission::Normal, None),
                CircuitState::HalfOpen => {
                    if inner.probe.is_some() {
                        return Err(CircuitOpenError {
                            state: CircuitState::HalfOpen,
                            retry_after: Duration::ZERO,
                        });
                    }
                    (inner.grant_probe(), None)
                }
                CircuitState::Open => {
                    let elapsed = inner
                        .last_failure
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed <= self.config.reset_timeout {
                        return Err(CircuitOpenError {
                            state: CircuitState::Open,
                            retry_after: self.config.reset_timeout - elapsed,
                        });
                    }
                    inner.state = CircuitState::HalfOpen;
                    let probe = inner.grant_probe();
                    (
                        probe,
                        Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            reason: "Reset timeout elapsed; probing service".to_string(),
                        }),
                    )
                }
            }
        };

        if let Some(t) = transition {
            self.emit(t);
        }
        Ok(admission)
    }

    /// Record a successful call.
    ///
    /// Resets the failure count while Closed. The probe's success closes a
    /// half-open circuit; any other success arriving outside Closed is a
    /// late result and changes nothing.
    pub fn record_success(&self, admission: Admission) {
        let transition = {
            let mut inner = self.lock();
            if inner.holds_probe(admission) {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.probe = None;
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                    reason: "Probe call succeeded".to_string(),
                })
            } else {
                match inner.state {
                    CircuitState::Closed => inner.failure_count = 0,
                    CircuitState::Open => warn!("Success recorded while circuit is open"),
                    CircuitState::HalfOpen => {
                        debug!("Ignoring late success while a probe is pending")
                    }
                }
                None
            }
        };

        if let Some(t) = transition {
            self.emit(t);
        }
    }

    /// Record a failed call.
    ///
    /// While Closed, bumps the count and opens at the threshold. The probe's
    /// failure reopens a half-open circuit with a fresh timestamp. A late
    /// failure while Open pushes the cooldown out; one while HalfOpen is
    /// ignored so the pending probe alone decides.
    pub fn record_failure(&self, admission: Admission) {
        let transition = {
            let mut inner = self.lock();
            if inner.holds_probe(admission) {
                inner.state = CircuitState::Open;
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.last_failure = Some(Instant::now());
                inner.probe = None;
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                    reason: "Probe call failed".to_string(),
                })
            } else if inner.state == CircuitState::HalfOpen {
                debug!("Ignoring late failure while a probe is pending");
                None
            } else {
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.last_failure = Some(Instant::now());
                if inner.state == CircuitState::Closed
                    && inner.failure_count >= self.config.failure_threshold
                {
                    inner.state = CircuitState::Open;
                    Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                        reason: format!(
                            "Failure threshold ({}) reached",
                            self.config.failure_threshold
                        ),
                    })
                } else {
                    None
                }
            }
        };

        if let Some(t) = transition {
            self.emit(t);
        }
    }

    /// Give back the half-open probe slot without a verdict.
    ///
    /// Used when the probe ended in a client error or was cancelled: neither
    /// says anything about dependency health. No-op unless `admission` is
    /// the probe currently holding the slot.
    pub fn release_probe(&self, admission: Admission) {
        let mut inner = self.lock();
        if inner.holds_probe(admission) {
            inner.probe = None;
        }
    }

    /// Force the circuit Closed and clear all counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.last_failure = None;
            inner.probe = None;
            (from != CircuitState::Closed).then(|| Transition {
                from,
                to: CircuitState::Closed,
                reason: "Manual reset".to_string(),
            })
        };

        if let Some(t) = transition {
            self.emit(t);
        }
    }

    /// Current state. Never transitions.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures since the last success or reset.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
            ms_since_last_failure: inner.last_failure.map(|t| t.elapsed().as_millis() as u64),
            probe_in_flight: inner.probe.is_some(),
        }
    }

    fn emit(&self, t: Transition) {
        match t.to {
            CircuitState::Open => warn!(
                from = %t.from,
                to = %t.to,
                reason = %t.reason,
                "Circuit breaker state transition"
            ),
            _ => info!(
                from = %t.from,
                to = %t.to,
                reason = %t.reason,
                "Circuit breaker state transition"
            ),
        }
        self.telemetry.record_event(
            TelemetryEvent::new(STATE_CHANGE_EVENT)
                .attr("previous_state", t.from.as_str())
                .attr("new_state", t.to.as_str())
                .attr("reason", t.reason),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::telemetry::MemorySink;

    fn breaker(threshold: u32, reset_secs: u64) -> (CircuitBreaker, Arc<MemorySink>) {
        let sink = MemorySink::shared();
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(reset_secs),
            },
            sink.clone(),
        );
        (cb, sink)
    }

    #[test]
    fn test_circuit_starts_closed() {
        let (cb, sink) = breaker(3, 30);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let (cb, sink) = breaker(2, 9999);
        cb.record_failure(Admission::Normal);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(Admission::Normal);
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.check().unwrap_err();
        assert_eq!(err.state, CircuitState::Open);
        assert!(err.retry_after > Duration::from_secs(9000));

        let events = sink.named(STATE_CHANGE_EVENT);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("previous_state").unwrap(), "CLOSED");
        assert_eq!(events[0].get("new_state").unwrap(), "OPEN");
        assert!(events[0]
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap()
            .contains("threshold"));
    }

    #[test]
    fn test_success_resets_count_while_closed() {
        let (cb, _) = breaker(3, 30);
        cb.record_failure(Admission::Normal);
        cb.record_failure(Admission::Normal);
        cb.record_success(Admission::Normal);
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure(Admission::Normal);
        cb.record_failure(Admission::Normal);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_open_until_timeout() {
        let (cb, _) = breaker(1, 30);
        cb.record_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.check().is_err());
        // Reading state never transitions.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let (cb, _) = breaker(1, 30);
        cb.record_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(cb.check().unwrap().is_probe());
        let second = cb.check().unwrap_err();
        assert_eq!(second.state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let (cb, sink) = breaker(2, 30);
        cb.record_failure(Admission::Normal);
        cb.record_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(31)).await;
        let probe = cb.check().unwrap();

        cb.record_success(probe);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);

        let transitions: Vec<(String, String)> = sink
            .named(STATE_CHANGE_EVENT)
            .iter()
            .map(|e| {
                (
                    e.get("previous_state").unwrap().as_str().unwrap().to_string(),
                    e.get("new_state").unwrap().as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                ("CLOSED".to_string(), "OPEN".to_string()),
                ("OPEN".to_string(), "HALF_OPEN".to_string()),
                ("HALF_OPEN".to_string(), "CLOSED".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_timestamp() {
        let (cb, _) = breaker(1, 30);
        cb.record_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(31)).await;
        let probe = cb.check().unwrap();

        cb.record_failure(probe);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().ms_since_last_failure, Some(0));

        // The cooldown restarts from the probe failure.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_can_be_retaken() {
        let (cb, _) = breaker(1, 30);
        cb.record_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(31)).await;
        let probe = cb.check().unwrap();
        cb.release_probe(probe);

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_normal_results_leave_probe_in_charge() {
        let (cb, sink) = breaker(1, 30);
        let early = cb.check().unwrap();
        assert_eq!(early, Admission::Normal);
        cb.record_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(31)).await;
        let probe = cb.check().unwrap();

        // The call admitted while Closed finishes while the probe is out.
        cb.release_probe(early);
        assert!(cb.check().is_err(), "slot still held by the probe");
        cb.record_success(early);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure(early);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.snapshot().probe_in_flight);

        cb.record_success(probe);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(sink.named(STATE_CHANGE_EVENT).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_probe_ticket_is_ignored() {
        let (cb, _) = breaker(1, 30);
        cb.record_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(31)).await;
        let old_probe = cb.check().unwrap();

        cb.reset();
        cb.record_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(31)).await;
        let new_probe = cb.check().unwrap();
        assert_ne!(old_probe, new_probe);

        cb.release_probe(old_probe);
        assert!(cb.check().is_err());
        cb.record_success(old_probe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(new_probe);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_manual_reset() {
        let (cb, sink) = breaker(1, 9999);
        cb.record_failure(Admission::Normal);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
        assert_eq!(sink.named(STATE_CHANGE_EVENT).len(), 2);

        // Resetting a closed breaker is silent.
        cb.reset();
        assert_eq!(sink.named(STATE_CHANGE_EVENT).len(), 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let (cb, _) = breaker(3, 30);
        cb.record_failure(Admission::Normal);
        let snap = cb.snapshot();
        assert_eq!(snap.failure_count, 1);
        assert_eq!(snap.reset_timeout_ms, 30_000);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "closed");
    }
}
