//! Synapse: resilient call orchestration for generative-AI engines
//!
//! This library provides:
//! - A consecutive-failure circuit breaker shared by every outbound call
//! - A bounded retry executor with exponential backoff and jitter
//! - A mode-based router (AUTO / FAST / DEEP / LOCAL) with single-hop fallback
//! - Structured telemetry sinks for breaker transitions, retries, and calls
//!
//! # Usage
//!
//! ```no_run
//! use synapse::{CallRequest, MemorySink, Mode, Orchestrator, SynapseConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = SynapseConfig::load(None)?;
//! let orchestrator = Orchestrator::from_config(&config, MemorySink::shared())?;
//! let result = orchestrator
//!     .route(CallRequest::new("Architect a rate limiter", Mode::Auto))
//!     .await;
//! println!("{} → {}", result.engine_used, result.output_text);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod jobs;
pub mod provider;
pub mod resilience;
pub mod router;
pub mod telemetry;

pub use config::{ConfigError, EndpointConfig, SynapseConfig};
pub use errors::{CallError, CircuitOpenError, ProviderError, RetryCategory};
pub use jobs::{poll_until_done, JobError, JobPollConfig, JobStatus};
pub use provider::{
    GenerateRequest, GenerateResponse, Provider, ProviderFactory, ProviderKind, ProviderSet,
};
pub use resilience::{
    Admission, BackoffCalculator, CircuitBreaker, CircuitBreakerConfig, CircuitState, DegradationLevel,
    RetryConfig, RetryExecutor,
};
pub use router::{
    CallRequest, CallResult, EngineId, EngineSelection, Mode, Orchestrator, RouterConfig,
    RouterPolicy, RoutingDecision,
};
pub use telemetry::{
    FanoutSink, JsonlSink, MemorySink, SharedSink, TelemetryEvent, TelemetrySink, TracingSink,
};
