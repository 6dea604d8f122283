//! Orchestrator: resolve an engine for a request, invoke it through the
//! retry executor, and degrade to an error-recovery result on failure.
//!
//! ```text
//! route(request)
//!   → resolve(mode, prompt)
//!       ├─ policy.select()                 → Primary
//!       └─ LOCAL and local engine absent   → Fallback(select(FAST))   one hop
//!   → executor.with_retry_until(provider.generate)
//!       ├─ Ok   → CallResult { degradation: Full | Partial }
//!       └─ Err  → CallResult { engine_used: "error-recovery", degradation: Unavailable }
//!   → one Orchestrator.Cognition event
//! ```

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SynapseConfig;
use crate::errors::{CallError, ProviderError};
use crate::provider::{GenerateRequest, GenerateResponse, ProviderFactory, ProviderSet};
use crate::resilience::{CircuitBreaker, DegradationLevel, RetryConfig, RetryExecutor};
use crate::router::policy::{EngineId, Mode, RouterPolicy, RoutingDecision};
use crate::telemetry::{SharedSink, TelemetryEvent};

/// Event recorded once per routed call.
pub const COGNITION_EVENT: &str = "Orchestrator.Cognition";

/// `engine_used` value on results produced by error recovery.
pub const ERROR_RECOVERY_ENGINE: &str = "error-recovery";

/// Prefix of `output_text` on error-recovery results.
pub const SYSTEM_ERROR_PREFIX: &str = "**System Error**:";

const PREVIEW_CHARS: usize = 50;

/// A mode-tagged request from the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub payload_text: String,
    pub mode: Mode,
    /// Opaque to routing; forwarded to the provider.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl CallRequest {
    pub fn new(payload_text: impl Into<String>, mode: Mode) -> Self {
        Self {
            payload_text: payload_text.into(),
            mode,
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// What the caller always gets back, success or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResult {
    pub output_text: String,
    pub engine_used: String,
    pub latency_ms: u64,
    pub degradation: DegradationLevel,
}

impl CallResult {
    pub fn is_error_recovery(&self) -> bool {
        self.engine_used == ERROR_RECOVERY_ENGINE
    }
}

/// Engine resolution outcome. Fallback is an expected path, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSelection {
    Primary(RoutingDecision),
    Fallback {
        decision: RoutingDecision,
        from: EngineId,
        reason: String,
    },
}

impl EngineSelection {
    pub fn decision(&self) -> &RoutingDecision {
        match self {
            Self::Primary(decision) | Self::Fallback { decision, .. } => decision,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    /// Degradation level if the selected engine answers.
    pub fn degradation(&self) -> DegradationLevel {
        match self {
            Self::Primary(_) => DegradationLevel::Full,
            Self::Fallback { .. } => DegradationLevel::Partial,
        }
    }
}

pub struct Orchestrator {
    policy: RouterPolicy,
    providers: ProviderSet,
    executor: RetryExecutor,
    retry: RetryConfig,
    telemetry: SharedSink,
}

impl Orchestrator {
    pub fn new(
        policy: RouterPolicy,
        providers: ProviderSet,
        executor: RetryExecutor,
        retry: RetryConfig,
        telemetry: SharedSink,
    ) -> Self {
        Self {
            policy,
            providers,
            executor,
            retry,
            telemetry,
        }
    }

    /// Wire providers, one shared breaker, and the executor from `config`.
    pub fn from_config(config: &SynapseConfig, telemetry: SharedSink) -> Result<Self> {
        let providers = ProviderFactory::from_config(config)?;
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_config(),
            telemetry.clone(),
        ));
        Ok(Self::new(
            RouterPolicy::new(config.router_config()),
            providers,
            RetryExecutor::new(breaker, telemetry.clone()),
            config.retry_config(),
            telemetry,
        ))
    }

    pub fn policy(&self) -> &RouterPolicy {
        &self.policy
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Pick the engine for `mode`. Only LOCAL can fall back, and only to FAST.
    pub async fn resolve(&self, mode: Mode, prompt: &str) -> EngineSelection {
        let decision = self.policy.select(mode, prompt);
        if decision.engine != EngineId::Local {
            return EngineSelection::Primary(decision);
        }

        let reason = match self.providers.get(EngineId::Local) {
            None => Some("no local provider registered"),
            Some(provider) => {
                (!provider.is_available().await).then_some("local engine unavailable")
            }
        };
        let Some(reason) = reason else {
            return EngineSelection::Primary(decision);
        };

        let mut fallback = self.policy.select(Mode::Fast, prompt);
        fallback.requested_mode = mode;
        fallback.rationale = format!("{reason}; falling back to fast");
        info!(
            from = %EngineId::Local,
            to = %fallback.engine,
            reason,
            "Engine fallback"
        );
        EngineSelection::Fallback {
            decision: fallback,
            from: EngineId::Local,
            reason: reason.to_string(),
        }
    }

    /// Route one request. Never fails.
    pub async fn route(&self, request: CallRequest) -> CallResult {
        self.route_until(request, &CancellationToken::new()).await
    }

    /// Like [`route`](Self::route); `cancel` abandons the call mid-attempt or
    /// mid-backoff, yielding an error-recovery result.
    pub async fn route_until(&self, request: CallRequest, cancel: &CancellationToken) -> CallResult {
        let call_id = Uuid::new_v4();
        let started = Instant::now();

        let selection = self.resolve(request.mode, &request.payload_text).await;
        let decision = selection.decision();
        debug!(
            %call_id,
            mode = %request.mode,
            engine = %decision.engine,
            model = %decision.model,
            rationale = %decision.rationale,
            "Routing decision"
        );

        let outcome = self.invoke(decision, &request, cancel).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(response) => CallResult {
                output_text: response.text,
                engine_used: decision.engine_label(),
                latency_ms,
                degradation: selection.degradation(),
            },
            Err(err) => {
                error!(%call_id, engine = %decision.engine, error = %err, "Call degraded to error recovery");
                CallResult {
                    output_text: format!("{SYSTEM_ERROR_PREFIX} {err}"),
                    engine_used: ERROR_RECOVERY_ENGINE.to_string(),
                    latency_ms,
                    degradation: DegradationLevel::Unavailable,
                }
            }
        };

        self.log_cognition(call_id, &request, &selection, &result);
        result
    }

    async fn invoke(
        &self,
        decision: &RoutingDecision,
        request: &CallRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, CallError> {
        let operation = format!("route.{}", decision.engine);

        let Some(provider) = self.providers.get(decision.engine) else {
            let err = CallError::NoProvider {
                operation: operation.clone(),
                source: ProviderError::Unavailable(format!(
                    "no provider registered for engine {}",
                    decision.engine
                )),
            };
            warn!(operation = %operation, "No provider for selected engine");
            self.telemetry.record_error(
                &err,
                TelemetryEvent::new(format!("{operation}.{}", err.kind()))
                    .flow(operation.as_str())
                    .model(decision.model.as_str()),
            );
            return Err(err);
        };

        let generate = GenerateRequest {
            model: decision.model.clone(),
            system_instruction: decision.system_instruction.clone(),
            prompt: request.payload_text.clone(),
            context: request.context.clone(),
        };

        self.executor
            .with_retry_until(&operation, &self.retry, cancel, |attempt| {
                let provider = provider.clone();
                let generate = &generate;
                async move {
                    debug!(provider = provider.id(), attempt, "Invoking provider");
                    provider.generate(generate).await
                }
            })
            .await
    }

    fn log_cognition(
        &self,
        call_id: Uuid,
        request: &CallRequest,
        selection: &EngineSelection,
        result: &CallResult,
    ) {
        let decision = selection.decision();
        let mut event = TelemetryEvent::new(COGNITION_EVENT)
            .flow("route")
            .step(decision.engine.as_str())
            .duration_ms(result.latency_ms)
            .model(decision.model.as_str())
            .attr("call_id", call_id.to_string())
            .attr("input_preview", preview(&request.payload_text))
            .attr("mode", request.mode.as_str())
            .attr("engine", result.engine_used.as_str())
            .attr("output_preview", preview(&result.output_text))
            .attr("latency_ms", result.latency_ms)
            .attr("degradation", result.degradation.to_string());
        if let EngineSelection::Fallback { from, reason, .. } = selection {
            event = event
                .attr("fallback_from", from.as_str())
                .attr("fallback_reason", reason.as_str());
        }
        if !request.context.is_empty() {
            let keys: Vec<Value> = request.context.keys().cloned().map(Value::from).collect();
            event = event.attr("context_keys", keys);
        }
        self.telemetry.record_event(event);
    }
}

/// First [`PREVIEW_CHARS`] characters, never splitting a code point.
fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}
