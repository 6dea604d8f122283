//! Engine providers: the single `generate` capability behind every engine.
//!
//! The orchestrator treats a provider as opaque: it only cares about
//! success, failure class, and latency. Concrete providers are built by
//! [`ProviderFactory`] from a [`ProviderKind`], and [`ProviderSet`] maps each
//! routable [`EngineId`] to the provider serving it.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{EndpointConfig, SynapseConfig};
use crate::errors::ProviderError;
use crate::router::policy::EngineId;

pub use http::{check_endpoint, ChatCompletionsProvider};

/// What the orchestrator asks an engine to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub system_instruction: String,
    pub prompt: String,
    /// Caller context, passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

/// Token accounting, when the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl GenerateResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// A backend capable of answering generate requests.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier for logs (e.g. `"cloud"`, `"local"`).
    fn id(&self) -> &str;

    /// Capability probe. Must be cheap and must not fail; `false` means
    /// "do not route here right now".
    async fn is_available(&self) -> bool;

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ProviderError>;
}

/// Family of provider, which decides auth and availability probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// On-device / offline server; available when its endpoint answers.
    Local,
    /// The hosted AI provider; available when an API key is configured.
    Cloud,
    /// A third-party hosted provider; available when an API key is configured.
    External,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Builds providers keyed by [`ProviderKind`].
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn build(kind: ProviderKind, endpoint: &EndpointConfig) -> Result<Arc<dyn Provider>> {
        let provider = match kind {
            ProviderKind::Local => ChatCompletionsProvider::local(endpoint)?,
            ProviderKind::Cloud => ChatCompletionsProvider::hosted(ProviderKind::Cloud, endpoint)?,
            ProviderKind::External => {
                ChatCompletionsProvider::hosted(ProviderKind::External, endpoint)?
            }
        };
        Ok(Arc::new(provider))
    }

    /// One provider per kind referenced by the router profiles, mapped onto
    /// every engine that uses it.
    pub fn from_config(config: &SynapseConfig) -> Result<ProviderSet> {
        let mut built: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
        let mut set = ProviderSet::new();
        for engine in EngineId::all() {
            let kind = config.router.profile(*engine).provider;
            let provider = match built.get(&kind) {
                Some(p) => p.clone(),
                None => {
                    let p = Self::build(kind, config.endpoints.for_kind(kind))?;
                    built.insert(kind, p.clone());
                    p
                }
            };
            set.insert(*engine, provider);
        }
        Ok(set)
    }
}

/// Engine → provider mapping used by the orchestrator.
#[derive(Clone, Default)]
pub struct ProviderSet {
    engines: HashMap<EngineId, Arc<dyn Provider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, engine: EngineId, provider: Arc<dyn Provider>) -> Self {
        self.insert(engine, provider);
        self
    }

    pub fn insert(&mut self, engine: EngineId, provider: Arc<dyn Provider>) {
        self.engines.insert(engine, provider);
    }

    pub fn get(&self, engine: EngineId) -> Option<Arc<dyn Provider>> {
        self.engines.get(&engine).cloned()
    }

    pub fn contains(&self, engine: EngineId) -> bool {
        self.engines.contains_key(&engine)
    }

    /// Registered engines in routing order.
    pub fn engines(&self) -> Vec<EngineId> {
        EngineId::all()
            .iter()
            .copied()
            .filter(|e| self.engines.contains_key(e))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Provider for Echo {
        fn id(&self) -> &str {
            "echo"
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn generate(
            &self,
            request: &GenerateRequest,
        ) -> Result<GenerateResponse, ProviderError> {
            Ok(GenerateResponse::text(request.prompt.clone()))
        }
    }

    #[test]
    fn test_provider_set_lookup() {
        let set = ProviderSet::new()
            .with(EngineId::Deep, Arc::new(Echo))
            .with(EngineId::Fast, Arc::new(Echo));
        assert!(set.contains(EngineId::Fast));
        assert!(set.get(EngineId::Local).is_none());
        assert_eq!(set.engines(), vec![EngineId::Fast, EngineId::Deep]);
    }

    #[test]
    fn test_factory_shares_provider_between_engines_of_same_kind() {
        let config = SynapseConfig::default();
        let set = ProviderFactory::from_config(&config).unwrap();
        assert_eq!(set.engines().len(), 3);

        let fast = set.get(EngineId::Fast).unwrap();
        let deep = set.get(EngineId::Deep).unwrap();
        assert!(Arc::ptr_eq(&fast, &deep));
        assert_eq!(fast.id(), "cloud");
        assert_eq!(set.get(EngineId::Local).unwrap().id(), "local");
    }

    #[test]
    fn test_provider_kind_serde() {
        let kind: ProviderKind = serde_json::from_str("\"external\"").unwrap();
        assert_eq!(kind, ProviderKind::External);
        assert_eq!(ProviderKind::Local.to_string(), "local");
    }
}
