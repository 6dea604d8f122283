//! Configuration: defaults, optional TOML file, then `SYNAPSE_*` environment
//! overrides. Precedence is env > file > defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::JobPollConfig;
use crate::provider::ProviderKind;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::router::policy::{EngineId, RouterConfig};

pub const ENV_FAILURE_THRESHOLD: &str = "SYNAPSE_FAILURE_THRESHOLD";
pub const ENV_RESET_TIMEOUT_MS: &str = "SYNAPSE_RESET_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "SYNAPSE_MAX_RETRIES";
pub const ENV_BASE_DELAY_MS: &str = "SYNAPSE_BASE_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "SYNAPSE_MAX_DELAY_MS";
pub const ENV_CLOUD_URL: &str = "SYNAPSE_CLOUD_URL";
pub const ENV_API_KEY: &str = "SYNAPSE_API_KEY";
pub const ENV_LOCAL_URL: &str = "SYNAPSE_LOCAL_URL";
pub const ENV_EXTERNAL_URL: &str = "SYNAPSE_EXTERNAL_URL";
pub const ENV_EXTERNAL_API_KEY: &str = "SYNAPSE_EXTERNAL_API_KEY";

const REDACTED: &str = "***";

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("breaker.failure_threshold must be at least 1")]
    ZeroFailureThreshold,

    #[error("retry.max_delay_ms ({max_delay_ms}) must be >= retry.base_delay_ms ({base_delay_ms})")]
    DelayRange { base_delay_ms: u64, max_delay_ms: u64 },

    #[error("router.{engine}.model must not be empty")]
    EmptyModel { engine: EngineId },

    #[error("endpoints.{kind}.base_url must not be empty")]
    EmptyBaseUrl { kind: ProviderKind },

    #[error("{var}={value:?} is not a valid number")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_jitter_ms: 500,
        }
    }
}

/// One OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl EndpointConfig {
    fn with_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsSection {
    /// llama.cpp / Ollama style server on the local machine.
    pub local: EndpointConfig,
    pub cloud: EndpointConfig,
    pub external: EndpointConfig,
}

impl Default for EndpointsSection {
    fn default() -> Self {
        Self {
            local: EndpointConfig::with_url("http://localhost:8080/v1"),
            cloud: EndpointConfig::with_url("https://generativelanguage.googleapis.com/v1beta/openai"),
            external: EndpointConfig::with_url("https://api.deepseek.com/v1"),
        }
    }
}

impl EndpointsSection {
    pub fn for_kind(&self, kind: ProviderKind) -> &EndpointConfig {
        match kind {
            ProviderKind::Local => &self.local,
            ProviderKind::Cloud => &self.cloud,
            ProviderKind::External => &self.external,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            timeout_ms: 600_000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynapseConfig {
    pub breaker: BreakerSection,
    pub retry: RetrySection,
    pub router: RouterConfig,
    pub endpoints: EndpointsSection,
    pub jobs: JobsSection,
}

impl SynapseConfig {
    /// Defaults, then `path` (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config
            .apply_overrides(|var| std::env::var(var).ok())
            .context("Invalid environment override")?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `SYNAPSE_*` overrides. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, ENV_FAILURE_THRESHOLD)? {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_RESET_TIMEOUT_MS)? {
            self.breaker.reset_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_RETRIES)? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_BASE_DELAY_MS)? {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_DELAY_MS)? {
            self.retry.max_delay_ms = v;
        }
        if let Some(url) = lookup(ENV_CLOUD_URL) {
            self.endpoints.cloud.base_url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.endpoints.cloud.api_key = Some(key);
        }
        if let Some(url) = lookup(ENV_LOCAL_URL) {
            self.endpoints.local.base_url = url;
        }
        if let Some(url) = lookup(ENV_EXTERNAL_URL) {
            self.endpoints.external.base_url = url;
        }
        if let Some(key) = lookup(ENV_EXTERNAL_API_KEY) {
            self.endpoints.external.api_key = Some(key);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::DelayRange {
                base_delay_ms: self.retry.base_delay_ms,
                max_delay_ms: self.retry.max_delay_ms,
            });
        }
        for engine in EngineId::all() {
            let profile = self.router.profile(*engine);
            if profile.model.trim().is_empty() {
                return Err(ConfigError::EmptyModel { engine: *engine });
            }
            if self.endpoints.for_kind(profile.provider).base_url.trim().is_empty() {
                return Err(ConfigError::EmptyBaseUrl {
                    kind: profile.provider,
                });
            }
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            reset_timeout: Duration::from_millis(self.breaker.reset_timeout_ms),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_jitter: Duration::from_millis(self.retry.max_jitter_ms),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        self.router.clone()
    }

    pub fn job_config(&self) -> JobPollConfig {
        JobPollConfig {
            poll_interval: Duration::from_millis(self.jobs.poll_interval_ms),
            timeout: Duration::from_millis(self.jobs.timeout_ms),
        }
    }

    /// Copy with API keys masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for endpoint in [
            &mut copy.endpoints.local,
            &mut copy.endpoints.cloud,
            &mut copy.endpoints.external,
        ] {
            if endpoint.api_key.is_some() {
                endpoint.api_key = Some(REDACTED.to_string());
            }
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}
