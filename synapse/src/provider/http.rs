//! OpenAI-compatible chat-completions provider over `reqwest`.
//!
//! Local servers (llama.cpp, vLLM, Ollama) and hosted gateways speak the same
//! `/chat/completions` shape, so one client serves every [`ProviderKind`];
//! only auth and the availability probe differ.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{GenerateRequest, GenerateResponse, Provider, ProviderKind, Usage};
use crate::config::EndpointConfig;
use crate::errors::ProviderError;

/// Timeout for the local availability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Check if an inference endpoint is reachable (GET {url}/models).
pub async fn check_endpoint(client: &reqwest::Client, url: &str) -> bool {
    let models_url = format!("{}/models", url.trim_end_matches('/'));
    match client.get(&models_url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

pub struct ChatCompletionsProvider {
    kind: ProviderKind,
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatCompletionsProvider {
    /// On-device server; the API key is optional.
    pub fn local(endpoint: &EndpointConfig) -> Result<Self> {
        Self::new(ProviderKind::Local, endpoint)
    }

    /// Hosted provider; calls fail with `InvalidCredential` without a key.
    pub fn hosted(kind: ProviderKind, endpoint: &EndpointConfig) -> Result<Self> {
        Self::new(kind, endpoint)
    }

    fn new(kind: ProviderKind, endpoint: &EndpointConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(endpoint.request_timeout_ms))
            .build()
            .with_context(|| format!("Failed to build HTTP client for {kind} endpoint"))?;
        Ok(Self {
            kind,
            id: kind.to_string(),
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            api_key: endpoint.api_key.clone().filter(|k| !k.is_empty()),
            client,
        })
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Provider for ChatCompletionsProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        match self.kind {
            ProviderKind::Local => check_endpoint(&self.client, &self.base_url).await,
            ProviderKind::Cloud | ProviderKind::External => self.api_key.is_some(),
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&request_body(request));
        match (&self.api_key, self.kind) {
            (Some(key), _) => builder = builder.bearer_auth(key),
            (None, ProviderKind::Local) => {}
            (None, _) => {
                return Err(ProviderError::InvalidCredential(format!(
                    "{} API key missing",
                    self.id
                )))
            }
        }

        debug!(provider = %self.id, model = %request.model, "Sending completion request");
        let resp = builder.send().await.map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await;
            return Err(status_error(status.as_u16(), body));
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        parse_completion(&value)
    }
}

fn request_body(request: &GenerateRequest) -> Value {
    let mut messages = Vec::with_capacity(2);
    if !request.system_instruction.is_empty() {
        messages.push(json!({ "role": "system", "content": request.system_instruction }));
    }
    messages.push(json!({ "role": "user", "content": request.prompt }));
    json!({
        "model": request.model,
        "messages": messages,
    })
}

/// Map a non-2xx response. The status stays authoritative when the body
/// cannot be read; the read error is kept in the message.
fn status_error<E: std::fmt::Display>(status: u16, body: Result<String, E>) -> ProviderError {
    match body {
        Ok(body) => ProviderError::from_status(status, body),
        Err(e) => {
            debug!(status, error = %e, "Failed to read error response body");
            ProviderError::from_status(status, format!("<unreadable body: {e}>"))
        }
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_connect() {
        ProviderError::Unavailable(err.to_string())
    } else {
        ProviderError::Transport(err.to_string())
    }
}

/// Extract the first choice's text and the usage block.
fn parse_completion(value: &Value) -> Result<GenerateResponse, ProviderError> {
    let text = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".into()))?;

    let usage = value.get("usage").and_then(|u| {
        Some(Usage {
            input_tokens: u.get("prompt_tokens")?.as_u64()?,
            output_tokens: u.get("completion_tokens")?.as_u64()?,
        })
    });

    Ok(GenerateResponse {
        text: text.to_string(),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(key: Option<&str>) -> EndpointConfig {
        EndpointConfig {
            base_url: "http://127.0.0.1:9/v1/".into(),
            api_key: key.map(String::from),
            request_timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_parses_completion_with_usage() {
        let value = json!({
            "choices": [{ "message": { "role": "assistant", "content": "hola" } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
        });
        let resp = parse_completion(&value).unwrap();
        assert_eq!(resp.text, "hola");
        assert_eq!(
            resp.usage,
            Some(Usage {
                input_tokens: 12,
                output_tokens: 3
            })
        );
    }

    #[test]
    fn test_status_error_keeps_status_when_body_unreadable() {
        let err = status_error::<String>(429, Err("connection reset".into()));
        assert!(matches!(&err, ProviderError::RateLimited(msg) if msg.contains("connection reset")));

        let err = status_error::<String>(400, Err("eof".into()));
        assert!(matches!(err, ProviderError::BadRequest(_)));

        let err = status_error::<String>(500, Ok("Invalid API key".into()));
        assert!(matches!(err, ProviderError::InvalidCredential(_)));
    }

    #[test]
    fn test_missing_content_is_malformed() {
        let err = parse_completion(&json!({ "choices": [] })).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_body_skips_empty_system_instruction() {
        let req = GenerateRequest {
            model: "m".into(),
            system_instruction: String::new(),
            prompt: "hi".into(),
            context: Default::default(),
        };
        let body = request_body(&req);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_trailing_slash_trimmed_and_empty_key_ignored() {
        let p = ChatCompletionsProvider::hosted(ProviderKind::Cloud, &endpoint(Some(""))).unwrap();
        assert_eq!(p.base_url(), "http://127.0.0.1:9/v1");
        assert!(p.api_key.is_none());
    }

    #[tokio::test]
    async fn test_hosted_without_key_is_unavailable_and_rejects() {
        let p = ChatCompletionsProvider::hosted(ProviderKind::External, &endpoint(None)).unwrap();
        assert!(!p.is_available().await);

        let req = GenerateRequest {
            model: "m".into(),
            system_instruction: "s".into(),
            prompt: "p".into(),
            context: Default::default(),
        };
        let err = p.generate(&req).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidCredential(_)));
    }

    #[tokio::test]
    async fn test_hosted_with_key_reports_available() {
        let p = ChatCompletionsProvider::hosted(ProviderKind::Cloud, &endpoint(Some("k"))).unwrap();
        assert!(p.is_available().await);
        assert_eq!(p.kind(), ProviderKind::Cloud);
    }
}
