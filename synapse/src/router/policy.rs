//! Mode-based engine selection.
//!
//! Pure mapping from (declared mode, prompt heuristics) to
//! (engine, model, system instruction). Recomputed per call; holds no state
//! beyond its configuration, so identical inputs always select identically.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;

/// Caller-declared intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Let the heuristic pick between Fast and Deep.
    Auto,
    Fast,
    Deep,
    /// Prefer the on-device engine; falls back to Fast when it is absent.
    Local,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fast => "fast",
            Self::Deep => "deep",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fast" => Ok(Self::Fast),
            "deep" | "elite" => Ok(Self::Deep),
            "local" | "nano" => Ok(Self::Local),
            other => Err(format!(
                "unknown mode '{other}' (expected auto, fast, deep, or local)"
            )),
        }
    }
}

/// A concrete execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineId {
    /// Offline / on-device model.
    Local,
    /// Low-latency cloud tier.
    Fast,
    /// Reasoning cloud tier.
    Deep,
}

impl EngineId {
    pub fn all() -> &'static [EngineId] {
        &[Self::Local, Self::Fast, Self::Deep]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Fast => "fast",
            Self::Deep => "deep",
        }
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model and persona for one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineProfile {
    pub model: String,
    pub system_instruction: String,
    /// Which provider family serves this engine.
    pub provider: ProviderKind,
}

/// Router tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// AUTO prompts longer than this many characters go Deep.
    pub deep_prompt_threshold: usize,
    /// AUTO prompts containing any of these (case-insensitive) go Deep.
    pub deep_keywords: Vec<String>,
    /// Instruction used when AUTO resolves to Fast.
    pub auto_fast_instruction: String,
    /// Instruction used when AUTO resolves to Deep.
    pub auto_deep_instruction: String,
    pub fast: EngineProfile,
    pub deep: EngineProfile,
    pub local: EngineProfile,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            deep_prompt_threshold: 200,
            deep_keywords: vec!["plan".to_string(), "architect".to_string()],
            auto_fast_instruction: "You are Chalamandra Fast (auto-routed). Respond quickly."
                .to_string(),
            auto_deep_instruction: "You are Chalamandra Elite (auto-routed). Analyze deeply."
                .to_string(),
            fast: EngineProfile {
                model: "gemini-1.5-flash".to_string(),
                system_instruction: "You are Chalamandra Fast. Be concise, direct, and efficient."
                    .to_string(),
                provider: ProviderKind::Cloud,
            },
            deep: EngineProfile {
                model: "gemini-1.5-pro".to_string(),
                system_instruction: "You are Chalamandra Elite, a master architect. Provide deep, \
                                     reasoned, and elegant solutions."
                    .to_string(),
                provider: ProviderKind::Cloud,
            },
            local: EngineProfile {
                model: "gemini-nano".to_string(),
                system_instruction: "You are Chalamandra running on-device. Answer briefly."
                    .to_string(),
                provider: ProviderKind::Local,
            },
        }
    }
}

impl RouterConfig {
    pub fn profile(&self, engine: EngineId) -> &EngineProfile {
        match engine {
            EngineId::Local => &self.local,
            EngineId::Fast => &self.fast,
            EngineId::Deep => &self.deep,
        }
    }
}

/// Outcome of policy selection for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub requested_mode: Mode,
    pub engine: EngineId,
    pub model: String,
    pub system_instruction: String,
    pub rationale: String,
}

impl RoutingDecision {
    /// Label recorded as `engine_used` on results.
    pub fn engine_label(&self) -> String {
        format!("{} ({})", self.engine, self.model)
    }
}

/// Stateless selection policy.
#[derive(Debug, Clone, Default)]
pub struct RouterPolicy {
    config: RouterConfig,
}

impl RouterPolicy {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Whether an AUTO prompt needs the reasoning tier.
    pub fn wants_deep(&self, prompt: &str) -> Option<String> {
        let len = prompt.chars().count();
        if len > self.config.deep_prompt_threshold {
            return Some(format!(
                "prompt length {len} > {}",
                self.config.deep_prompt_threshold
            ));
        }
        let lower = prompt.to_lowercase();
        self.config
            .deep_keywords
            .iter()
            .find(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
            .map(|k| format!("keyword '{k}'"))
    }

    /// Select engine, model, and instruction for `mode`.
    ///
    /// LOCAL always selects the local engine here; whether it is actually
    /// reachable is decided by the orchestrator.
    pub fn select(&self, mode: Mode, prompt: &str) -> RoutingDecision {
        let (engine, system_instruction, rationale) = match mode {
            Mode::Fast => (
                EngineId::Fast,
                self.config.fast.system_instruction.clone(),
                "fast mode requested".to_string(),
            ),
            Mode::Deep => (
                EngineId::Deep,
                self.config.deep.system_instruction.clone(),
                "deep mode requested".to_string(),
            ),
            Mode::Local => (
                EngineId::Local,
                self.config.local.system_instruction.clone(),
                "local mode requested".to_string(),
            ),
            Mode::Auto => match self.wants_deep(prompt) {
                Some(reason) => (
                    EngineId::Deep,
                    self.config.auto_deep_instruction.clone(),
                    format!("auto: {reason} → deep"),
                ),
                None => (
                    EngineId::Fast,
                    self.config.auto_fast_instruction.clone(),
                    "auto: short prompt without planning keywords → fast".to_string(),
                ),
            },
        };

        RoutingDecision {
            requested_mode: mode,
            engine,
            model: self.config.profile(engine).model.clone(),
            system_instruction,
            rationale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_long_prompt_with_keyword_goes_deep() {
        let policy = RouterPolicy::default();
        let prompt = format!("Please architect a service. {}", "x".repeat(280));
        assert_eq!(prompt.chars().count(), 308);
        let d = policy.select(Mode::Auto, &prompt);
        assert_eq!(d.engine, EngineId::Deep);
        assert_eq!(d.model, "gemini-1.5-pro");
        assert!(d.system_instruction.contains("auto-routed"));
    }

    #[test]
    fn test_auto_short_prompt_goes_fast() {
        let policy = RouterPolicy::default();
        let prompt = "What time is it now?";
        assert_eq!(prompt.chars().count(), 20);
        let d = policy.select(Mode::Auto, prompt);
        assert_eq!(d.engine, EngineId::Fast);
        assert_eq!(d.model, "gemini-1.5-flash");
    }

    #[test]
    fn test_auto_keyword_alone_goes_deep() {
        let policy = RouterPolicy::default();
        let d = policy.select(Mode::Auto, "Draft a PLAN");
        assert_eq!(d.engine, EngineId::Deep);
        assert!(d.rationale.contains("keyword"));
    }

    #[test]
    fn test_auto_threshold_counts_chars_not_bytes() {
        let policy = RouterPolicy::default();
        // 150 two-byte chars: 300 bytes but under the 200-char threshold.
        let prompt = "ñ".repeat(150);
        assert_eq!(policy.select(Mode::Auto, &prompt).engine, EngineId::Fast);
        let prompt = "ñ".repeat(201);
        assert_eq!(policy.select(Mode::Auto, &prompt).engine, EngineId::Deep);
    }

    #[test]
    fn test_fixed_modes() {
        let policy = RouterPolicy::default();
        let long = "architect ".repeat(50);
        assert_eq!(policy.select(Mode::Fast, &long).engine, EngineId::Fast);
        assert_eq!(policy.select(Mode::Deep, "hi").engine, EngineId::Deep);
        let local = policy.select(Mode::Local, "hi");
        assert_eq!(local.engine, EngineId::Local);
        assert_eq!(local.model, "gemini-nano");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let policy = RouterPolicy::default();
        let prompt = "How do I plan a migration?";
        assert_eq!(
            policy.select(Mode::Auto, prompt),
            policy.select(Mode::Auto, prompt)
        );
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("AUTO".parse::<Mode>().unwrap(), Mode::Auto);
        assert_eq!("elite".parse::<Mode>().unwrap(), Mode::Deep);
        assert_eq!("nano".parse::<Mode>().unwrap(), Mode::Local);
        assert!("turbo".parse::<Mode>().is_err());
    }

    #[test]
    fn test_custom_keywords() {
        let policy = RouterPolicy::new(RouterConfig {
            deep_keywords: vec!["Refactor".into()],
            ..RouterConfig::default()
        });
        assert_eq!(
            policy.select(Mode::Auto, "refactor this").engine,
            EngineId::Deep
        );
        assert_eq!(policy.select(Mode::Auto, "plan it").engine, EngineId::Fast);
    }

    #[test]
    fn test_engine_label() {
        let d = RouterPolicy::default().select(Mode::Fast, "hi");
        assert_eq!(d.engine_label(), "fast (gemini-1.5-flash)");
    }
}
