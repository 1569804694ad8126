// config.rs - Configuration
//
// Pipeline knobs, synthesis provider selection and the API keys file.

use crate::classify::Limits;
use crate::error::ConfigError;
use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Knobs of the translation pipeline
#[derive(Debug, Clone)]
pub struct CatalystConfig {
    /// Attempts per translation run, including the first
    pub max_attempts: usize,
    /// The single input on which candidates are compared with the interpreter
    pub canonical_receiver: i32,
    pub max_stack_operations: usize,
    pub max_instructions: usize,
    /// Fuel granted to each compiled routine invocation
    pub fuel: u64,
    /// Validator messages matching any of these (case-insensitive) are
    /// downgraded to a benign mismatch. A downgraded candidate still has to
    /// compile in the execution engine and match the reference result, so
    /// the execution gate always has the final word.
    pub benign_validation_patterns: Vec<String>,
    /// Prefix of the function name requested from the backend
    pub function_prefix: String,
}

impl Default for CatalystConfig {
    fn default() -> Self {
        CatalystConfig {
            max_attempts: 2,
            canonical_receiver: 100,
            max_stack_operations: 50,
            max_instructions: 100,
            fuel: 1_000_000,
            benign_validation_patterns: [
                "gc feature",
                "function references",
                "heap type",
                "reference type",
                "invalid value type",
                "(ref eq)",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            function_prefix: "translated_method".to_string(),
        }
    }
}

impl CatalystConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_stack_operations: self.max_stack_operations,
            max_instructions: self.max_instructions,
        }
    }
}

/// Synthesis providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    /// Offline lowering, no network
    Baseline,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Baseline => "baseline",
        }
    }

    fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1/chat/completions",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1/messages",
            ProviderKind::Baseline => "",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o",
            ProviderKind::Anthropic => "claude-opus-4-20250514",
            ProviderKind::Baseline => "baseline",
        }
    }

    /// Environment variable holding the API key
    pub fn key_variable(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Baseline => None,
        }
    }

    /// Whether `key` has the shape this provider issues
    pub fn accepts_key(&self, key: &str) -> bool {
        match self {
            ProviderKind::OpenAi => key.starts_with("sk-"),
            ProviderKind::Anthropic => key.starts_with("sk-ant-"),
            ProviderKind::Baseline => false,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "gpt" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "baseline" | "offline" => Ok(ProviderKind::Baseline),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings of the selected synthesis provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    pub api_key: Option<String>,
}

impl ProviderConfig {
    /// Defaults for `kind`, without a key
    pub fn new(kind: ProviderKind) -> Self {
        ProviderConfig {
            kind,
            endpoint: kind.default_endpoint().to_string(),
            model: kind.default_model().to_string(),
            max_tokens: 4000,
            temperature: 0.3,
            timeout: Duration::from_secs(60),
            api_key: None,
        }
    }

    /// Fill in a missing key from the provider's environment variable
    pub fn with_env_key(mut self) -> Self {
        if self.api_key.is_none() {
            self.api_key = self
                .kind
                .key_variable()
                .and_then(|var| std::env::var(var).ok())
                .filter(|key| self.kind.accepts_key(key));
        }
        self
    }

    /// The key, or an error naming the provider
    pub fn require_key(&self) -> std::result::Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or(ConfigError::MissingKey(self.kind.name()))
    }
}

/// Keys read from a keys file, in order of first appearance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keys {
    entries: Vec<(ProviderKind, String)>,
}

impl Keys {
    /// Provider listed first
    pub fn primary(&self) -> Option<ProviderKind> {
        self.entries.first().map(|(kind, _)| *kind)
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, key)| key.as_str())
    }

    pub fn providers(&self) -> Vec<ProviderKind> {
        self.entries.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a keys file.
///
/// Accepts `provider=key` and `Provider API key: key` lines; `#` starts a
/// comment. Lines with an unknown provider or a key of the wrong shape are
/// skipped. The first key for a provider wins.
pub fn parse_keys(text: &str) -> Keys {
    let mut keys = Keys::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let entry = if let Some((name, key)) = line.split_once('=') {
            Some((name.to_string(), key))
        } else if let Some((label, key)) = line.split_once(':') {
            label
                .trim()
                .to_lowercase()
                .strip_suffix("api key")
                .map(|name| (name.to_string(), key))
        } else {
            None
        };

        let Some((name, key)) = entry else { continue };
        let Ok(kind) = name.parse::<ProviderKind>() else {
            tracing::debug!(line, "skipping keys file line with unknown provider");
            continue;
        };
        let key = key.trim();
        if !kind.accepts_key(key) {
            tracing::warn!(provider = kind.name(), "skipping malformed API key");
            continue;
        }
        if keys.get(kind).is_none() {
            keys.entries.push((kind, key.to_string()));
        }
    }

    keys
}

/// Read and parse a keys file
pub fn load_keys(path: &Path) -> Result<Keys> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read keys file: {}", path.display()))?;
    Ok(parse_keys(&text))
}
