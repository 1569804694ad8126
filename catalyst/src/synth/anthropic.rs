// synth/anthropic.rs - Anthropic messages backend

use super::{extract_candidate, http_client, send, Synthesizer};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ConfigError;
use crate::prompt::SynthesisRequest;
use serde::{Deserialize, Serialize};

const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Text of the first text block
fn reply_text(body: &str) -> Option<String> {
    let response: MessagesResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "malformed Anthropic response");
            return None;
        }
    };
    response
        .content
        .into_iter()
        .find(|block| block.kind == "text")
        .and_then(|block| block.text)
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        Ok(AnthropicProvider {
            api_key: config.require_key()?.to_string(),
            client: http_client(config)?,
            config: config.clone(),
        })
    }
}

impl Synthesizer for AnthropicProvider {
    async fn generate(&self, request: &SynthesisRequest) -> Option<String> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };
        tracing::debug!(model = %self.config.model, attempt = request.attempt, "requesting candidate from Anthropic");

        let http = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        let reply = reply_text(&send(ProviderKind::Anthropic, http).await?)?;
        let candidate = extract_candidate(&reply);
        if candidate.is_none() {
            tracing::warn!("Anthropic reply contained no function or module");
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_text_skips_non_text_blocks() {
        let body = r#"{"content":[{"type":"thinking","thinking":"..."},{"type":"text","text":"(func $g)"}]}"#;
        assert_eq!(reply_text(body).as_deref(), Some("(func $g)"));
        assert_eq!(reply_text(r#"{"content":[]}"#), None);
        assert_eq!(reply_text("{}"), None);
    }

    #[test]
    fn test_key_shape() {
        let mut config = ProviderConfig::new(ProviderKind::Anthropic);
        assert!(AnthropicProvider::new(&config).is_err());
        config.api_key = Some("sk-ant-test".into());
        assert!(AnthropicProvider::new(&config).is_ok());
    }
}
