// synth/openai.rs - OpenAI chat completions backend

use super::{extract_candidate, http_client, send, Synthesizer};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ConfigError;
use crate::prompt::SynthesisRequest;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

/// Text of the first choice
fn reply_text(body: &str) -> Option<String> {
    let response: ChatResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "malformed OpenAI response");
            return None;
        }
    };
    response.choices.into_iter().next()?.message.content
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        Ok(OpenAiProvider {
            api_key: config.require_key()?.to_string(),
            client: http_client(config)?,
            config: config.clone(),
        })
    }
}

impl Synthesizer for OpenAiProvider {
    async fn generate(&self, request: &SynthesisRequest) -> Option<String> {
        let body = ChatRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };
        tracing::debug!(model = %self.config.model, attempt = request.attempt, "requesting candidate from OpenAI");

        let http = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);
        let reply = reply_text(&send(ProviderKind::OpenAi, http).await?)?;
        let candidate = extract_candidate(&reply);
        if candidate.is_none() {
            tracing::warn!("OpenAI reply contained no function or module");
        }
        candidate
    }
}
