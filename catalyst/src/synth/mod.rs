// synth/mod.rs - Code synthesis backends
//
// A backend turns a `SynthesisRequest` into candidate text. Every failure
// (network, HTTP status, malformed response, nothing recognisable in the
// reply) is logged and reported as `None`; the controller treats that as an
// empty attempt and moves on.

mod anthropic;
mod baseline;
mod openai;

pub use anthropic::AnthropicProvider;
pub use baseline::BaselineProvider;
pub use openai::OpenAiProvider;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ConfigError;
use crate::prompt::SynthesisRequest;

/// Produces candidate translations
#[allow(async_fn_in_trait)]
pub trait Synthesizer {
    async fn generate(&self, request: &SynthesisRequest) -> Option<String>;
}

impl<S: Synthesizer> Synthesizer for &S {
    async fn generate(&self, request: &SynthesisRequest) -> Option<String> {
        (**self).generate(request).await
    }
}

/// The configured provider
pub enum Backend {
    OpenAi(OpenAiProvider),
    Anthropic(AnthropicProvider),
    Baseline(BaselineProvider),
}

impl Backend {
    /// Select a provider once, from configuration
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        Ok(match config.kind {
            ProviderKind::OpenAi => Backend::OpenAi(OpenAiProvider::new(config)?),
            ProviderKind::Anthropic => Backend::Anthropic(AnthropicProvider::new(config)?),
            ProviderKind::Baseline => Backend::Baseline(BaselineProvider),
        })
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Backend::OpenAi(_) => ProviderKind::OpenAi,
            Backend::Anthropic(_) => ProviderKind::Anthropic,
            Backend::Baseline(_) => ProviderKind::Baseline,
        }
    }
}

impl Synthesizer for Backend {
    async fn generate(&self, request: &SynthesisRequest) -> Option<String> {
        match self {
            Backend::OpenAi(p) => p.generate(request).await,
            Backend::Anthropic(p) => p.generate(request).await,
            Backend::Baseline(p) => p.generate(request).await,
        }
    }
}

fn http_client(config: &ProviderConfig) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| ConfigError::Client(e.to_string()))
}

/// Send a prepared request and return the body of a successful response
async fn send(provider: ProviderKind, request: reqwest::RequestBuilder) -> Option<String> {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(%provider, error = %e, "synthesis request failed");
            return None;
        }
    };

    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(%provider, error = %e, "failed to read synthesis response");
            return None;
        }
    };
    if !status.is_success() {
        tracing::warn!(%provider, %status, body = %body, "synthesis backend returned an error");
        return None;
    }
    Some(body)
}

/// Pull the candidate out of a model reply.
///
/// A fenced code block, if present, narrows the search; the candidate is
/// the first balanced `(module ...)` or `(func ...)` form.
pub fn extract_candidate(reply: &str) -> Option<String> {
    let text = strip_fence(reply);
    let start = find_form(text)?;
    let len = balanced_len(&text[start..])?;
    Some(text[start..start + len].to_string())
}

fn strip_fence(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    // Skip the info string (```wat)
    let after = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after,
    };
    match after.find("```") {
        Some(close) => &after[..close],
        None => after,
    }
}

fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    text.strip_prefix(keyword).is_some_and(|rest| {
        rest.chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '(' || c == ')')
    })
}

/// Offset of the first `(module` or `(func` outside a line comment
fn find_form(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(b";;") {
            i += bytes[i..].iter().position(|&b| b == b'\n').unwrap_or(bytes.len() - i);
            continue;
        }
        if bytes[i] == b'(' {
            let rest = &text[i + 1..];
            if starts_with_keyword(rest, "module") || starts_with_keyword(rest, "func") {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Length of the balanced s-expression at the start of `text`
fn balanced_len(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b';' if bytes.get(i + 1) == Some(&b';') => {
                i += bytes[i..].iter().position(|&b| b == b'\n').unwrap_or(bytes.len() - i);
                continue;
            }
            b'(' if bytes.get(i + 1) == Some(&b';') => {
                let close = text[i + 2..].find(";)")?;
                i += close + 4;
                continue;
            }
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'(' => depth += 1,
            b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_fence() {
        let reply = "Here you go:\n```wat\n(func $f (param $context i32)\n  (nop))\n```\nThanks";
        assert_eq!(
            extract_candidate(reply).unwrap(),
            "(func $f (param $context i32)\n  (nop))"
        );
    }

    #[test]
    fn test_extract_bare_reply() {
        let reply = "(module (func (param i32)) (export \"run\" (func 0))) trailing words";
        assert_eq!(
            extract_candidate(reply).unwrap(),
            "(module (func (param i32)) (export \"run\" (func 0)))"
        );
    }

    #[test]
    fn test_comments_do_not_break_balance() {
        let reply = ";; (func commented out\n(func $f (param i32) ;; closes ) early?\n  (; block ) ;) nop)";
        let candidate = extract_candidate(reply).unwrap();
        assert!(candidate.starts_with("(func $f"));
        assert!(candidate.ends_with("nop)"));
    }

    #[test]
    fn test_no_candidate() {
        assert!(extract_candidate("I cannot help with that.").is_none());
        assert!(extract_candidate("(function foo)").is_none());
        assert!(extract_candidate("(func $f (param i32)").is_none());
    }

    #[test]
    fn test_string_with_paren() {
        let reply = "(module (export \"run)\" (func 0)) (func (param i32)))";
        assert_eq!(extract_candidate(reply).unwrap(), reply);
    }
}
