//! LLM client abstraction.
//!
//! Provides a unified interface over generative-model providers plus the
//! [`LlmGateway`] facade that every service talks to. The gateway owns
//! retry, rate pacing, bounded concurrency, and structured-output parsing;
//! providers only know how to move text over HTTP.
//!
//! # Supported Providers
//!
//! | Provider | Client | Environment Variables |
//! |----------|--------|----------------------|
//! | `OpenAI`-compatible | [`OpenAiClient`] | `OPENAI_API_KEY` |
//! | Ollama (local) | [`OllamaClient`] | `OLLAMA_HOST`, `OLLAMA_MODEL` |
//!
//! # Usage
//!
//! ```rust,ignore
//! use graphtog::llm::{LlmGateway, OpenAiClient};
//! use graphtog::config::LlmConfig;
//!
//! let config = LlmConfig::default().with_env_overrides();
//! let gateway = LlmGateway::from_config(&config)?;
//! let answer = gateway.complete("Summarize GraphRAG in one sentence", 0.0)?;
//! ```
//!
//! # Implementing a New Provider
//!
//! Implement [`LlmProvider`] and hand the client to
//! [`LlmGateway::new`]; the gateway layers its behavior on top of any
//! provider.

mod gateway;
mod ollama;
mod openai;
pub mod prompts;

pub use gateway::LlmGateway;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

use crate::config::LlmConfig;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Trait for LLM providers.
///
/// Implementations must be cheap to share across threads; the gateway wraps
/// them in an `Arc` and calls them from many workers.
pub trait LlmProvider: Send + Sync {
    /// The provider name.
    fn name(&self) -> &'static str;

    /// Generates a completion for the given prompt at the given temperature.
    ///
    /// # Errors
    ///
    /// Returns `LlmTransient` for retryable upstream failures (timeouts,
    /// rate limits, 5xx) and `Internal` for everything else.
    fn complete(&self, prompt: &str, temperature: f32) -> Result<String>;

    /// Embeds text into a fixed-dimension vector.
    ///
    /// # Errors
    ///
    /// Returns `LlmTransient` for retryable upstream failures, `Internal`
    /// when the provider has no embedding endpoint.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Builds the configured provider.
///
/// # Errors
///
/// Returns `InvalidInput` for an unknown provider name.
pub fn provider_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.to_lowercase().as_str() {
        "openai" => Ok(Arc::new(OpenAiClient::from_config(config))),
        "ollama" => Ok(Arc::new(OllamaClient::from_config(config))),
        other => Err(Error::InvalidInput(format!("unknown llm provider: {other}"))),
    }
}

/// Builds a blocking HTTP client with the configured timeouts.
#[must_use]
pub fn build_http_client(timeout_ms: u64, connect_timeout_ms: u64) -> reqwest::blocking::Client {
    let mut builder = reqwest::blocking::Client::builder();
    if timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(timeout_ms));
    }
    if connect_timeout_ms > 0 {
        builder = builder.connect_timeout(Duration::from_millis(connect_timeout_ms));
    }
    builder.build().unwrap_or_else(|err| {
        tracing::warn!("Failed to build LLM HTTP client: {err}");
        reqwest::blocking::Client::new()
    })
}

/// Classifies a reqwest error into the stable taxonomy.
pub(crate) fn classify_http_error(operation: &str, err: &reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() {
        return Error::LlmTransient {
            operation: operation.to_string(),
            cause: err.to_string(),
        };
    }
    Error::internal(operation, err.to_string())
}

/// Classifies an HTTP status into the stable taxonomy.
pub(crate) fn classify_http_status(operation: &str, status: reqwest::StatusCode) -> Error {
    if status.as_u16() == 429 || status.is_server_error() {
        return Error::LlmTransient {
            operation: operation.to_string(),
            cause: format!("API returned status: {status}"),
        };
    }
    Error::internal(operation, format!("API returned status: {status}"))
}

/// Canonicalizes an LLM response before JSON parsing.
///
/// Strips ASCII control characters (except whitespace) that some models
/// leak into structured output.
#[must_use]
pub fn sanitize_response(response: &str) -> String {
    response
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Extracts JSON from an LLM response, handling markdown code blocks.
///
/// # Handling
///
/// 1. Markdown code blocks with `json` language marker
/// 2. Markdown code blocks without language marker
/// 3. Raw JSON objects (first `{` to last `}`)
/// 4. JSON arrays (first `[` to last `]`)
#[must_use]
pub fn extract_json_from_response(response: &str) -> &str {
    let trimmed = response.trim();

    // Handle ```json ... ``` blocks
    if let Some((json_start, end)) = trimmed.find("```json").and_then(|start| {
        let json_start = start + 7;
        trimmed[json_start..]
            .find("```")
            .map(|end| (json_start, end))
    }) {
        return trimmed[json_start..json_start + end].trim();
    }

    // Handle ``` ... ``` blocks without a language marker
    if let Some((json_start, end)) = trimmed.find("```").and_then(|start| {
        let content_start = start + 3;
        let after_marker = &trimmed[content_start..];
        let json_start = after_marker
            .find(['{', '['])
            .map_or(content_start, |pos| content_start + pos);
        trimmed[json_start..]
            .find("```")
            .map(|end| (json_start, end))
    }) {
        return trimmed[json_start..json_start + end].trim();
    }

    // Raw JSON object
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }

    // JSON array
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }

    trimmed
}

/// Parses a structured LLM response into `T` after sanitization.
///
/// # Errors
///
/// Returns `LlmParse` carrying a truncated sample of the offending
/// response.
pub fn parse_structured<T: serde::de::DeserializeOwned>(operation: &str, response: &str) -> Result<T> {
    let sanitized = sanitize_response(response);
    let json = extract_json_from_response(&sanitized);
    serde_json::from_str(json).map_err(|e| Error::LlmParse {
        operation: operation.to_string(),
        cause: format!("{e}. Response sample: {}", truncate_sample(response)),
    })
}

fn truncate_sample(response: &str) -> String {
    const MAX: usize = 200;
    if response.chars().count() > MAX {
        let truncated: String = response.chars().take(MAX).collect();
        format!("{truncated}...(truncated)")
    } else {
        response.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_extract_json_raw() {
        let response = r#"{"key": "value"}"#;
        assert_eq!(extract_json_from_response(response), r#"{"key": "value"}"#);
    }

    #[test]
    fn test_extract_json_markdown() {
        let response = "```json\n{\"key\": \"value\"}\n```";
        assert!(extract_json_from_response(response).contains("\"key\""));
    }

    #[test]
    fn test_extract_json_with_prose() {
        let response = "Here is the result: {\"key\": \"value\"} hope this helps";
        assert_eq!(extract_json_from_response(response), r#"{"key": "value"}"#);
    }

    #[test]
    fn test_extract_json_array() {
        let response = r#"["a", "b"]"#;
        assert_eq!(extract_json_from_response(response), r#"["a", "b"]"#);
    }

    #[test]
    fn test_sanitize_strips_control_chars() {
        let dirty = "ok\u{0000}\u{0007}\nline";
        assert_eq!(sanitize_response(dirty), "ok\nline");
    }

    #[derive(Debug, Deserialize)]
    struct Sample {
        answer: String,
    }

    #[test]
    fn test_parse_structured_success() {
        let response = "```json\n{\"answer\": \"Paris\"}\n```";
        let parsed: Sample = parse_structured("test", response).unwrap_or(Sample {
            answer: String::new(),
        });
        assert_eq!(parsed.answer, "Paris");
    }

    #[test]
    fn test_parse_structured_error_carries_kind() {
        let result: Result<Sample> = parse_structured("test", "not json at all");
        match result {
            Err(err) => assert_eq!(err.kind(), "LLM_PARSE"),
            Ok(_) => panic!("expected parse failure"),
        }
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = LlmConfig {
            provider: "delphi".to_string(),
            ..LlmConfig::default()
        };
        assert!(provider_from_config(&config).is_err());
    }
}
