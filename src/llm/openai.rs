//! `OpenAI`-compatible chat and embedding client.

use super::{LlmProvider, build_http_client, classify_http_error, classify_http_status};
use crate::config::LlmConfig;
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// `OpenAI`-compatible LLM client.
///
/// Works against the official API and any server that speaks the
/// `/chat/completions` and `/embeddings` routes.
///
/// The API key is held as a `SecretString`, which zeroizes its memory on
/// drop so the credential does not linger for the process lifetime.
pub struct OpenAiClient {
    /// API key.
    api_key: Option<SecretString>,
    /// API endpoint.
    endpoint: String,
    /// Chat model.
    model: String,
    /// Embedding model.
    embedding_model: String,
    /// HTTP client.
    client: reqwest::blocking::Client,
}

impl OpenAiClient {
    /// Default API endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.openai.com/v1";

    /// Default chat model.
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    /// Default embedding model.
    pub const DEFAULT_EMBEDDING_MODEL: &'static str = "text-embedding-3-small";

    /// Creates a client from environment variables.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&LlmConfig::default())
    }

    /// Creates a client from configuration, with `OPENAI_API_KEY` fallback.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .map(SecretString::from);
        let model = if config.model.is_empty() {
            Self::DEFAULT_MODEL.to_string()
        } else {
            config.model.clone()
        };
        let embedding_model = if config.embedding_model.is_empty() {
            Self::DEFAULT_EMBEDDING_MODEL.to_string()
        } else {
            config.embedding_model.clone()
        };
        Self {
            api_key,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_ENDPOINT.to_string()),
            model,
            embedding_model,
            client: build_http_client(config.timeout_ms, config.connect_timeout_ms),
        }
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    /// Sets the API endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the chat model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn key(&self) -> Result<&SecretString> {
        self.api_key
            .as_ref()
            .ok_or_else(|| Error::internal("openai_request", "OPENAI_API_KEY not set"))
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
        let key = self.key()?;
        let request = ChatRequest {
            model: self.model.clone(),
            temperature,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(key.expose_secret())
            .json(&request)
            .send()
            .map_err(|e| classify_http_error("openai_complete", &e))?;

        if !response.status().is_success() {
            return Err(classify_http_status("openai_complete", response.status()));
        }

        let body: ChatResponse = response
            .json()
            .map_err(|e| Error::internal("openai_complete", e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::internal("openai_complete", "no choices in response"))
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = self.key()?;
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: text.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .bearer_auth(key.expose_secret())
            .json(&request)
            .send()
            .map_err(|e| classify_http_error("openai_embed", &e))?;

        if !response.status().is_success() {
            return Err(classify_http_status("openai_embed", response.status()));
        }

        let body: EmbeddingResponse = response
            .json()
            .map_err(|e| Error::internal("openai_embed", e.to_string()))?;

        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::internal("openai_embed", "no embedding in response"))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OpenAiClient::new();
        assert_eq!(client.name(), "openai");
        assert_eq!(client.model, OpenAiClient::DEFAULT_MODEL);
    }

    #[test]
    fn test_client_configuration() {
        let client = OpenAiClient::new()
            .with_api_key("test-key")
            .with_endpoint("http://localhost:8080/v1")
            .with_model("gpt-4o");

        // SecretString has no PartialEq; inspect via expose_secret.
        assert_eq!(
            client.api_key.as_ref().map(ExposeSecret::expose_secret),
            Some("test-key")
        );
        assert_eq!(client.endpoint, "http://localhost:8080/v1");
        assert_eq!(client.model, "gpt-4o");
    }

    #[test]
    fn test_missing_key_is_internal_error() {
        let client = OpenAiClient {
            api_key: None,
            endpoint: OpenAiClient::DEFAULT_ENDPOINT.to_string(),
            model: OpenAiClient::DEFAULT_MODEL.to_string(),
            embedding_model: OpenAiClient::DEFAULT_EMBEDDING_MODEL.to_string(),
            client: reqwest::blocking::Client::new(),
        };
        assert!(client.key().is_err());
    }
}
