//! Ollama local model client.

use super::{LlmProvider, build_http_client, classify_http_error, classify_http_status};
use crate::config::LlmConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Ollama client for locally hosted models.
pub struct OllamaClient {
    /// Ollama host URL.
    host: String,
    /// Generation model.
    model: String,
    /// Embedding model.
    embedding_model: String,
    /// HTTP client.
    client: reqwest::blocking::Client,
}

impl OllamaClient {
    /// Default host.
    pub const DEFAULT_HOST: &'static str = "http://localhost:11434";

    /// Default model.
    pub const DEFAULT_MODEL: &'static str = "llama3.1";

    /// Default embedding model.
    pub const DEFAULT_EMBEDDING_MODEL: &'static str = "nomic-embed-text";

    /// Creates a client from environment variables.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&LlmConfig::default())
    }

    /// Creates a client from configuration, with `OLLAMA_HOST` /
    /// `OLLAMA_MODEL` fallbacks.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        let host = config.endpoint.clone().unwrap_or_else(|| {
            std::env::var("OLLAMA_HOST").unwrap_or_else(|_| Self::DEFAULT_HOST.to_string())
        });
        let model = if config.model.is_empty() {
            std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| Self::DEFAULT_MODEL.to_string())
        } else {
            config.model.clone()
        };
        let embedding_model = if config.embedding_model.is_empty() {
            Self::DEFAULT_EMBEDDING_MODEL.to_string()
        } else {
            config.embedding_model.clone()
        };
        Self {
            host,
            model,
            embedding_model,
            client: build_http_client(config.timeout_ms, config.connect_timeout_ms),
        }
    }

    /// Sets the host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: GenerateOptions { temperature },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.host))
            .json(&request)
            .send()
            .map_err(|e| classify_http_error("ollama_complete", &e))?;

        if !response.status().is_success() {
            return Err(classify_http_status("ollama_complete", response.status()));
        }

        let body: GenerateResponse = response
            .json()
            .map_err(|e| Error::internal("ollama_complete", e.to_string()))?;
        Ok(body.response)
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.host))
            .json(&request)
            .send()
            .map_err(|e| classify_http_error("ollama_embed", &e))?;

        if !response.status().is_success() {
            return Err(classify_http_status("ollama_embed", response.status()));
        }

        let body: EmbeddingResponse = response
            .json()
            .map_err(|e| Error::internal("ollama_embed", e.to_string()))?;
        Ok(body.embedding)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let client = OllamaClient {
            host: OllamaClient::DEFAULT_HOST.to_string(),
            model: OllamaClient::DEFAULT_MODEL.to_string(),
            embedding_model: OllamaClient::DEFAULT_EMBEDDING_MODEL.to_string(),
            client: reqwest::blocking::Client::new(),
        };
        assert_eq!(client.name(), "ollama");
        assert_eq!(client.host, "http://localhost:11434");
    }

    #[test]
    fn test_builder_overrides() {
        let client = OllamaClient::new()
            .with_host("http://gpu-box:11434")
            .with_model("mistral");
        assert_eq!(client.host, "http://gpu-box:11434");
        assert_eq!(client.model, "mistral");
    }
}
