//! Shared test helpers: a scripted LLM provider and gateway wiring.

// Test helpers may panic freely.
#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use graphtog::config::LlmConfig;
use graphtog::llm::{LlmGateway, LlmProvider};
use graphtog::Result;
use std::sync::Arc;

/// LLM provider driven by `(needle, response)` rules.
///
/// The first rule whose needle appears in the prompt wins; unmatched
/// prompts get the default response. This keeps integration tests fully
/// offline and deterministic.
pub struct ScriptedLlm {
    rules: Vec<(String, String)>,
    default: String,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default: "{}".to_string(),
        }
    }

    /// Adds a rule; earlier rules take precedence.
    #[must_use]
    pub fn on(mut self, needle: &str, response: &str) -> Self {
        self.rules.push((needle.to_string(), response.to_string()));
        self
    }

    #[must_use]
    pub fn with_default(mut self, response: &str) -> Self {
        self.default = response.to_string();
        self
    }
}

impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn complete(&self, prompt: &str, _temperature: f32) -> Result<String> {
        for (needle, response) in &self.rules {
            if prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.default.clone())
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // Cheap deterministic embedding: letter histogram.
        let mut vec = vec![0.0_f32; 26];
        for c in text.to_lowercase().chars() {
            if c.is_ascii_lowercase() {
                vec[(c as usize) - ('a' as usize)] += 1.0;
            }
        }
        Ok(vec)
    }
}

/// Wraps a scripted provider in a gateway tuned for tests (no pacing, tiny
/// backoff).
pub fn test_gateway(llm: ScriptedLlm) -> Arc<LlmGateway> {
    let config = LlmConfig {
        rate_limit_interval_ms: 0,
        retry_backoff_ms: 1,
        max_retries: 2,
        ..LlmConfig::default()
    };
    Arc::new(LlmGateway::new(Arc::new(llm), &config))
}

/// An extraction response in the delimited record format.
pub fn extraction_response(records: &[&str]) -> String {
    let mut out = records.join("\n");
    out.push_str("\n<COMPLETE>");
    out
}
