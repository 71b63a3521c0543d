//! Gateway facade over an LLM provider.
//!
//! The gateway is the only way services reach a model. It layers, in order:
//!
//! 1. **Bulkhead** — a semaphore bounds concurrent in-flight calls.
//! 2. **Rate pacing** — a process-wide minimum interval between call starts.
//!    Pacing is serialized through a reservation slot; the requests
//!    themselves run concurrently.
//! 3. **Retry** — exponential backoff on transient failures, at least three
//!    attempts by default.
//! 4. **Structured output** — sanitize, extract, parse; one stricter retry
//!    on a parse failure before surfacing `LLM_PARSE`.

use super::{LlmProvider, parse_structured, provider_from_config};
use crate::config::LlmConfig;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Facade adding retry, pacing, and bounded concurrency to a provider.
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    /// Next instant at which a call may start.
    pace_slot: Mutex<Option<Instant>>,
    /// Minimum interval between call starts.
    pace_interval: Duration,
    /// Bulkhead for concurrent in-flight calls.
    permits: Semaphore,
    /// Permit acquisition timeout.
    acquire_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl LlmGateway {
    /// Wraps a provider with gateway behavior.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            pace_slot: Mutex::new(None),
            pace_interval: Duration::from_millis(config.rate_limit_interval_ms),
            permits: Semaphore::new(config.max_concurrent.max(1)),
            acquire_timeout: Duration::from_millis(config.timeout_ms.max(1_000)),
            max_retries: config.max_retries.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Builds the configured provider and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an unknown provider name.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self::new(provider_from_config(config)?, config))
    }

    /// The underlying provider name.
    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Generates a completion with retry, pacing, and bulkheading.
    ///
    /// # Errors
    ///
    /// Returns `LlmTransient` after retry exhaustion, or the provider's
    /// non-retryable error.
    pub fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
        self.execute("complete", || self.provider.complete(prompt, temperature))
    }

    /// Embeds text with retry, pacing, and bulkheading.
    ///
    /// # Errors
    ///
    /// Returns `LlmTransient` after retry exhaustion, or the provider's
    /// non-retryable error.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.execute("embed", || self.provider.embed(text))
    }

    /// Generates a structured response and parses it into `T`.
    ///
    /// On a parse failure the prompt is retried once with a stricter
    /// output instruction before `LLM_PARSE` surfaces.
    ///
    /// # Errors
    ///
    /// Returns `LlmParse` when both attempts produce unparseable output.
    pub fn generate_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        prompt: &str,
        temperature: f32,
    ) -> Result<T> {
        let response = self.complete(prompt, temperature)?;
        match parse_structured(operation, &response) {
            Ok(value) => Ok(value),
            Err(first_err) => {
                tracing::warn!(
                    operation,
                    "structured response unparseable, retrying with strict instruction"
                );
                metrics::counter!("llm_parse_retries_total", "operation" => operation.to_string())
                    .increment(1);
                let strict_prompt = format!(
                    "{prompt}\n\nIMPORTANT: respond with ONLY the JSON object. \
                     No prose, no markdown fences, no commentary."
                );
                let retry = self.complete(&strict_prompt, temperature)?;
                parse_structured(operation, &retry).map_err(|_| first_err)
            },
        }
    }

    /// Runs a provider call under the bulkhead, pacing, and retry layers.
    fn execute<T, F>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let provider = self.provider.name();
        let span = tracing::info_span!(
            "llm.request",
            provider = provider,
            operation = operation,
            status = tracing::field::Empty,
        );
        let _enter = span.enter();

        let _permit = self.acquire_permit(operation)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.pace();

            let started = Instant::now();
            let result = call();
            let elapsed = started.elapsed();

            metrics::histogram!(
                "llm_request_duration_ms",
                "provider" => provider,
                "operation" => operation,
            )
            .record(elapsed.as_secs_f64() * 1000.0);

            match result {
                Ok(value) => {
                    metrics::counter!(
                        "llm_requests_total",
                        "provider" => provider,
                        "operation" => operation,
                        "status" => "success",
                    )
                    .increment(1);
                    span.record("status", "success");
                    return Ok(value);
                },
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    metrics::counter!(
                        "llm_retries_total",
                        "provider" => provider,
                        "operation" => operation,
                    )
                    .increment(1);
                    let backoff = self.retry_backoff * 2_u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        provider,
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient LLM failure, backing off: {err}"
                    );
                    std::thread::sleep(backoff);
                },
                Err(err) => {
                    metrics::counter!(
                        "llm_requests_total",
                        "provider" => provider,
                        "operation" => operation,
                        "status" => "error",
                    )
                    .increment(1);
                    span.record("status", "error");
                    return Err(err);
                },
            }
        }
    }

    /// Acquires a bulkhead permit, polling until the timeout elapses.
    fn acquire_permit(&self, operation: &str) -> Result<tokio::sync::SemaphorePermit<'_>> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            match self.permits.try_acquire() {
                Ok(permit) => return Ok(permit),
                Err(_) if Instant::now() >= deadline => {
                    return Err(Error::LlmTransient {
                        operation: operation.to_string(),
                        cause: "bulkhead saturated: timed out waiting for a call slot".to_string(),
                    });
                },
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    /// Reserves the next pacing slot and sleeps until it arrives.
    ///
    /// The reservation happens under the lock; the sleep does not, so
    /// concurrent callers stagger without serializing their requests.
    fn pace(&self) {
        if self.pace_interval.is_zero() {
            return;
        }
        let wait = {
            let mut slot = self
                .pace_slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Instant::now();
            let start_at = slot.map_or(now, |next| next.max(now));
            *slot = Some(start_at + self.pace_interval);
            start_at.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider that fails transiently a fixed number of times.
    struct FlakyProvider {
        failures: AtomicU32,
    }

    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn complete(&self, _prompt: &str, _temperature: f32) -> Result<String> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                (f > 0).then(|| f - 1)
            }).is_ok()
            {
                return Err(Error::LlmTransient {
                    operation: "complete".to_string(),
                    cause: "simulated 429".to_string(),
                });
            }
            Ok("recovered".to_string())
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 4])
        }
    }

    fn fast_config() -> LlmConfig {
        LlmConfig {
            rate_limit_interval_ms: 0,
            retry_backoff_ms: 1,
            max_retries: 3,
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_failures() {
        let provider = Arc::new(FlakyProvider {
            failures: AtomicU32::new(2),
        });
        let gateway = LlmGateway::new(provider, &fast_config());
        let result = gateway.complete("hello", 0.0);
        assert_eq!(result.unwrap_or_default(), "recovered");
    }

    #[test]
    fn test_retry_exhaustion_surfaces_transient() {
        let provider = Arc::new(FlakyProvider {
            failures: AtomicU32::new(10),
        });
        let gateway = LlmGateway::new(provider, &fast_config());
        let result = gateway.complete("hello", 0.0);
        match result {
            Err(err) => assert_eq!(err.kind(), "LLM_TRANSIENT"),
            Ok(_) => panic!("expected exhaustion"),
        }
    }

    /// Provider that returns prose first, JSON on the strict retry.
    struct StubbornProvider {
        calls: AtomicU32,
    }

    impl LlmProvider for StubbornProvider {
        fn name(&self) -> &'static str {
            "stubborn"
        }

        fn complete(&self, _prompt: &str, _temperature: f32) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok("I think the answer might be forty-two.".to_string())
            } else {
                Ok(r#"{"answer": 42}"#.to_string())
            }
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(Vec::new())
        }
    }

    #[derive(Debug, serde::Deserialize)]
    struct Answer {
        answer: u32,
    }

    #[test]
    fn test_generate_json_strict_retry() {
        let provider = Arc::new(StubbornProvider {
            calls: AtomicU32::new(0),
        });
        let gateway = LlmGateway::new(provider, &fast_config());
        let parsed: Answer = gateway
            .generate_json("test", "answer?", 0.0)
            .unwrap_or(Answer { answer: 0 });
        assert_eq!(parsed.answer, 42);
    }

    #[test]
    fn test_pacing_staggers_calls() {
        let provider = Arc::new(FlakyProvider {
            failures: AtomicU32::new(0),
        });
        let config = LlmConfig {
            rate_limit_interval_ms: 20,
            ..fast_config()
        };
        let gateway = LlmGateway::new(provider, &config);
        let started = Instant::now();
        let _ = gateway.complete("a", 0.0);
        let _ = gateway.complete("b", 0.0);
        let _ = gateway.complete("c", 0.0);
        // Three calls at a 20ms cadence need at least two intervals.
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
