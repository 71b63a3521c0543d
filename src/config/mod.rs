//! Typed configuration for the engine.
//!
//! Every concern gets an explicit configuration record with sensible
//! defaults, builder-style setters, and environment overrides. Loosely
//! typed option maps are rejected at the boundary: the TOML loader denies
//! unknown keys.
//!
//! # Sources, in precedence order
//!
//! 1. Environment variables (`GRAPHTOG_*`)
//! 2. A TOML config file, when provided
//! 3. Built-in defaults
//!
//! # Environment Variables
//!
//! | Variable | Section | Default |
//! |----------|---------|---------|
//! | `GRAPHTOG_LLM_PROVIDER` | llm | `openai` |
//! | `GRAPHTOG_LLM_MODEL` | llm | provider default |
//! | `GRAPHTOG_LLM_API_KEY` | llm | unset |
//! | `GRAPHTOG_LLM_RATE_LIMIT_INTERVAL_MS` | llm | `200` |
//! | `GRAPHTOG_LLM_MAX_RETRIES` | llm | `3` |
//! | `GRAPHTOG_LLM_MAX_CONCURRENT` | llm | `4` |
//! | `GRAPHTOG_CHUNK_TARGET_TOKENS` | chunking | `1000` |
//! | `GRAPHTOG_CHUNK_OVERLAP_TOKENS` | chunking | `500` |
//! | `GRAPHTOG_CHUNK_MIN_TOKENS` | chunking | `100` |
//! | `GRAPHTOG_EXTRACTION_PARALLELISM` | extraction | `4` |
//! | `GRAPHTOG_EXTRACTION_TWO_PASS_MAX` | extraction | `1` |
//! | `GRAPHTOG_RESOLUTION_ENABLED` | resolution | `false` |
//! | `GRAPHTOG_RESOLUTION_SIMILARITY_THRESHOLD` | resolution | `0.85` |
//! | `GRAPHTOG_RESOLUTION_AUTO_MERGE_THRESHOLD` | resolution | `0.95` |
//! | `GRAPHTOG_MAPREDUCE_ENABLED` | mapreduce | `true` |
//! | `GRAPHTOG_MAPREDUCE_BATCH_SIZE` | mapreduce | `10` |
//! | `GRAPHTOG_MAPREDUCE_COMMUNITY_THRESHOLD` | mapreduce | `20` |
//! | `GRAPHTOG_COMMUNITY_SEED` | community | `42` |
//! | `GRAPHTOG_GRAPH_DB_PATH` | graph | in-memory |
//! | `GRAPHTOG_GRAPH_POOL_SIZE` | graph | `4` |

use crate::tog::ToGConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// LLM provider and gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LlmConfig {
    /// Provider name: `openai` or `ollama`.
    pub provider: String,
    /// Model identifier; empty string selects the provider default.
    pub model: String,
    /// API key; falls back to the provider's conventional variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Override API endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Embedding model identifier; empty selects the provider default.
    pub embedding_model: String,
    /// Minimum interval between LLM calls, milliseconds. 0 disables pacing.
    pub rate_limit_interval_ms: u64,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    /// Base backoff between retries, milliseconds (doubles per attempt).
    pub retry_backoff_ms: u64,
    /// Maximum concurrent LLM calls.
    pub max_concurrent: usize,
    /// Request timeout in milliseconds (0 to disable).
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds (0 to disable).
    pub connect_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: String::new(),
            api_key: None,
            endpoint: None,
            embedding_model: String::new(),
            rate_limit_interval_ms: 200,
            max_retries: 3,
            retry_backoff_ms: 250,
            max_concurrent: 4,
            timeout_ms: 30_000,
            connect_timeout_ms: 3_000,
        }
    }
}

impl LlmConfig {
    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("GRAPHTOG_LLM_PROVIDER") {
            self.provider = v;
        }
        if let Ok(v) = std::env::var("GRAPHTOG_LLM_MODEL") {
            self.model = v;
        }
        if let Ok(v) = std::env::var("GRAPHTOG_LLM_API_KEY") {
            self.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("GRAPHTOG_LLM_ENDPOINT") {
            self.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("GRAPHTOG_LLM_EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = env_parse("GRAPHTOG_LLM_RATE_LIMIT_INTERVAL_MS") {
            self.rate_limit_interval_ms = v;
        }
        if let Some(v) = env_parse("GRAPHTOG_LLM_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(v) = env_parse("GRAPHTOG_LLM_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = v;
        }
        if let Some(v) = env_parse::<usize>("GRAPHTOG_LLM_MAX_CONCURRENT") {
            self.max_concurrent = v.max(1);
        }
        if let Some(v) = env_parse("GRAPHTOG_LLM_TIMEOUT_MS") {
            self.timeout_ms = v;
        }
        if let Some(v) = env_parse("GRAPHTOG_LLM_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = v;
        }
        self
    }
}

/// Chunker configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ChunkingConfig {
    /// Target tokens per chunk.
    pub target_tokens: usize,
    /// Overlap tokens carried between neighboring chunks.
    pub overlap_tokens: usize,
    /// Minimum tokens required to emit a chunk.
    pub min_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 1000,
            overlap_tokens: 500,
            min_tokens: 100,
        }
    }
}

impl ChunkingConfig {
    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("GRAPHTOG_CHUNK_TARGET_TOKENS") {
            self.target_tokens = v;
        }
        if let Some(v) = env_parse("GRAPHTOG_CHUNK_OVERLAP_TOKENS") {
            self.overlap_tokens = v;
        }
        if let Some(v) = env_parse("GRAPHTOG_CHUNK_MIN_TOKENS") {
            self.min_tokens = v;
        }
        self
    }

    /// Validates the option ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the overlap is not smaller than the
    /// target or the minimum exceeds the target.
    pub fn validate(&self) -> Result<()> {
        if self.target_tokens == 0 {
            return Err(Error::InvalidInput(
                "chunking.target_tokens must be positive".to_string(),
            ));
        }
        if self.overlap_tokens >= self.target_tokens {
            return Err(Error::InvalidInput(format!(
                "chunking.overlap_tokens ({}) must be smaller than target_tokens ({})",
                self.overlap_tokens, self.target_tokens
            )));
        }
        if self.min_tokens > self.target_tokens {
            return Err(Error::InvalidInput(format!(
                "chunking.min_tokens ({}) must not exceed target_tokens ({})",
                self.min_tokens, self.target_tokens
            )));
        }
        Ok(())
    }
}

/// Extractor configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExtractionConfig {
    /// Bounded parallelism for batch chunk extraction.
    pub batch_parallelism: usize,
    /// Extra continuation passes after the first extraction response.
    pub two_pass_max_iterations: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_parallelism: 4,
            two_pass_max_iterations: 1,
        }
    }
}

impl ExtractionConfig {
    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<usize>("GRAPHTOG_EXTRACTION_PARALLELISM") {
            self.batch_parallelism = v.max(1);
        }
        if let Some(v) = env_parse("GRAPHTOG_EXTRACTION_TWO_PASS_MAX") {
            self.two_pass_max_iterations = v;
        }
        self
    }
}

/// Entity resolution configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResolutionConfig {
    /// Whether resolution runs automatically during indexing.
    pub enabled: bool,
    /// Fuzzy similarity threshold for duplicate candidates.
    pub similarity_threshold: f64,
    /// Whether ambiguous pairs go to the LLM.
    pub use_llm: bool,
    /// LLM confidence at or above which merges happen automatically.
    pub auto_merge_threshold: f32,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            similarity_threshold: 0.85,
            use_llm: false,
            auto_merge_threshold: 0.95,
        }
    }
}

impl ResolutionConfig {
    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_bool("GRAPHTOG_RESOLUTION_ENABLED") {
            self.enabled = v;
        }
        if let Some(v) = env_parse::<f64>("GRAPHTOG_RESOLUTION_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_bool("GRAPHTOG_RESOLUTION_USE_LLM") {
            self.use_llm = v;
        }
        if let Some(v) = env_parse::<f32>("GRAPHTOG_RESOLUTION_AUTO_MERGE_THRESHOLD") {
            self.auto_merge_threshold = v.clamp(0.0, 1.0);
        }
        self
    }
}

/// Map-Reduce global search configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MapReduceConfig {
    /// Whether the map-reduce path is available at all.
    pub enabled: bool,
    /// Communities per map batch.
    pub batch_size: usize,
    /// Minimum community count before map-reduce engages.
    pub community_threshold: usize,
}

impl Default for MapReduceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            community_threshold: 20,
        }
    }
}

impl MapReduceConfig {
    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_bool("GRAPHTOG_MAPREDUCE_ENABLED") {
            self.enabled = v;
        }
        if let Some(v) = env_parse::<usize>("GRAPHTOG_MAPREDUCE_BATCH_SIZE") {
            self.batch_size = v.max(1);
        }
        if let Some(v) = env_parse("GRAPHTOG_MAPREDUCE_COMMUNITY_THRESHOLD") {
            self.community_threshold = v;
        }
        self
    }
}

/// Community detection configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CommunityConfig {
    /// Seed for the modularity optimizer's tie-breaking.
    pub seed: u64,
    /// Convergence tolerance on modularity gain.
    pub tolerance: f64,
    /// Maximum optimizer iterations per level.
    pub max_iterations: u32,
    /// Whether to keep intermediate hierarchy levels.
    pub include_intermediate_levels: bool,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tolerance: 1e-4,
            max_iterations: 10,
            include_intermediate_levels: true,
        }
    }
}

impl CommunityConfig {
    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("GRAPHTOG_COMMUNITY_SEED") {
            self.seed = v;
        }
        if let Some(v) = env_parse("GRAPHTOG_COMMUNITY_TOLERANCE") {
            self.tolerance = v;
        }
        if let Some(v) = env_parse("GRAPHTOG_COMMUNITY_MAX_ITERATIONS") {
            self.max_iterations = v;
        }
        if let Some(v) = env_bool("GRAPHTOG_COMMUNITY_INTERMEDIATE_LEVELS") {
            self.include_intermediate_levels = v;
        }
        self
    }
}

/// Graph store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GraphConfig {
    /// SQLite database path; `None` selects the in-memory store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    /// Connection pool size.
    pub pool_size: usize,
    /// Session acquisition timeout, seconds.
    pub acquisition_timeout_s: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            pool_size: 4,
            acquisition_timeout_s: 30,
        }
    }
}

impl GraphConfig {
    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("GRAPHTOG_GRAPH_DB_PATH") {
            self.db_path = Some(v);
        }
        if let Some(v) = env_parse::<usize>("GRAPHTOG_GRAPH_POOL_SIZE") {
            self.pool_size = v.max(1);
        }
        if let Some(v) = env_parse("GRAPHTOG_GRAPH_ACQUISITION_TIMEOUT_S") {
            self.acquisition_timeout_s = v;
        }
        self
    }
}

/// Aggregate engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GraphtogConfig {
    /// LLM provider and gateway settings.
    pub llm: LlmConfig,
    /// Chunker settings.
    pub chunking: ChunkingConfig,
    /// Extractor settings.
    pub extraction: ExtractionConfig,
    /// Entity resolution settings.
    pub resolution: ResolutionConfig,
    /// Map-Reduce global search settings.
    pub mapreduce: MapReduceConfig,
    /// Community detection settings.
    pub community: CommunityConfig,
    /// Graph store settings.
    pub graph: GraphConfig,
    /// ToG reasoner defaults.
    pub tog: ToGConfig,
}

impl GraphtogConfig {
    /// Loads configuration from defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Loads configuration from a TOML file, then applies env overrides.
    ///
    /// Unknown keys in the file are rejected.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the file cannot be read or parsed.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidInput(format!("cannot read config {}: {e}", path.display()))
        })?;
        let parsed: Self = toml::from_str(&raw).map_err(|e| {
            Error::InvalidInput(format!("cannot parse config {}: {e}", path.display()))
        })?;
        Ok(parsed.with_env_overrides())
    }

    /// Applies environment variable overrides to every section.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.llm = self.llm.with_env_overrides();
        self.chunking = self.chunking.with_env_overrides();
        self.extraction = self.extraction.with_env_overrides();
        self.resolution = self.resolution.with_env_overrides();
        self.mapreduce = self.mapreduce.with_env_overrides();
        self.community = self.community.with_env_overrides();
        self.graph = self.graph.with_env_overrides();
        self.tog = self.tog.with_env_overrides();
        self
    }

    /// Validates cross-field option ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` on the first out-of-range option.
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.tog.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GraphtogConfig::default();
        assert_eq!(config.chunking.target_tokens, 1000);
        assert_eq!(config.chunking.overlap_tokens, 500);
        assert_eq!(config.extraction.batch_parallelism, 4);
        assert_eq!(config.mapreduce.batch_size, 10);
        assert_eq!(config.mapreduce.community_threshold, 20);
        assert_eq!(config.community.seed, 42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunking_validation_rejects_bad_overlap() {
        let config = ChunkingConfig {
            target_tokens: 100,
            overlap_tokens: 100,
            min_tokens: 10,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        let parsed: std::result::Result<GraphtogConfig, _> =
            toml::from_str("[llm]\nbogus_option = true\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_src = r#"
            [chunking]
            target_tokens = 800
            overlap_tokens = 200

            [mapreduce]
            batch_size = 5
        "#;
        let parsed: GraphtogConfig = toml::from_str(toml_src).unwrap_or_default();
        assert_eq!(parsed.chunking.target_tokens, 800);
        assert_eq!(parsed.chunking.overlap_tokens, 200);
        assert_eq!(parsed.chunking.min_tokens, 100);
        assert_eq!(parsed.mapreduce.batch_size, 5);
    }
}
