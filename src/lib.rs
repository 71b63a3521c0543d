//! # Graphtog
//!
//! A GraphRAG question-answering engine over a property-graph knowledge base.
//!
//! Graphtog ingests Markdown documents, extracts a typed entity/relationship
//! graph grounded in text units, detects hierarchical communities, summarizes
//! them, and answers natural-language questions through adaptive retrieval —
//! including an iterative multi-hop Tree-of-Graphs (ToG) reasoner with guided
//! pruning.
//!
//! ## Pipeline
//!
//! ```text
//! Indexing: Chunker → Extractor → GraphStore ← EntityResolver
//!                                      │
//!                                      ▼
//!                         CommunityDetector → CommunitySummarizer
//!
//! Query:    QueryService → classify → Retriever | ToGReasoner → answer
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use graphtog::{GraphtogConfig, IndexingPipeline, QueryService};
//!
//! let config = GraphtogConfig::from_env();
//! let pipeline = IndexingPipeline::new(store.clone(), gateway.clone(), config.clone());
//! pipeline.index_file("notes/acme.md")?;
//!
//! let service = QueryService::new(store, gateway, config);
//! let result = service.process("Where does Alice work?", None)?;
//! println!("{}", result.answer);
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod cache;
pub mod chunking;
pub mod cli;
pub mod community;
pub mod config;
pub mod extract;
pub mod index;
pub mod llm;
pub mod models;
pub mod query;
pub mod resolve;
pub mod retrieve;
pub mod storage;
pub mod tog;

// Re-exports for convenience
pub use chunking::{Chunk, Chunker};
pub use config::{ChunkingConfig, ExtractionConfig, GraphtogConfig, LlmConfig, ResolutionConfig};
pub use extract::Extractor;
pub use index::IndexingPipeline;
pub use llm::{LlmGateway, LlmProvider};
pub use models::{
    Community, Document, DocumentStatus, Entity, EntityId, EntityKind, Envelope, OpStatus,
    ReasoningStep, Relation, Significance, TextUnit, Triplet,
};
pub use query::QueryService;
pub use resolve::EntityResolver;
pub use retrieve::Retriever;
pub use storage::{GraphStore, MemoryGraphStore, SqliteGraphStore};
pub use tog::{ToGConfig, ToGReasoner};

/// Error type for graphtog operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Every variant maps onto one stable machine-readable kind (see
/// [`Error::kind`]), which is what crosses the public envelope boundary.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Malformed text, non-UTF-8 documents, out-of-range parameters |
/// | `NotFound` | Missing entity, community, or document |
/// | `LlmTransient` | Retryable upstream LLM failure (timeout, 429, 5xx) |
/// | `LlmParse` | LLM response not in the required structured form after sanitization |
/// | `GraphConstraint` | Uniqueness or referential violation (usually concurrent convergence) |
/// | `GraphUnavailable` | Graph transport failure or timeout |
/// | `Cycle` | ToG traversal revisited the previous frontier |
/// | `InsufficientEvidence` | ToG reached max depth without sufficiency |
/// | `Cancelled` | Client-initiated termination |
/// | `Internal` | Anything else |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced resource does not exist.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// The resource category (entity, community, document, ...).
        resource: String,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// A retryable upstream LLM failure.
    ///
    /// Retried internally with bounded backoff; surfaced only on exhaustion.
    #[error("llm call '{operation}' failed transiently: {cause}")]
    LlmTransient {
        /// The LLM operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The LLM response could not be parsed into the required structure.
    ///
    /// Triggers a single stricter retry before surfacing.
    #[error("llm response for '{operation}' not parseable: {cause}")]
    LlmParse {
        /// The LLM operation whose output failed to parse.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A graph uniqueness or referential constraint fired.
    ///
    /// During upsert or merge this usually indicates concurrent convergence
    /// and is treated as success after re-reading.
    #[error("graph constraint violated in '{operation}': {cause}")]
    GraphConstraint {
        /// The graph operation that hit the constraint.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The graph store is unreachable or timed out.
    #[error("graph store unavailable during '{operation}': {cause}")]
    GraphUnavailable {
        /// The graph operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// ToG traversal detected a cycle.
    #[error("reasoning cycle detected at depth {depth}")]
    Cycle {
        /// Depth at which the cycle was detected.
        depth: u32,
    },

    /// ToG reached maximum depth without accumulating sufficient evidence.
    #[error("insufficient evidence after {depth} hops")]
    InsufficientEvidence {
        /// Final traversal depth.
        depth: u32,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// An unexpected internal failure.
    #[error("operation '{operation}' failed: {cause}")]
    Internal {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns the stable machine-readable kind for this error.
    ///
    /// These strings are part of the public contract and never change.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::LlmTransient { .. } => "LLM_TRANSIENT",
            Self::LlmParse { .. } => "LLM_PARSE",
            Self::GraphConstraint { .. } => "GRAPH_CONSTRAINT",
            Self::GraphUnavailable { .. } => "GRAPH_UNAVAILABLE",
            Self::Cycle { .. } => "CYCLE",
            Self::InsufficientEvidence { .. } => "INSUFFICIENT_EVIDENCE",
            Self::Cancelled => "CANCELLED",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Returns true if the error is retryable with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LlmTransient { .. } | Self::GraphUnavailable { .. }
        )
    }

    /// Convenience constructor for internal failures.
    pub fn internal(operation: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Internal {
            operation: operation.into(),
            cause: cause.into(),
        }
    }

    /// Convenience constructor for missing resources.
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }
}

/// Result type alias for graphtog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
///
/// Centralized utility to avoid duplicate implementations across the
/// codebase. Uses `SystemTime::now()` with fallback to 0 if the system
/// clock is before the Unix epoch.
#[must_use]
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("bad chunk".to_string());
        assert_eq!(err.to_string(), "invalid input: bad chunk");

        let err = Error::not_found("entity", "Alice");
        assert_eq!(err.to_string(), "entity not found: Alice");

        let err = Error::Cycle { depth: 2 };
        assert_eq!(err.to_string(), "reasoning cycle detected at depth 2");
    }

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(Error::InvalidInput(String::new()).kind(), "INVALID_INPUT");
        assert_eq!(Error::not_found("entity", "x").kind(), "NOT_FOUND");
        assert_eq!(Error::Cancelled.kind(), "CANCELLED");
        assert_eq!(
            Error::InsufficientEvidence { depth: 3 }.kind(),
            "INSUFFICIENT_EVIDENCE"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            Error::LlmTransient {
                operation: "complete".to_string(),
                cause: "429".to_string(),
            }
            .is_transient()
        );
        assert!(!Error::InvalidInput("x".to_string()).is_transient());
    }
}
