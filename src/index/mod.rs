//! Document indexing pipeline.
//!
//! Orchestrates the full ingest path for a UTF-8 Markdown document:
//!
//! 1. Hash the content; unchanged completed documents are skipped, changed
//!    ones have their previous subgraph deleted and their version bumped.
//! 2. Chunk into overlapping text units.
//! 3. Extract entities and relations per chunk (bounded parallelism).
//! 4. Optionally run the auto-resolution pass.
//! 5. Detect communities — full on first ingest, incremental afterwards.
//! 6. Summarize stale or new communities.
//!
//! Each stage is reported; chunk and community failures are isolated and
//! never abort the pipeline once extraction has produced entities.

use crate::chunking::Chunker;
use crate::community::{CommunityDetector, CommunitySummarizer};
use crate::config::GraphtogConfig;
use crate::extract::Extractor;
use crate::llm::LlmGateway;
use crate::models::{Document, DocumentStatus, TextUnit};
use crate::resolve::{EntityResolver, ResolutionReport};
use crate::storage::{AffectedCommunities, DeletedSubgraph, GraphStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

/// Outcome of indexing one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    /// Document id.
    pub document_id: String,
    /// Document version after this ingest.
    pub version: u32,
    /// Final document status.
    pub status: String,
    /// True when the content hash was unchanged and nothing ran.
    pub skipped: bool,
    /// Text units created.
    pub chunks: usize,
    /// Entities persisted across chunks.
    pub entities: usize,
    /// Relations persisted across chunks.
    pub relations: usize,
    /// Chunks that failed extraction or persistence.
    pub failed_chunks: usize,
    /// Communities at level 0 after detection.
    pub communities: usize,
    /// Communities summarized this run.
    pub summarized: usize,
    /// Auto-resolution report, when the pass ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionReport>,
    /// When the pipeline finished, RFC 3339.
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Outcome of deleting a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    /// What the deletion removed.
    pub deleted: DeletedSubgraph,
    /// Communities and entities that were touched, for invalidation.
    pub affected: AffectedCommunities,
}

/// End-to-end document ingest.
pub struct IndexingPipeline {
    store: Arc<dyn GraphStore>,
    config: GraphtogConfig,
    chunker: Chunker,
    extractor: Extractor,
    resolver: EntityResolver,
    detector: CommunityDetector,
    summarizer: CommunitySummarizer,
}

impl IndexingPipeline {
    /// Wires the pipeline components from shared collaborators.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for invalid chunking options.
    pub fn new(
        store: Arc<dyn GraphStore>,
        gateway: Arc<LlmGateway>,
        config: GraphtogConfig,
    ) -> Result<Self> {
        let chunker = Chunker::new(config.chunking)?;
        let extractor = Extractor::new(gateway.clone(), store.clone(), config.extraction);
        let resolver = EntityResolver::new(
            store.clone(),
            config.resolution.use_llm.then(|| gateway.clone()),
            config.resolution,
        );
        let detector = CommunityDetector::new(store.clone(), config.community);
        let summarizer = CommunitySummarizer::new(store.clone(), gateway);
        Ok(Self {
            store,
            config,
            chunker,
            extractor,
            resolver,
            detector,
            summarizer,
        })
    }

    /// Indexes a Markdown file from disk.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for unreadable or non-UTF-8 files; propagates
    /// storage failures.
    pub fn index_file(&self, path: impl AsRef<Path>) -> Result<IndexReport> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::InvalidInput(format!("cannot read {}: {e}", path.display())))?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().to_string());
        let id = document_id_for_path(&path.display().to_string());
        self.index_document(&id, &name, &path.display().to_string(), &bytes)
    }

    /// Indexes document content under an explicit id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for non-UTF-8 content; propagates storage
    /// failures.
    pub fn index_document(
        &self,
        document_id: &str,
        name: &str,
        file_path: &str,
        content: &[u8],
    ) -> Result<IndexReport> {
        let content_hash = hex::encode(Sha256::digest(content));
        let mut report = IndexReport {
            document_id: document_id.to_string(),
            ..IndexReport::default()
        };

        // Unchanged completed documents are a no-op; changed content drops
        // the previous subgraph and bumps the version.
        let existing = self.store.get_document(document_id)?;
        let mut version = 1;
        if let Some(existing) = existing {
            if existing.content_hash == content_hash
                && existing.status == DocumentStatus::Completed
            {
                tracing::info!(document_id, "content unchanged, skipping re-index");
                report.version = existing.version;
                report.status = existing.status.as_str().to_string();
                report.skipped = true;
                report.finished_at = Some(chrono::Utc::now());
                return Ok(report);
            }
            self.store.delete_document_subgraph(document_id)?;
            version = existing.version + 1;
        }

        let mut document = Document::new(document_id, name, file_path, content_hash.as_str());
        document.version = version;
        let stored = self.store.upsert_document(&document)?;
        report.version = stored.version;
        self.store
            .set_document_status(document_id, DocumentStatus::Processing)?;

        // Chunk and persist text units.
        let chunks = self.chunker.chunk_bytes(content)?;
        let mut batch: Vec<(String, String)> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let unit_id = format!("tu_{}", uuid::Uuid::new_v4());
            self.store.create_text_unit(&TextUnit::new(
                unit_id.as_str(),
                document_id,
                chunk.text.as_str(),
                chunk.start_char,
                chunk.end_char,
            ))?;
            batch.push((chunk.text.clone(), unit_id));
        }
        report.chunks = batch.len();
        tracing::info!(document_id, chunks = report.chunks, "document chunked");

        // Extraction with bounded parallelism; failures isolated per chunk.
        let extraction = self.extractor.extract_batch(document_id, &batch);
        report.entities = extraction.total_entities();
        report.relations = extraction.total_relations();
        report.failed_chunks = extraction.failed_chunks();

        let status = if batch.is_empty() {
            DocumentStatus::Completed
        } else {
            extraction.document_status()
        };
        self.store.set_document_status(document_id, status)?;
        report.status = status.as_str().to_string();

        if status == DocumentStatus::Failed {
            tracing::warn!(document_id, "no chunk produced entities; document failed");
            report.finished_at = Some(chrono::Utc::now());
            return Ok(report);
        }

        // Optional auto-resolution.
        if self.config.resolution.enabled {
            match self.resolver.resolve_all(true) {
                Ok(resolution) => report.resolution = Some(resolution),
                Err(e) => tracing::warn!("auto-resolution pass failed: {e}"),
            }
        }

        // Community detection: incremental once a partition exists.
        let had_communities = !self.store.list_communities(Some(0))?.is_empty();
        let detection = if had_communities {
            let affected = self.store.list_affected_communities(document_id)?;
            self.detector.detect_incrementally(&affected.entities)?
        } else {
            self.detector.detect()?
        };
        report.communities = detection.communities_per_level.first().copied().unwrap_or(0);

        // Summarize new and stale communities.
        match self.summarizer.summarize_all(Some(0), false) {
            Ok(summary_report) => report.summarized = summary_report.summarized,
            Err(e) => tracing::warn!("community summarization failed: {e}"),
        }

        tracing::info!(
            document_id,
            entities = report.entities,
            relations = report.relations,
            communities = report.communities,
            "indexing complete"
        );
        report.finished_at = Some(chrono::Utc::now());
        Ok(report)
    }

    /// Deletes a document and its subgraph, reporting what to invalidate.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn delete_document(&self, document_id: &str) -> Result<DeleteReport> {
        let affected = self.store.list_affected_communities(document_id)?;
        let deleted = self.store.delete_document_subgraph(document_id)?;
        if !affected.communities.is_empty() {
            self.store.mark_communities_stale(&affected.communities)?;
        }
        Ok(DeleteReport { deleted, affected })
    }
}

/// Derives a stable document id from a file path.
#[must_use]
pub fn document_id_for_path(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    format!("doc_{}", hex::encode(&digest[..8]))
}
