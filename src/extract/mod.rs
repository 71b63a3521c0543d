//! Joint entity/relationship extraction.
//!
//! For each chunk the extractor sends one joint prompt (see
//! [`crate::llm::prompts::build_extraction_prompt`]) and parses the
//! delimited record stream it gets back:
//!
//! ```text
//! ("entity"|||ALICE|||PERSON|||Alice works at Acme)
//! ("relationship"|||ALICE|||ACME|||Alice is employed by Acme|||9)
//! <COMPLETE>
//! ```
//!
//! A response that does not end with the completion marker triggers the
//! two-pass continuation: the gate prompt asks whether records were missed,
//! and up to `two_pass_max_iterations` continuation rounds recover them.
//!
//! Batch extraction fans chunks out over bounded worker threads. A failure
//! on one chunk never poisons the rest; the document-level outcome is
//! derived afterwards.

use crate::config::ExtractionConfig;
use crate::llm::prompts::{
    COMPLETION_MARKER, EXTRACTION_LOOP_PROMPT, TUPLE_DELIMITER, build_extraction_continue_prompt,
    build_extraction_prompt,
};
use crate::llm::LlmGateway;
use crate::models::{DocumentStatus, EntityId, EntityKind, Relation, RelationType, normalize_name};
use crate::storage::GraphStore;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Temperature for extraction calls. Low for repeatability.
const EXTRACTION_TEMPERATURE: f32 = 0.1;

/// Confidence assigned to extracted entities (the prompt does not score them).
const DEFAULT_ENTITY_CONFIDENCE: f32 = 0.8;

/// An entity record parsed from the extraction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntity {
    /// Entity name as emitted (typically capitalized).
    pub name: String,
    /// Parsed entity kind; unknown labels collapse to `Other`.
    pub kind: EntityKind,
    /// Description of the entity grounded in the chunk.
    pub description: String,
}

/// A relationship record parsed from the extraction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRelation {
    /// Source entity name.
    pub source: String,
    /// Target entity name.
    pub target: String,
    /// Why the entities are related.
    pub description: String,
    /// Strength 1-10 as emitted; defaults to 5 when absent or malformed.
    pub strength: u8,
}

/// Everything extracted from one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkExtraction {
    /// Deduplicated entity records.
    pub entities: Vec<ExtractedEntity>,
    /// Deduplicated relationship records.
    pub relations: Vec<ExtractedRelation>,
    /// Whether the stream ended with the completion marker.
    pub complete: bool,
}

/// Parses the delimited record stream of an extraction response.
#[must_use]
pub fn parse_extraction_records(response: &str) -> ChunkExtraction {
    let mut out = ChunkExtraction {
        complete: response.contains(COMPLETION_MARKER),
        ..ChunkExtraction::default()
    };
    let mut seen_entities: HashMap<String, usize> = HashMap::new();
    let mut seen_relations: HashMap<(String, String), usize> = HashMap::new();

    for line in response.lines() {
        let line = line.trim();
        if line.is_empty() || line == COMPLETION_MARKER {
            continue;
        }
        let record = line
            .trim_start_matches('(')
            .trim_end_matches(')')
            .trim_end_matches(COMPLETION_MARKER);
        let fields: Vec<&str> = record.split(TUPLE_DELIMITER).map(str::trim).collect();
        if fields.len() < 2 {
            continue;
        }
        let tag = fields[0].trim_matches('"').to_lowercase();

        match tag.as_str() {
            "entity" if fields.len() >= 4 => {
                let name = fields[1].trim_matches('"').to_string();
                if name.is_empty() {
                    continue;
                }
                let entity = ExtractedEntity {
                    kind: EntityKind::parse_lossy(fields[2].trim_matches('"')),
                    description: fields[3].trim_matches('"').to_string(),
                    name,
                };
                let key = normalize_name(&entity.name);
                if let Some(&idx) = seen_entities.get(&key) {
                    // Keep the longer description on repeats.
                    if entity.description.len() > out.entities[idx].description.len() {
                        out.entities[idx].description = entity.description;
                    }
                } else {
                    seen_entities.insert(key, out.entities.len());
                    out.entities.push(entity);
                }
            },
            "relationship" if fields.len() >= 4 => {
                let source = fields[1].trim_matches('"').to_string();
                let target = fields[2].trim_matches('"').to_string();
                if source.is_empty() || target.is_empty() {
                    continue;
                }
                let strength = fields
                    .get(4)
                    .and_then(|s| s.trim_matches('"').parse::<u8>().ok())
                    .unwrap_or(5)
                    .clamp(1, 10);
                let relation = ExtractedRelation {
                    description: fields[3].trim_matches('"').to_string(),
                    strength,
                    source,
                    target,
                };
                let key = (
                    normalize_name(&relation.source),
                    normalize_name(&relation.target),
                );
                if let Some(&idx) = seen_relations.get(&key) {
                    if relation.strength > out.relations[idx].strength {
                        out.relations[idx] = relation;
                    }
                } else {
                    seen_relations.insert(key, out.relations.len());
                    out.relations.push(relation);
                }
            },
            _ => {},
        }
    }
    out
}

/// Persisted counts for one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Entities upserted.
    pub entities: usize,
    /// Relations upserted.
    pub relations: usize,
    /// Relations dropped because an endpoint could not be resolved.
    pub dropped_relations: usize,
}

/// Outcome status of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The chunk produced at least one entity.
    Completed(ChunkStats),
    /// The chunk parsed cleanly but contained nothing extractable.
    CompletedEmpty,
    /// Extraction or persistence failed; the message explains why.
    Failed(String),
}

/// Batch extraction result across a document's chunks.
#[derive(Debug, Clone, Default)]
pub struct DocumentExtraction {
    /// Per-chunk outcomes, in input order.
    pub chunks: Vec<(String, ChunkOutcome)>,
}

impl DocumentExtraction {
    /// Total entities persisted.
    #[must_use]
    pub fn total_entities(&self) -> usize {
        self.chunks
            .iter()
            .map(|(_, o)| match o {
                ChunkOutcome::Completed(stats) => stats.entities,
                _ => 0,
            })
            .sum()
    }

    /// Total relations persisted.
    #[must_use]
    pub fn total_relations(&self) -> usize {
        self.chunks
            .iter()
            .map(|(_, o)| match o {
                ChunkOutcome::Completed(stats) => stats.relations,
                _ => 0,
            })
            .sum()
    }

    /// Number of failed chunks.
    #[must_use]
    pub fn failed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|(_, o)| matches!(o, ChunkOutcome::Failed(_)))
            .count()
    }

    /// Derives the document status: completed when at least one chunk
    /// produced an entity, failed otherwise.
    #[must_use]
    pub fn document_status(&self) -> DocumentStatus {
        if self.total_entities() > 0 {
            DocumentStatus::Completed
        } else {
            DocumentStatus::Failed
        }
    }
}

/// LLM-driven joint entity/relationship extractor.
pub struct Extractor {
    gateway: Arc<LlmGateway>,
    store: Arc<dyn GraphStore>,
    config: ExtractionConfig,
}

impl Extractor {
    /// Creates an extractor.
    #[must_use]
    pub fn new(
        gateway: Arc<LlmGateway>,
        store: Arc<dyn GraphStore>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            config,
        }
    }

    /// Extracts records from one chunk of text, running the two-pass
    /// continuation when the first response looks truncated.
    ///
    /// # Errors
    ///
    /// Propagates gateway failures; parse problems degrade to an empty
    /// extraction rather than erroring.
    pub fn extract_chunk(&self, chunk_text: &str) -> Result<ChunkExtraction> {
        let prompt = build_extraction_prompt(chunk_text);
        let response = self.gateway.complete(&prompt, EXTRACTION_TEMPERATURE)?;
        let mut extraction = parse_extraction_records(&response);

        let mut passes = 0;
        while passes < self.config.two_pass_max_iterations
            && self.should_continue(&prompt, &response, &extraction)?
        {
            passes += 1;
            tracing::debug!(pass = passes, "running extraction continuation pass");
            let continue_prompt = format!(
                "{prompt}\n{response}\n\n{}",
                build_extraction_continue_prompt()
            );
            let more = self.gateway.complete(&continue_prompt, EXTRACTION_TEMPERATURE)?;
            let additional = parse_extraction_records(&more);
            merge_extractions(&mut extraction, additional);
        }

        Ok(extraction)
    }

    /// Decides whether a continuation pass is worthwhile: a missing
    /// completion marker always continues, otherwise the Y/N gate decides.
    fn should_continue(
        &self,
        prompt: &str,
        response: &str,
        extraction: &ChunkExtraction,
    ) -> Result<bool> {
        if extraction.entities.is_empty() {
            return Ok(false);
        }
        if !extraction.complete {
            return Ok(true);
        }
        let gate = format!("{prompt}\n{response}\n\n{EXTRACTION_LOOP_PROMPT}");
        let verdict = self.gateway.complete(&gate, 0.0)?;
        Ok(verdict.trim().to_uppercase().starts_with('Y'))
    }

    /// Persists one chunk's extraction: upserts entities, grounds them with
    /// MENTIONED_IN links, and upserts relations whose endpoints resolve.
    ///
    /// # Errors
    ///
    /// Propagates storage failures. Unresolvable relation endpoints are
    /// dropped and logged, not errors.
    pub fn persist_chunk(
        &self,
        document_id: &str,
        chunk_id: &str,
        extraction: &ChunkExtraction,
    ) -> Result<ChunkStats> {
        let mut stats = ChunkStats::default();
        let mut name_to_id: HashMap<String, EntityId> = HashMap::new();

        for entity in &extraction.entities {
            let id = match self.store.upsert_entity(
                &entity.name,
                entity.kind,
                &entity.description,
                DEFAULT_ENTITY_CONFIDENCE,
                Some(document_id),
            ) {
                Ok(id) => id,
                // A constraint race means another worker created the node
                // between our read and write; re-read and continue.
                Err(Error::GraphConstraint { .. }) => {
                    match self.store.find_entity_by_name(&entity.name, Some(entity.kind))? {
                        Some(existing) => existing.id,
                        None => continue,
                    }
                },
                Err(e) => return Err(e),
            };
            self.store.link_mention(&id, chunk_id)?;
            name_to_id.insert(normalize_name(&entity.name), id);
            stats.entities += 1;
        }

        for relation in &extraction.relations {
            let source = self.resolve_endpoint(&name_to_id, &relation.source)?;
            let target = self.resolve_endpoint(&name_to_id, &relation.target)?;
            let (Some(source), Some(target)) = (source, target) else {
                tracing::warn!(
                    source = relation.source,
                    target = relation.target,
                    "dropping relation with unresolvable endpoint"
                );
                stats.dropped_relations += 1;
                continue;
            };
            let edge = Relation::new(source, target, RelationType::new("RELATED_TO"))
                .with_description(relation.description.clone())
                .with_strength(relation.strength);
            // The semantic label is derived from the description where one
            // stands out; RELATED_TO is the open-vocabulary default.
            let edge = match derive_relation_label(&relation.description) {
                Some(label) => Relation {
                    rel_type: label,
                    ..edge
                },
                None => edge,
            };
            self.store.upsert_relation(&edge)?;
            stats.relations += 1;
        }

        Ok(stats)
    }

    /// Resolves a relation endpoint by chunk-local name, falling back to the
    /// graph (kind unrestricted: the extractor may have typed it OTHER).
    fn resolve_endpoint(
        &self,
        local: &HashMap<String, EntityId>,
        name: &str,
    ) -> Result<Option<EntityId>> {
        if let Some(id) = local.get(&normalize_name(name)) {
            return Ok(Some(id.clone()));
        }
        Ok(self.store.find_entity_by_name(name, None)?.map(|e| e.id))
    }

    /// Extracts and persists a batch of `(chunk_text, chunk_id)` pairs with
    /// bounded parallelism. Per-chunk failures are isolated.
    #[must_use]
    pub fn extract_batch(&self, document_id: &str, chunks: &[(String, String)]) -> DocumentExtraction {
        if chunks.is_empty() {
            return DocumentExtraction::default();
        }

        let workers = self.config.batch_parallelism.clamp(1, chunks.len());
        let next = AtomicUsize::new(0);
        let outcomes: Mutex<Vec<Option<(String, ChunkOutcome)>>> =
            Mutex::new(vec![None; chunks.len()]);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some((chunk_text, chunk_id)) = chunks.get(index) else {
                            break;
                        };
                        let outcome = self.process_one(document_id, chunk_text, chunk_id);
                        if let Ok(mut slots) = outcomes.lock() {
                            slots[index] = Some((chunk_id.clone(), outcome));
                        }
                    }
                });
            }
        });

        let chunks = outcomes
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect();
        DocumentExtraction { chunks }
    }

    fn process_one(&self, document_id: &str, chunk_text: &str, chunk_id: &str) -> ChunkOutcome {
        match self.extract_chunk(chunk_text) {
            Ok(extraction) if extraction.entities.is_empty() => ChunkOutcome::CompletedEmpty,
            Ok(extraction) => match self.persist_chunk(document_id, chunk_id, &extraction) {
                Ok(stats) => ChunkOutcome::Completed(stats),
                Err(e) => {
                    tracing::warn!(chunk_id, "chunk persistence failed: {e}");
                    ChunkOutcome::Failed(e.to_string())
                },
            },
            Err(e) => {
                tracing::warn!(chunk_id, "chunk extraction failed: {e}");
                ChunkOutcome::Failed(e.to_string())
            },
        }
    }
}

/// Merges a continuation pass into the accumulated extraction.
fn merge_extractions(base: &mut ChunkExtraction, more: ChunkExtraction) {
    let known: Vec<String> = base.entities.iter().map(|e| normalize_name(&e.name)).collect();
    for entity in more.entities {
        if !known.contains(&normalize_name(&entity.name)) {
            base.entities.push(entity);
        }
    }
    let known_rel: Vec<(String, String)> = base
        .relations
        .iter()
        .map(|r| (normalize_name(&r.source), normalize_name(&r.target)))
        .collect();
    for relation in more.relations {
        let key = (normalize_name(&relation.source), normalize_name(&relation.target));
        if !known_rel.contains(&key) {
            base.relations.push(relation);
        }
    }
    base.complete = base.complete || more.complete;
}

/// Picks an uppercase relation label out of a description when a strong
/// verb phrase is present; otherwise the caller keeps `RELATED_TO`.
fn derive_relation_label(description: &str) -> Option<RelationType> {
    const PHRASES: &[(&str, &str)] = &[
        ("works at", "WORKS_AT"),
        ("works for", "WORKS_AT"),
        ("employed by", "WORKS_AT"),
        ("located in", "LOCATED_IN"),
        ("based in", "LOCATED_IN"),
        ("headquartered in", "LOCATED_IN"),
        ("owns", "OWNS"),
        ("owned by", "OWNED_BY"),
        ("founded", "FOUNDED"),
        ("leads", "LEADS"),
        ("part of", "PART_OF_ORG"),
        ("member of", "MEMBER_OF"),
        ("produces", "PRODUCES"),
        ("created", "CREATED"),
    ];
    let lower = description.to_lowercase();
    PHRASES
        .iter()
        .find(|(phrase, _)| lower.contains(phrase))
        .map(|(_, label)| RelationType::new(*label))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"("entity"|||ALICE|||PERSON|||Alice works at Acme Corp)
("entity"|||ACME CORP|||ORGANIZATION|||Acme Corp employs Alice)
("relationship"|||ALICE|||ACME CORP|||Alice works at Acme Corp|||9)
<COMPLETE>"#;

    #[test]
    fn test_parse_records() {
        let extraction = parse_extraction_records(SAMPLE);
        assert!(extraction.complete);
        assert_eq!(extraction.entities.len(), 2);
        assert_eq!(extraction.relations.len(), 1);
        assert_eq!(extraction.entities[0].name, "ALICE");
        assert_eq!(extraction.entities[0].kind, EntityKind::Person);
        assert_eq!(extraction.relations[0].strength, 9);
    }

    #[test]
    fn test_parse_deduplicates_entities() {
        let response = r#"("entity"|||ACME|||ORGANIZATION|||short)
("entity"|||Acme|||ORGANIZATION|||a much longer description of Acme)
<COMPLETE>"#;
        let extraction = parse_extraction_records(response);
        assert_eq!(extraction.entities.len(), 1);
        assert!(extraction.entities[0].description.starts_with("a much longer"));
    }

    #[test]
    fn test_parse_tolerates_garbage_lines() {
        let response = "Sure, here are the records:\n(\"entity\"|||X|||CONCEPT|||thing)\nnot a record\n";
        let extraction = parse_extraction_records(response);
        assert_eq!(extraction.entities.len(), 1);
        assert!(!extraction.complete);
    }

    #[test]
    fn test_parse_unknown_kind_becomes_other() {
        let response = r#"("entity"|||GADGET|||WIDGET|||a gadget)"#;
        let extraction = parse_extraction_records(response);
        assert_eq!(extraction.entities[0].kind, EntityKind::Other);
    }

    #[test]
    fn test_parse_malformed_strength_defaults() {
        let response = r#"("relationship"|||A|||B|||linked|||very)"#;
        let extraction = parse_extraction_records(response);
        assert_eq!(extraction.relations[0].strength, 5);
    }

    #[test]
    fn test_derive_relation_label() {
        assert_eq!(
            derive_relation_label("Alice works at Acme").map(|l| l.as_str().to_string()),
            Some("WORKS_AT".to_string())
        );
        assert_eq!(
            derive_relation_label("Acme is based in Paris").map(|l| l.as_str().to_string()),
            Some("LOCATED_IN".to_string())
        );
        assert!(derive_relation_label("somehow connected").is_none());
    }

    #[test]
    fn test_merge_extractions_dedups() {
        let mut base = parse_extraction_records(SAMPLE);
        let more = parse_extraction_records(
            r#"("entity"|||ALICE|||PERSON|||dup)
("entity"|||PARIS|||GEO|||a city)
<COMPLETE>"#,
        );
        merge_extractions(&mut base, more);
        assert_eq!(base.entities.len(), 3);
    }

    #[test]
    fn test_document_status_derivation() {
        let extraction = DocumentExtraction {
            chunks: vec![
                ("c1".to_string(), ChunkOutcome::CompletedEmpty),
                (
                    "c2".to_string(),
                    ChunkOutcome::Completed(ChunkStats {
                        entities: 2,
                        relations: 1,
                        dropped_relations: 0,
                    }),
                ),
                ("c3".to_string(), ChunkOutcome::Failed("boom".to_string())),
            ],
        };
        assert_eq!(extraction.document_status(), DocumentStatus::Completed);
        assert_eq!(extraction.failed_chunks(), 1);

        let empty = DocumentExtraction {
            chunks: vec![("c1".to_string(), ChunkOutcome::CompletedEmpty)],
        };
        assert_eq!(empty.document_status(), DocumentStatus::Failed);
    }
}
