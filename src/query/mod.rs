//! Query processing: classify → resolve entities → retrieve → assemble →
//! answer.
//!
//! The pipeline is a single path per query; every step appends to the
//! reasoning trace so failures surface with full context. Broad questions
//! over a large summarized corpus take the map-reduce branch: communities
//! are summarized against the query in batches (map), then the batch
//! summaries are synthesized into one answer (reduce).
//!
//! ```text
//! classify ──tog──────────────▶ ToGReasoner
//!    │
//!    ├─global (≥ threshold) ──▶ map batches ──▶ reduce ──▶ answer
//!    │
//!    └─otherwise ─▶ resolve_entities ─▶ assemble_context ─▶ answer
//! ```

use crate::config::GraphtogConfig;
use crate::llm::prompts::{build_answer_prompt, build_classification_prompt, build_map_batch_prompt, build_reduce_prompt};
use crate::llm::LlmGateway;
use crate::models::{Community, Entity, Envelope, ReasoningStep};
use crate::retrieve::QueryCategory;
use crate::storage::GraphStore;
use crate::tog::ToGReasoner;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Related entities listed per context block.
const MAX_RELATED_PER_ENTITY: usize = 5;

/// Text excerpts listed per context block.
const MAX_EXCERPTS_PER_ENTITY: usize = 3;

/// Excerpts are truncated to roughly this many characters.
const MAX_EXCERPT_CHARS: usize = 500;

/// Fallback entity limit when classification finds nothing.
const FALLBACK_TOP_ENTITIES: usize = 10;

/// Map batches may fail; past this ratio the reduce step must flag it.
const FAILED_BATCH_LIMITATION_RATIO: f64 = 0.25;

/// Capitalized-token heuristic for fallback query-entity extraction.
static CAPITALIZED_PHRASE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
    Regex::new(r"\b[A-Z][a-zA-Z0-9]*(?:\s+[A-Z][a-zA-Z0-9]*)*\b").unwrap()
});

/// Classification of an incoming query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryClassification {
    /// Classified category.
    pub category: QueryCategory,
    /// Entities the query mentions.
    pub key_entities: Vec<String>,
    /// Classifier confidence.
    pub confidence: f32,
}

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    #[serde(rename = "type", default)]
    category: String,
    #[serde(default)]
    key_entities: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct AnswerResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    citations: Vec<serde_json::Value>,
    #[serde(default)]
    confidence_score: f32,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct MapBatchResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    relevant_communities: Vec<i64>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct ReduceResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    key_insights: Vec<String>,
    #[serde(default)]
    supporting_communities: Vec<i64>,
    #[serde(default)]
    limitations: String,
    #[serde(default)]
    confidence_score: f32,
}

/// Final answer payload for a processed query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    /// The original question.
    pub query: String,
    /// Classified category label.
    pub query_type: String,
    /// Entities resolved in the graph.
    pub entities_found: Vec<String>,
    /// Assembled context handed to the model.
    pub context: String,
    /// The answer text.
    pub answer: String,
    /// Citation labels referenced by the answer.
    pub citations: Vec<String>,
    /// Answer confidence.
    pub confidence_score: f32,
    /// Map-reduce extras, present on the global path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalAnswerDetail>,
}

/// Extra detail attached by the map-reduce global path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalAnswerDetail {
    /// Communities that informed the answer.
    pub supporting_communities: Vec<i64>,
    /// Cross-community insights.
    pub key_insights: Vec<String>,
    /// Coverage caveats.
    pub limitations: String,
    /// Total communities considered.
    pub num_communities: usize,
    /// Map batches executed.
    pub num_batches: usize,
    /// Map batches that failed (their summaries were omitted).
    pub failed_batches: usize,
}

/// End-to-end query service.
pub struct QueryService {
    store: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
    config: GraphtogConfig,
}

impl QueryService {
    /// Creates a query service.
    #[must_use]
    pub fn new(store: Arc<dyn GraphStore>, gateway: Arc<LlmGateway>, config: GraphtogConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Processes a query end-to-end, returning the public envelope with the
    /// full reasoning trace attached — on success and on failure alike.
    #[must_use]
    pub fn process(&self, query: &str, document_id: Option<&str>) -> Envelope<QueryAnswer> {
        let mut steps: Vec<ReasoningStep> = Vec::new();
        match self.process_inner(query, document_id, &mut steps) {
            Ok(answer) => Envelope::success(answer).with_steps(steps),
            Err(err) => {
                steps.push(ReasoningStep::new("error", err.to_string()));
                Envelope::failure(&err).with_steps(steps)
            },
        }
    }

    /// Processes a batch of queries sequentially.
    #[must_use]
    pub fn process_batch(&self, queries: &[String]) -> Vec<Envelope<QueryAnswer>> {
        queries.iter().map(|q| self.process(q, None)).collect()
    }

    fn process_inner(
        &self,
        query: &str,
        document_id: Option<&str>,
        steps: &mut Vec<ReasoningStep>,
    ) -> Result<QueryAnswer> {
        if query.trim().is_empty() {
            return Err(Error::InvalidInput("query is empty".to_string()));
        }

        // Step 1: classify.
        let classification = self.classify(query)?;
        steps.push(ReasoningStep::new(
            "classify_query",
            format!(
                "detected '{}' query with {} key entities",
                classification.category.as_str(),
                classification.key_entities.len()
            ),
        ));

        // Multi-hop questions go to the ToG reasoner.
        if classification.category == QueryCategory::Tog {
            return self.answer_with_tog(query, document_id, steps);
        }

        // Broad questions over a summarized corpus go to map-reduce.
        if classification.category == QueryCategory::Global && self.config.mapreduce.enabled {
            let communities = self.store.list_communities(Some(0))?;
            if communities.len() >= self.config.mapreduce.community_threshold {
                return self.process_global_mapreduce(query, &communities, steps);
            }
        }

        // Step 2: resolve entities.
        let entities = self.resolve_entities(&classification.key_entities, query, document_id, steps)?;

        // Step 3: assemble context.
        let (context, citations) = self.assemble_context(&entities)?;
        steps.push(ReasoningStep::new(
            "build_context",
            format!(
                "compiled context of {} chars from {} entities",
                context.len(),
                entities.len()
            ),
        ));

        // Step 4: answer.
        let prompt = build_answer_prompt(query, &context, &citations);
        let response: AnswerResponse = self
            .gateway
            .generate_json("generate_answer", &prompt, 0.0)?;
        steps.push(ReasoningStep::new(
            "generate_answer",
            format!("generated answer with confidence {}", response.confidence_score),
        ));
        if !response.reasoning.is_empty() {
            steps.push(ReasoningStep::new("answer_reasoning", response.reasoning));
        }

        Ok(QueryAnswer {
            query: query.to_string(),
            query_type: classification.category.as_str().to_string(),
            entities_found: entities.iter().map(|e| e.name.clone()).collect(),
            context,
            answer: response.answer,
            citations: resolve_citation_labels(&response.citations, &citations),
            confidence_score: response.confidence_score.clamp(0.0, 1.0),
            global: None,
        })
    }

    /// Classifies a query into a category plus key entities.
    ///
    /// # Errors
    ///
    /// Propagates gateway failures after the gateway's own parse retry.
    pub fn classify(&self, query: &str) -> Result<QueryClassification> {
        let prompt = build_classification_prompt(query);
        let response: ClassificationResponse =
            self.gateway.generate_json("classify_query", &prompt, 0.0)?;
        Ok(QueryClassification {
            category: QueryCategory::parse_lossy(&response.category),
            key_entities: response.key_entities,
            confidence: response.confidence.clamp(0.0, 1.0),
        })
    }

    /// Resolves key entities in the graph, with token-heuristic and
    /// top-entity fallbacks.
    fn resolve_entities(
        &self,
        key_entities: &[String],
        query: &str,
        document_id: Option<&str>,
        steps: &mut Vec<ReasoningStep>,
    ) -> Result<Vec<Entity>> {
        let mut names: Vec<String> = key_entities.to_vec();
        if names.is_empty() {
            names = extract_query_entities(query);
            steps.push(ReasoningStep::new(
                "entity_extraction_fallback",
                format!("token heuristic found {} candidates", names.len()),
            ));
        }

        let mut found: Vec<Entity> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for name in &names {
            if let Some(entity) = self.store.find_entity_by_name(name, None)? {
                if seen.insert(entity.id.as_str().to_string()) {
                    found.push(entity);
                }
            }
        }

        if found.is_empty() {
            found = self.store.top_entities(FALLBACK_TOP_ENTITIES, document_id)?;
            steps.push(ReasoningStep::new(
                "entity_lookup",
                format!("no direct matches; using {} top entities", found.len()),
            ));
        } else {
            steps.push(ReasoningStep::new(
                "entity_lookup",
                format!("resolved {} entities in the graph", found.len()),
            ));
        }

        if found.is_empty() {
            return Err(Error::not_found(
                "entity",
                document_id.map_or_else(
                    || "no entities in knowledge graph".to_string(),
                    |d| format!("no entities in knowledge graph for document {d}"),
                ),
            ));
        }
        Ok(found)
    }

    /// Assembles per-entity context blocks and the citation list.
    ///
    /// Text units deduplicate globally across blocks.
    fn assemble_context(&self, entities: &[Entity]) -> Result<(String, Vec<String>)> {
        let mut blocks: Vec<String> = Vec::new();
        let mut citations: Vec<String> = Vec::new();
        let mut used_units: HashSet<String> = HashSet::new();

        for entity in entities {
            let mut block = format!("{} ({}) — {}", entity.name, entity.kind, entity.description);
            citations.push(format!("{} ({})", entity.name, entity.kind));

            let context = self.store.entity_context(&entity.id, 1, false)?;
            if !context.related_entities.is_empty() {
                block.push_str("\nRelated:");
                for related in context.related_entities.iter().take(MAX_RELATED_PER_ENTITY) {
                    block.push_str(&format!(
                        "\n  - {} --{}--> {}",
                        entity.name, related.rel_type, related.entity.name
                    ));
                }
            }

            let units = self
                .store
                .text_units_for_entity(&entity.id, MAX_EXCERPTS_PER_ENTITY * 2)?;
            let mut excerpts = 0;
            for unit in units {
                if excerpts >= MAX_EXCERPTS_PER_ENTITY {
                    break;
                }
                if !used_units.insert(unit.id.clone()) {
                    continue;
                }
                block.push_str("\n  Excerpt: ");
                block.push_str(&truncate_chars(&unit.text, MAX_EXCERPT_CHARS));
                excerpts += 1;
            }
            blocks.push(block);
        }

        Ok((blocks.join("\n\n"), citations))
    }

    /// Delegates a multi-hop question to the ToG reasoner.
    fn answer_with_tog(
        &self,
        query: &str,
        document_id: Option<&str>,
        steps: &mut Vec<ReasoningStep>,
    ) -> Result<QueryAnswer> {
        let reasoner = ToGReasoner::new(self.store.clone(), self.gateway.clone());
        let mut tog_config = self.config.tog.clone();
        if let Some(doc) = document_id {
            tog_config.document_ids = Some(vec![doc.to_string()]);
        }
        let outcome = reasoner.process_query(query, &tog_config);
        for step in &outcome.reasoning_path {
            steps.push(ReasoningStep::new(
                format!("tog_depth_{}", step.depth),
                format!(
                    "explored {} entities over {} relations",
                    step.entities_explored.len(),
                    step.relations_selected.len()
                ),
            ));
        }
        steps.push(ReasoningStep::new(
            "tog_answer",
            format!(
                "{} with {} evidence triplets",
                outcome.sufficiency_status,
                outcome.retrieved_triplets.len()
            ),
        ));

        Ok(QueryAnswer {
            query: query.to_string(),
            query_type: "tog".to_string(),
            entities_found: outcome
                .reasoning_path
                .first()
                .map(|s| s.entities_explored.iter().map(|e| e.name.clone()).collect())
                .unwrap_or_default(),
            context: String::new(),
            answer: outcome.answer,
            citations: outcome
                .retrieved_triplets
                .iter()
                .map(|t| format!("{} {} {}", t.subject, t.relation, t.object))
                .collect(),
            confidence_score: outcome.confidence,
            global: None,
        })
    }

    /// Map-reduce global answering over community summaries.
    fn process_global_mapreduce(
        &self,
        query: &str,
        communities: &[Community],
        steps: &mut Vec<ReasoningStep>,
    ) -> Result<QueryAnswer> {
        let summarized: Vec<&Community> =
            communities.iter().filter(|c| c.summary.is_some()).collect();
        if summarized.is_empty() {
            return Err(Error::InvalidInput(
                "global answering requires community summaries; none are generated yet".to_string(),
            ));
        }
        steps.push(ReasoningStep::new(
            "global_retrieval",
            format!("retrieved {} summarized communities", summarized.len()),
        ));

        // Map phase.
        let batch_size = self.config.mapreduce.batch_size.max(1);
        let batches: Vec<&[&Community]> = summarized.chunks(batch_size).collect();
        let num_batches = batches.len();
        steps.push(ReasoningStep::new(
            "map_phase_setup",
            format!(
                "divided {} communities into {num_batches} batches",
                summarized.len()
            ),
        ));

        let mut batch_summaries: Vec<String> = Vec::new();
        let mut supporting: HashSet<i64> = HashSet::new();
        let mut failed_batches = 0_usize;
        for (index, batch) in batches.iter().enumerate() {
            let owned: Vec<Community> = batch.iter().map(|c| (*c).clone()).collect();
            let prompt = build_map_batch_prompt(query, &owned);
            match self
                .gateway
                .generate_json::<MapBatchResponse>("map_batch", &prompt, 0.0)
            {
                Ok(response) => {
                    supporting.extend(response.relevant_communities.iter().copied());
                    batch_summaries.push(format!(
                        "{} (confidence {:.2})",
                        response.summary, response.confidence
                    ));
                },
                Err(e) => {
                    tracing::warn!(batch = index + 1, "map batch failed: {e}");
                    failed_batches += 1;
                },
            }
        }
        steps.push(ReasoningStep::new(
            "map_phase_complete",
            format!(
                "generated {} batch summaries ({failed_batches} failed)",
                batch_summaries.len()
            ),
        ));
        if batch_summaries.is_empty() {
            return Err(Error::internal(
                "map_phase",
                "every map batch failed; no summaries to synthesize",
            ));
        }

        // Reduce phase.
        let prompt = build_reduce_prompt(query, &batch_summaries);
        let response: ReduceResponse = self.gateway.generate_json("reduce_phase", &prompt, 0.0)?;
        steps.push(ReasoningStep::new(
            "reduce_phase_complete",
            format!(
                "synthesized final answer with confidence {}",
                response.confidence_score
            ),
        ));

        supporting.extend(response.supporting_communities.iter().copied());
        let mut supporting: Vec<i64> = supporting.into_iter().collect();
        supporting.sort_unstable();

        #[allow(clippy::cast_precision_loss)]
        let failed_ratio = failed_batches as f64 / num_batches as f64;
        let mut limitations = response.limitations;
        if failed_ratio >= FAILED_BATCH_LIMITATION_RATIO {
            let note = format!(
                "Partial coverage: {failed_batches} of {num_batches} community batches could not be summarized."
            );
            if limitations.is_empty() {
                limitations = note;
            } else if !limitations.contains("Partial coverage") {
                limitations = format!("{limitations} {note}");
            }
        }

        Ok(QueryAnswer {
            query: query.to_string(),
            query_type: "global_mapreduce".to_string(),
            entities_found: Vec::new(),
            context: batch_summaries.join("\n"),
            answer: response.answer,
            citations: supporting.iter().map(|c| format!("community {c}")).collect(),
            confidence_score: response.confidence_score.clamp(0.0, 1.0),
            global: Some(GlobalAnswerDetail {
                supporting_communities: supporting,
                key_insights: response.key_insights,
                limitations,
                num_communities: summarized.len(),
                num_batches,
                failed_batches,
            }),
        })
    }
}

/// Maps numeric citation markers back to their labels; non-numeric values
/// pass through as strings.
fn resolve_citation_labels(raw: &[serde_json::Value], labels: &[String]) -> Vec<String> {
    raw.iter()
        .filter_map(|value| {
            if let Some(index) = value.as_u64() {
                let index = usize::try_from(index).ok()?;
                return labels.get(index.checked_sub(1)?).cloned();
            }
            value.as_str().map(ToString::to_string)
        })
        .collect()
}

/// Capitalized-phrase heuristic for fallback query-entity extraction.
#[must_use]
pub fn extract_query_entities(query: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "What", "Where", "Who", "When", "Why", "How", "Which", "Is", "Are", "Does", "Do", "The",
        "A", "An", "In", "On", "Of", "And",
    ];
    let mut out: Vec<String> = Vec::new();
    for capture in CAPITALIZED_PHRASE.find_iter(query) {
        let phrase = capture.as_str().trim();
        if phrase.is_empty() || STOPWORDS.contains(&phrase) {
            continue;
        }
        if !out.iter().any(|existing| existing == phrase) {
            out.push(phrase.to_string());
        }
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max).collect();
    format!("{truncated}...")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_query_entities() {
        let entities = extract_query_entities("Where does Alice work at Acme Corp?");
        assert!(entities.contains(&"Alice".to_string()));
        assert!(entities.contains(&"Acme Corp".to_string()));
        assert!(!entities.contains(&"Where".to_string()));
    }

    #[test]
    fn test_resolve_citation_labels() {
        let labels = vec!["Alice (PERSON)".to_string(), "Acme (ORGANIZATION)".to_string()];
        let raw = vec![
            serde_json::json!(1),
            serde_json::json!("Acme (ORGANIZATION)"),
            serde_json::json!(99),
        ];
        let resolved = resolve_citation_labels(&raw, &labels);
        assert_eq!(
            resolved,
            vec!["Alice (PERSON)".to_string(), "Acme (ORGANIZATION)".to_string()]
        );
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        let long = "x".repeat(600);
        let truncated = truncate_chars(&long, 500);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), 503);
    }
}
