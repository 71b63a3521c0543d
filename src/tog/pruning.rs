//! Pluggable pruning strategies for ToG exploration.
//!
//! At every hop the reasoner has more candidate relations and entities than
//! it can afford to expand; a [`PruningStrategy`] scores them against the
//! question so only the top few survive.
//!
//! | Variant | Quality | Cost | Network |
//! |---------|---------|------|---------|
//! | [`LlmPruning`] | highest | slowest | yes |
//! | [`Bm25Pruning`] | keyword-level | cheap | no |
//! | [`EmbeddingPruning`] | semantic | medium | embedding endpoint |
//!
//! Every variant degrades to a uniform 0.5 score when its backing service
//! fails, so the reasoner always proceeds.

use crate::llm::prompts::{build_tog_entity_prompt, build_tog_relation_prompt};
use crate::llm::LlmGateway;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Score every variant falls back to when its backend is unavailable.
pub const FALLBACK_SCORE: f32 = 0.5;

/// A relation label with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRelation {
    /// The relation label.
    pub relation: String,
    /// Relevance to the question, 0.0 to 1.0.
    pub score: f32,
    /// Why the score was assigned.
    #[serde(default)]
    pub reasoning: String,
}

/// A candidate target entity prior to scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    /// Entity name.
    pub name: String,
    /// Entity description.
    pub description: String,
    /// Entity kind label.
    pub kind: String,
    /// Extraction confidence.
    pub confidence: f32,
}

/// A candidate with its assigned score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    /// The candidate.
    pub candidate: CandidateEntity,
    /// Relevance to the question, 0.0 to 1.0.
    pub score: f32,
    /// Why the score was assigned.
    pub reasoning: String,
}

/// Context handed to a strategy alongside the question.
#[derive(Debug, Clone, Default)]
pub struct PruneContext {
    /// Names of the entities currently being explored.
    pub entities: String,
    /// Relation labels already explored in earlier hops.
    pub previous_relations: String,
    /// The relation being expanded (entity scoring only).
    pub relation: String,
}

/// Scores relations and candidate entities against a question.
///
/// Implementations never fail: backend trouble degrades to the uniform
/// [`FALLBACK_SCORE`].
pub trait PruningStrategy: Send + Sync {
    /// The strategy name.
    fn name(&self) -> &'static str;

    /// Scores relation labels, returned sorted by score descending.
    fn score_relations(
        &self,
        question: &str,
        relations: &[String],
        context: &PruneContext,
    ) -> Vec<ScoredRelation>;

    /// Scores candidate entities, returned sorted by score descending.
    fn score_entities(
        &self,
        question: &str,
        candidates: &[CandidateEntity],
        context: &PruneContext,
    ) -> Vec<ScoredCandidate>;
}

/// Which pruning strategy a ToG run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruningMethod {
    /// Prompted scoring; highest quality.
    #[default]
    Llm,
    /// In-process Okapi BM25 over labels and descriptions.
    Bm25,
    /// Cosine similarity over gateway embeddings.
    SentenceBert,
}

impl PruningMethod {
    /// Parses a method label.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Some(Self::Llm),
            "bm25" => Some(Self::Bm25),
            "sentence_bert" | "sentence-bert" | "embedding" => Some(Self::SentenceBert),
            _ => None,
        }
    }

    /// Returns the method label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Bm25 => "bm25",
            Self::SentenceBert => "sentence_bert",
        }
    }
}

/// Builds the configured strategy.
#[must_use]
pub fn create_strategy(
    method: PruningMethod,
    gateway: Arc<LlmGateway>,
    exploration_temp: f32,
) -> Box<dyn PruningStrategy> {
    match method {
        PruningMethod::Llm => Box::new(LlmPruning::new(gateway, exploration_temp)),
        PruningMethod::Bm25 => Box::new(Bm25Pruning),
        PruningMethod::SentenceBert => Box::new(EmbeddingPruning::new(gateway)),
    }
}

fn uniform_relations(relations: &[String], reason: &str) -> Vec<ScoredRelation> {
    relations
        .iter()
        .map(|r| ScoredRelation {
            relation: r.clone(),
            score: FALLBACK_SCORE,
            reasoning: reason.to_string(),
        })
        .collect()
}

fn uniform_candidates(candidates: &[CandidateEntity], reason: &str) -> Vec<ScoredCandidate> {
    candidates
        .iter()
        .map(|c| ScoredCandidate {
            candidate: c.clone(),
            score: FALLBACK_SCORE,
            reasoning: reason.to_string(),
        })
        .collect()
}

fn sort_relations(mut scored: Vec<ScoredRelation>) -> Vec<ScoredRelation> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.relation.cmp(&b.relation))
    });
    scored
}

fn sort_candidates(mut scored: Vec<ScoredCandidate>) -> Vec<ScoredCandidate> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.candidate.name.cmp(&b.candidate.name))
    });
    scored
}

// ============================================================================
// LLM pruning
// ============================================================================

#[derive(Debug, Deserialize)]
struct RelationScoresResponse {
    #[serde(default)]
    relations: Vec<ScoredRelation>,
}

#[derive(Debug, Deserialize)]
struct EntityScoreEntry {
    #[serde(alias = "entity_name", default)]
    entity: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct EntityScoresResponse {
    #[serde(default)]
    entity_scores: Vec<EntityScoreEntry>,
}

/// Prompted relevance scoring.
pub struct LlmPruning {
    gateway: Arc<LlmGateway>,
    temperature: f32,
}

impl LlmPruning {
    /// Creates an LLM pruning strategy.
    #[must_use]
    pub const fn new(gateway: Arc<LlmGateway>, temperature: f32) -> Self {
        Self {
            gateway,
            temperature,
        }
    }
}

impl PruningStrategy for LlmPruning {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn score_relations(
        &self,
        question: &str,
        relations: &[String],
        context: &PruneContext,
    ) -> Vec<ScoredRelation> {
        let prompt = build_tog_relation_prompt(
            question,
            &context.entities,
            &relations.join(", "),
            if context.previous_relations.is_empty() {
                "None"
            } else {
                &context.previous_relations
            },
        );
        match self
            .gateway
            .generate_json::<RelationScoresResponse>("tog_score_relations", &prompt, self.temperature)
        {
            Ok(response) if !response.relations.is_empty() => {
                let mut scored: Vec<ScoredRelation> = response
                    .relations
                    .into_iter()
                    .filter(|r| relations.iter().any(|known| known == &r.relation))
                    .map(|mut r| {
                        r.score = r.score.clamp(0.0, 1.0);
                        r
                    })
                    .collect();
                // Anything the model omitted still competes at the floor.
                for relation in relations {
                    if !scored.iter().any(|s| &s.relation == relation) {
                        scored.push(ScoredRelation {
                            relation: relation.clone(),
                            score: FALLBACK_SCORE,
                            reasoning: "not scored by model".to_string(),
                        });
                    }
                }
                sort_relations(scored)
            },
            Ok(_) => uniform_relations(relations, "model returned no scores"),
            Err(e) => {
                tracing::warn!("LLM relation scoring failed: {e}");
                uniform_relations(relations, "scoring unavailable")
            },
        }
    }

    fn score_entities(
        &self,
        question: &str,
        candidates: &[CandidateEntity],
        context: &PruneContext,
    ) -> Vec<ScoredCandidate> {
        let listing = candidates
            .iter()
            .map(|c| format!("- {}: {}", c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = build_tog_entity_prompt(question, &context.relation, &listing);
        match self
            .gateway
            .generate_json::<EntityScoresResponse>("tog_score_entities", &prompt, self.temperature)
        {
            Ok(response) if !response.entity_scores.is_empty() => {
                let scores: HashMap<String, (f32, String)> = response
                    .entity_scores
                    .into_iter()
                    .map(|e| (e.entity, (e.score.clamp(0.0, 1.0), e.reasoning)))
                    .collect();
                let scored = candidates
                    .iter()
                    .map(|c| {
                        let (score, reasoning) = scores.get(&c.name).cloned().unwrap_or((
                            FALLBACK_SCORE,
                            "not scored by model".to_string(),
                        ));
                        ScoredCandidate {
                            candidate: c.clone(),
                            score,
                            reasoning,
                        }
                    })
                    .collect();
                sort_candidates(scored)
            },
            Ok(_) => uniform_candidates(candidates, "model returned no scores"),
            Err(e) => {
                tracing::warn!("LLM entity scoring failed: {e}");
                uniform_candidates(candidates, "scoring unavailable")
            },
        }
    }
}

// ============================================================================
// BM25 pruning
// ============================================================================

/// In-process Okapi BM25 scoring, normalized by the max score.
pub struct Bm25Pruning;

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace('_', " ")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Okapi BM25 scores of the query against each document, max-normalized.
fn bm25_scores(query: &str, documents: &[Vec<String>]) -> Vec<f64> {
    let n = documents.len();
    if n == 0 {
        return Vec::new();
    }
    let query_terms = tokenize(query);
    #[allow(clippy::cast_precision_loss)]
    let avg_len = documents.iter().map(Vec::len).sum::<usize>() as f64 / n as f64;

    // Document frequency per query term.
    let mut df: HashMap<&str, usize> = HashMap::new();
    for term in &query_terms {
        let count = documents.iter().filter(|d| d.iter().any(|t| t == term)).count();
        df.insert(term, count);
    }

    let scores: Vec<f64> = documents
        .iter()
        .map(|doc| {
            #[allow(clippy::cast_precision_loss)]
            let doc_len = doc.len() as f64;
            query_terms
                .iter()
                .map(|term| {
                    let tf = doc.iter().filter(|t| *t == term).count();
                    if tf == 0 {
                        return 0.0;
                    }
                    #[allow(clippy::cast_precision_loss)]
                    let df_t = df.get(term.as_str()).copied().unwrap_or(0) as f64;
                    #[allow(clippy::cast_precision_loss)]
                    let n_f = n as f64;
                    let idf = ((n_f - df_t + 0.5) / (df_t + 0.5) + 1.0).ln();
                    #[allow(clippy::cast_precision_loss)]
                    let tf_f = tf as f64;
                    let denom =
                        tf_f + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len.max(1.0));
                    idf * tf_f * (BM25_K1 + 1.0) / denom
                })
                .sum()
        })
        .collect();

    let max = scores.iter().copied().fold(0.0_f64, f64::max);
    if max > 0.0 {
        scores.into_iter().map(|s| s / max).collect()
    } else {
        scores
    }
}

impl PruningStrategy for Bm25Pruning {
    fn name(&self) -> &'static str {
        "bm25"
    }

    fn score_relations(
        &self,
        question: &str,
        relations: &[String],
        _context: &PruneContext,
    ) -> Vec<ScoredRelation> {
        let documents: Vec<Vec<String>> = relations.iter().map(|r| tokenize(r)).collect();
        let scores = bm25_scores(question, &documents);
        let scored = relations
            .iter()
            .zip(scores)
            .map(|(relation, score)| ScoredRelation {
                relation: relation.clone(),
                #[allow(clippy::cast_possible_truncation)]
                score: score as f32,
                reasoning: "BM25 keyword relevance".to_string(),
            })
            .collect();
        sort_relations(scored)
    }

    fn score_entities(
        &self,
        question: &str,
        candidates: &[CandidateEntity],
        _context: &PruneContext,
    ) -> Vec<ScoredCandidate> {
        let documents: Vec<Vec<String>> = candidates
            .iter()
            .map(|c| tokenize(&format!("{} {}", c.name, c.description)))
            .collect();
        let scores = bm25_scores(question, &documents);
        let scored = candidates
            .iter()
            .zip(scores)
            .map(|(candidate, score)| ScoredCandidate {
                candidate: candidate.clone(),
                #[allow(clippy::cast_possible_truncation)]
                score: score as f32,
                reasoning: "BM25 keyword relevance".to_string(),
            })
            .collect();
        sort_candidates(scored)
    }
}

// ============================================================================
// Embedding pruning
// ============================================================================

/// Cosine-similarity scoring over gateway embeddings.
pub struct EmbeddingPruning {
    gateway: Arc<LlmGateway>,
}

impl EmbeddingPruning {
    /// Creates an embedding pruning strategy.
    #[must_use]
    pub const fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    fn similarity_to(&self, question_vec: &[f32], text: &str) -> Option<f32> {
        let vec = self.gateway.embed(text).ok()?;
        Some(cosine_similarity(question_vec, &vec))
    }
}

/// Cosine similarity of two vectors; 0.0 for mismatched or zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

impl PruningStrategy for EmbeddingPruning {
    fn name(&self) -> &'static str {
        "sentence_bert"
    }

    fn score_relations(
        &self,
        question: &str,
        relations: &[String],
        _context: &PruneContext,
    ) -> Vec<ScoredRelation> {
        let Ok(question_vec) = self.gateway.embed(question) else {
            return uniform_relations(relations, "embedding unavailable");
        };
        let scored = relations
            .iter()
            .map(|relation| {
                let readable = relation.to_lowercase().replace('_', " ");
                let score = self
                    .similarity_to(&question_vec, &readable)
                    .map_or(FALLBACK_SCORE, |s| s.max(0.0));
                ScoredRelation {
                    relation: relation.clone(),
                    score,
                    reasoning: "embedding cosine similarity".to_string(),
                }
            })
            .collect();
        sort_relations(scored)
    }

    fn score_entities(
        &self,
        question: &str,
        candidates: &[CandidateEntity],
        _context: &PruneContext,
    ) -> Vec<ScoredCandidate> {
        let Ok(question_vec) = self.gateway.embed(question) else {
            return uniform_candidates(candidates, "embedding unavailable");
        };
        let scored = candidates
            .iter()
            .map(|candidate| {
                let text = format!("{} {}", candidate.name, candidate.description);
                let score = self
                    .similarity_to(&question_vec, &text)
                    .map_or(FALLBACK_SCORE, |s| s.max(0.0));
                ScoredCandidate {
                    candidate: candidate.clone(),
                    score,
                    reasoning: "embedding cosine similarity".to_string(),
                }
            })
            .collect();
        sort_candidates(scored)
    }
}
