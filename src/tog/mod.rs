//! Tree-of-Graphs (ToG) reasoning: iterative multi-hop graph traversal
//! with guided pruning.
//!
//! A ToG query runs a bounded state machine over the knowledge graph:
//!
//! ```text
//! EXTRACT_TOPIC ──none──▶ FALLBACK_FUZZY
//!       │
//!       ▼
//! EXPLORE_RELATIONS (depth d)        prune to search_width
//!       │
//!       ▼
//! EXPAND_ENTITIES                    prune to best per relation,
//!       │                            retain num_retain_entity
//!       ▼
//! SUFFICIENCY_CHECK? ──yes──▶ GENERATE_ANSWER
//!       │no
//!       ▼
//! CYCLE_CHECK ──cycle──▶ END (insufficient)
//!       │
//!       ▼
//! d += 1, bounded by search_depth
//! ```
//!
//! Termination is guaranteed: depth is bounded, relation types deduplicate
//! across hops, and the cycle check catches frontier echo. The triplet set
//! only grows within a query, and with BM25 or embedding pruning at zero
//! reasoning temperature the whole path is deterministic for a fixed graph.
//!
//! Any uncaught failure degrades to a fuzzy-matched one-step fallback with
//! diagnostic confidence 0.1 rather than propagating.

pub mod pruning;

pub use pruning::{
    Bm25Pruning, CandidateEntity, EmbeddingPruning, LlmPruning, PruneContext, PruningMethod,
    PruningStrategy, ScoredCandidate, ScoredRelation, create_strategy,
};

use crate::llm::prompts::{build_tog_answer_prompt, build_tog_sufficiency_prompt, build_tog_topic_prompt};
use crate::llm::LlmGateway;
use crate::models::{Entity, EntityId, RelationType, Triplet, normalize_name};
use crate::resolve::name_similarity;
use crate::storage::GraphStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Topic entities requested from the LLM.
const MAX_TOPIC_ENTITIES: usize = 5;

/// Entity names offered to the topic-extraction prompt.
const TOPIC_SAMPLE_SIZE: usize = 100;

/// Entities fetched from the graph as the available pool.
const AVAILABLE_ENTITY_LIMIT: usize = 1000;

/// Temperature for topic extraction; low for precision.
const TOPIC_TEMPERATURE: f32 = 0.2;

/// Similarity floor when validating LLM-proposed topic entities.
const TOPIC_FUZZY_THRESHOLD: f64 = 0.8;

/// Similarity floor when matching question tokens to entity names.
const QUESTION_FUZZY_THRESHOLD: f64 = 0.6;

/// Top-k for the question-token fallback.
const QUESTION_FUZZY_TOP_K: usize = 3;

/// Confidence floor for relations considered during exploration.
const RELATION_CONFIDENCE_FLOOR: f32 = 0.3;

/// Candidate targets fetched per selected relation.
const EXPANSION_CANDIDATE_LIMIT: usize = 20;

/// Frontier overlap ratio that counts as a cycle.
const CYCLE_OVERLAP_RATIO: f64 = 0.8;

/// Confidence reported by the diagnostic fallback path.
const FALLBACK_CONFIDENCE: f32 = 0.1;

/// ToG reasoner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToGConfig {
    /// Relations explored per step.
    pub search_width: usize,
    /// Maximum hops, 1 to 5.
    pub search_depth: u32,
    /// Entities carried to the next hop.
    pub num_retain_entity: usize,
    /// LLM temperature during exploration scoring.
    pub exploration_temp: f32,
    /// LLM temperature for the final answer.
    pub reasoning_temp: f32,
    /// Pruning strategy.
    pub pruning_method: PruningMethod,
    /// Whether the sufficiency gate may short-circuit exploration.
    pub enable_sufficiency_check: bool,
    /// Optional document scope filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<String>>,
}

impl Default for ToGConfig {
    fn default() -> Self {
        Self {
            search_width: 3,
            search_depth: 3,
            num_retain_entity: 5,
            exploration_temp: 0.4,
            reasoning_temp: 0.0,
            pruning_method: PruningMethod::Llm,
            enable_sufficiency_check: true,
            document_ids: None,
        }
    }
}

impl ToGConfig {
    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        let parse = |name: &str| std::env::var(name).ok();
        if let Some(v) = parse("GRAPHTOG_TOG_SEARCH_WIDTH").and_then(|v| v.parse().ok()) {
            self.search_width = v;
        }
        if let Some(v) = parse("GRAPHTOG_TOG_SEARCH_DEPTH").and_then(|v| v.parse().ok()) {
            self.search_depth = v;
        }
        if let Some(v) = parse("GRAPHTOG_TOG_NUM_RETAIN_ENTITY").and_then(|v| v.parse().ok()) {
            self.num_retain_entity = v;
        }
        if let Some(v) = parse("GRAPHTOG_TOG_EXPLORATION_TEMP").and_then(|v| v.parse().ok()) {
            self.exploration_temp = v;
        }
        if let Some(v) = parse("GRAPHTOG_TOG_REASONING_TEMP").and_then(|v| v.parse().ok()) {
            self.reasoning_temp = v;
        }
        if let Some(v) = parse("GRAPHTOG_TOG_PRUNING_METHOD").and_then(|v| PruningMethod::parse(&v))
        {
            self.pruning_method = v;
        }
        if let Some(v) = parse("GRAPHTOG_TOG_SUFFICIENCY_CHECK") {
            self.enable_sufficiency_check = v.eq_ignore_ascii_case("true") || v == "1";
        }
        self
    }

    /// Validates option ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for out-of-range options.
    pub fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.search_depth) {
            return Err(Error::InvalidInput(format!(
                "tog.search_depth must be between 1 and 5, got {}",
                self.search_depth
            )));
        }
        if self.search_width == 0 {
            return Err(Error::InvalidInput(
                "tog.search_width must be positive".to_string(),
            ));
        }
        if self.num_retain_entity == 0 {
            return Err(Error::InvalidInput(
                "tog.num_retain_entity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a ToG run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SufficiencyStatus {
    /// The gate judged the evidence sufficient.
    Sufficient,
    /// Exploration exhausted without sufficiency (or a cycle ended it).
    Insufficient,
    /// The gate was disabled; no judgement was made.
    Unknown,
}

impl fmt::Display for SufficiencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Sufficient => "sufficient",
            Self::Insufficient => "insufficient",
            Self::Unknown => "unknown",
        };
        write!(f, "{label}")
    }
}

/// Snapshot of an entity as explored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToGEntity {
    /// Entity id.
    pub id: EntityId,
    /// Entity name.
    pub name: String,
    /// Entity kind label.
    pub kind: String,
    /// Description.
    pub description: String,
    /// Extraction confidence.
    pub confidence: f32,
}

impl From<&Entity> for ToGEntity {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            kind: entity.kind.as_str().to_string(),
            description: entity.description.clone(),
            confidence: entity.confidence,
        }
    }
}

/// A relation selected for expansion at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedRelation {
    /// Relation label.
    pub rel_type: String,
    /// Entity that drove the hop, matching the recorded triplet's subject.
    /// Falls back to the frontier head when no target was found.
    pub source: String,
    /// Pruning score.
    pub score: f32,
    /// Pruning reasoning.
    pub reasoning: String,
}

/// One step of the reasoning path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToGStep {
    /// Depth, 1-based.
    pub depth: u32,
    /// Entities explored at this depth.
    pub entities_explored: Vec<ToGEntity>,
    /// Relations selected for expansion.
    pub relations_selected: Vec<SelectedRelation>,
    /// Sufficiency gate score, when the gate ran.
    pub sufficiency_score: Option<f32>,
    /// Gate reasoning or step notes.
    pub notes: Option<String>,
}

/// Complete outcome of a ToG query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToGOutcome {
    /// Final answer text.
    pub answer: String,
    /// Answer confidence.
    pub confidence: f32,
    /// How the run ended.
    pub sufficiency_status: SufficiencyStatus,
    /// Steps, in depth order.
    pub reasoning_path: Vec<ToGStep>,
    /// Deduplicated evidence triplets, in discovery order.
    pub retrieved_triplets: Vec<Triplet>,
    /// Model summary of the reasoning, when provided.
    pub reasoning_summary: String,
}

#[derive(Debug, Deserialize)]
struct TopicResponse {
    #[serde(default)]
    topic_entities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SufficiencyResponse {
    #[serde(default)]
    sufficient: bool,
    #[serde(default)]
    confidence_score: f32,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct FinalAnswerResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning_summary: String,
}

/// A pruned relation choice prior to expansion.
struct RelationChoice {
    rel_type: RelationType,
    score: f32,
    reasoning: String,
}

/// Per-query traversal state.
#[derive(Default)]
struct TraversalState {
    explored_entities: HashSet<EntityId>,
    explored_relations: HashSet<RelationType>,
    steps: Vec<ToGStep>,
    triplets: Vec<Triplet>,
    triplet_set: HashSet<Triplet>,
}

impl TraversalState {
    /// Adds a triplet; the set only ever grows.
    fn add_triplet(&mut self, triplet: Triplet) {
        if self.triplet_set.insert(triplet.clone()) {
            self.triplets.push(triplet);
        }
    }
}

/// Iterative multi-hop graph reasoner.
pub struct ToGReasoner {
    store: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
}

impl ToGReasoner {
    /// Creates a reasoner.
    #[must_use]
    pub const fn new(store: Arc<dyn GraphStore>, gateway: Arc<LlmGateway>) -> Self {
        Self { store, gateway }
    }

    /// Answers a question by traversing the graph. Never fails: errors
    /// degrade to the diagnostic fallback path.
    #[must_use]
    pub fn process_query(&self, question: &str, config: &ToGConfig) -> ToGOutcome {
        tracing::info!(question, "starting ToG reasoning");
        match self.process_query_inner(question, config) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("ToG reasoning failed, using fallback: {e}");
                self.fallback_reasoning(question, config)
            },
        }
    }

    fn process_query_inner(&self, question: &str, config: &ToGConfig) -> Result<ToGOutcome> {
        config.validate()?;
        let strategy = create_strategy(
            config.pruning_method,
            self.gateway.clone(),
            config.exploration_temp,
        );
        let mut state = TraversalState::default();

        // Phase 1: topic entities.
        let topic_names = self.extract_topic_entities(question, config.document_ids.as_deref())?;
        if topic_names.is_empty() {
            return Err(Error::not_found("entity", "no topic entities match the graph"));
        }
        let mut current: Vec<Entity> = Vec::new();
        for name in &topic_names {
            if let Some(entity) = self.store.find_entity_by_name(name, None)? {
                if state.explored_entities.insert(entity.id.clone()) {
                    current.push(entity);
                }
            }
        }
        if current.is_empty() {
            return Err(Error::not_found("entity", "topic entities missing from graph"));
        }

        // Phase 2: iterative exploration.
        let mut status = if config.enable_sufficiency_check {
            SufficiencyStatus::Insufficient
        } else {
            SufficiencyStatus::Unknown
        };

        for depth in 1..=config.search_depth {
            tracing::debug!(depth, max = config.search_depth, "exploring depth");
            let choices =
                self.explore_relations(question, &current, config, strategy.as_ref(), &mut state)?;

            if choices.is_empty() {
                state.steps.push(ToGStep {
                    depth,
                    entities_explored: current.iter().map(ToGEntity::from).collect(),
                    relations_selected: Vec::new(),
                    sufficiency_score: None,
                    notes: Some("no unexplored relations at this depth".to_string()),
                });
                break;
            }

            // Expand each selected relation to its best target; the hops
            // report which frontier entity actually drove them.
            let (next, selected) = self.expand_entities(
                question,
                &current,
                &choices,
                depth,
                config,
                strategy.as_ref(),
                &mut state,
            )?;

            let mut step = ToGStep {
                depth,
                entities_explored: current.iter().map(ToGEntity::from).collect(),
                relations_selected: selected,
                sufficiency_score: None,
                notes: None,
            };

            // Sufficiency gate.
            if config.enable_sufficiency_check {
                let verdict = self.check_sufficiency(question, &step, config);
                step.sufficiency_score = Some(verdict.confidence_score);
                if !verdict.reasoning.is_empty() {
                    step.notes = Some(verdict.reasoning);
                }
                if verdict.sufficient {
                    tracing::info!(depth, "sufficiency reached");
                    status = SufficiencyStatus::Sufficient;
                    state.steps.push(step);
                    break;
                }
            }

            // Cycle check against the previous frontier.
            if detect_cycle(&current, &next) {
                tracing::warn!(depth, "cycle detected, stopping exploration");
                step.notes = Some("cycle detected".to_string());
                state.steps.push(step);
                status = SufficiencyStatus::Insufficient;
                break;
            }

            state.steps.push(step);
            if next.is_empty() {
                break;
            }
            current = next;
        }

        // Phase 3: final answer.
        let (answer, confidence, reasoning_summary) =
            self.generate_final_answer(question, &state, config)?;

        Ok(ToGOutcome {
            answer,
            confidence,
            sufficiency_status: status,
            reasoning_path: state.steps,
            retrieved_triplets: state.triplets,
            reasoning_summary,
        })
    }

    /// EXTRACT_TOPIC: LLM selection over the available-entity pool, with
    /// fuzzy validation and a question-token fallback.
    fn extract_topic_entities(
        &self,
        question: &str,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<String>> {
        let available = self.available_entities(document_ids)?;
        if available.is_empty() {
            return Ok(Vec::new());
        }

        let sample = available
            .iter()
            .take(TOPIC_SAMPLE_SIZE)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = build_tog_topic_prompt(question, &sample);

        let proposed = match self
            .gateway
            .generate_json::<TopicResponse>("tog_topic_entities", &prompt, TOPIC_TEMPERATURE)
        {
            Ok(response) => response.topic_entities,
            Err(e) => {
                tracing::warn!("topic extraction call failed: {e}");
                Vec::new()
            },
        };

        // Validate against the graph; fuzzy-match near misses.
        let mut validated: Vec<String> = Vec::new();
        for name in proposed.into_iter().take(MAX_TOPIC_ENTITIES) {
            let direct = available
                .iter()
                .find(|a| normalize_name(a) == normalize_name(&name));
            if let Some(hit) = direct {
                if !validated.contains(hit) {
                    validated.push(hit.clone());
                }
            } else if let Some(hit) = fuzzy_match(&name, &available, TOPIC_FUZZY_THRESHOLD) {
                if !validated.contains(&hit) {
                    validated.push(hit);
                }
            }
        }

        if validated.is_empty() {
            validated = fuzzy_match_from_question(question, &available);
        }
        tracing::info!(?validated, "topic entities");
        Ok(validated)
    }

    /// The entity-name pool, most-mentioned first, optionally scoped to
    /// documents.
    fn available_entities(&self, document_ids: Option<&[String]>) -> Result<Vec<String>> {
        match document_ids {
            None => Ok(self
                .store
                .top_entities(AVAILABLE_ENTITY_LIMIT, None)?
                .into_iter()
                .map(|e| e.name)
                .collect()),
            Some(docs) => {
                let mut names: Vec<String> = Vec::new();
                let mut seen: HashSet<String> = HashSet::new();
                for doc in docs {
                    for entity in self.store.top_entities(AVAILABLE_ENTITY_LIMIT, Some(doc))? {
                        if seen.insert(normalize_name(&entity.name)) {
                            names.push(entity.name);
                        }
                    }
                }
                Ok(names)
            },
        }
    }

    /// EXPLORE_RELATIONS: fetch incident relation types, dedup against
    /// earlier hops, prune, and keep the top `search_width`. Source
    /// attribution happens during expansion, where the driving entity is
    /// actually known.
    fn explore_relations(
        &self,
        question: &str,
        current: &[Entity],
        config: &ToGConfig,
        strategy: &dyn PruningStrategy,
        state: &mut TraversalState,
    ) -> Result<Vec<RelationChoice>> {
        let ids: Vec<EntityId> = current.iter().map(|e| e.id.clone()).collect();
        let stats = self.store.relation_types_for_entities(
            &ids,
            RELATION_CONFIDENCE_FLOOR,
            config.document_ids.as_deref(),
        )?;

        let fresh: Vec<String> = stats
            .iter()
            .filter(|s| !state.explored_relations.contains(&s.rel_type))
            .map(|s| s.rel_type.as_str().to_string())
            .collect();
        if fresh.is_empty() {
            tracing::debug!("all incident relations already explored");
            return Ok(Vec::new());
        }

        let context = PruneContext {
            entities: current
                .iter()
                .map(|e| e.name.clone())
                .collect::<Vec<_>>()
                .join(", "),
            previous_relations: state
                .explored_relations
                .iter()
                .map(|r| r.as_str().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            relation: String::new(),
        };
        let scored = strategy.score_relations(question, &fresh, &context);

        let mut selected = Vec::new();
        for entry in scored.into_iter().take(config.search_width) {
            let rel_type = RelationType::new(&entry.relation);
            state.explored_relations.insert(rel_type.clone());
            selected.push(RelationChoice {
                rel_type,
                score: entry.score,
                reasoning: entry.reasoning,
            });
        }
        tracing::debug!(
            selected = ?selected.iter().map(|r| r.rel_type.as_str()).collect::<Vec<_>>(),
            "relations selected"
        );
        Ok(selected)
    }

    /// EXPAND_ENTITIES: per selected relation, fetch candidates from each
    /// current entity, score them, and carry the best unexplored target.
    /// The entity that produced the hop is recorded on the returned
    /// [`SelectedRelation`], so the step trace and the triplet subjects
    /// stay consistent.
    #[allow(clippy::too_many_arguments)]
    fn expand_entities(
        &self,
        question: &str,
        current: &[Entity],
        choices: &[RelationChoice],
        depth: u32,
        config: &ToGConfig,
        strategy: &dyn PruningStrategy,
        state: &mut TraversalState,
    ) -> Result<(Vec<Entity>, Vec<SelectedRelation>)> {
        let mut next: Vec<Entity> = Vec::new();
        let mut selected: Vec<SelectedRelation> = Vec::new();

        for choice in choices {
            let mut hop_source: Option<String> = None;
            for source in current {
                let candidates = self.store.related_entities(
                    &source.id,
                    &choice.rel_type,
                    config.document_ids.as_deref(),
                    EXPANSION_CANDIDATE_LIMIT,
                )?;
                if candidates.is_empty() {
                    continue;
                }

                let best = if candidates.len() == 1 {
                    candidates.into_iter().next()
                } else {
                    self.pick_best_candidate(
                        question,
                        choice.rel_type.as_str(),
                        candidates,
                        strategy,
                    )
                };
                let Some((target, edge_confidence)) = best else {
                    continue;
                };

                state.add_triplet(
                    Triplet::new(
                        source.name.clone(),
                        choice.rel_type.as_str(),
                        target.name.clone(),
                    )
                    .with_confidence(edge_confidence)
                    .with_source_step(format!("depth_{depth}")),
                );
                hop_source = Some(source.name.clone());

                if state.explored_entities.insert(target.id.clone()) {
                    next.push(target);
                }
                break;
            }

            // A choice that expanded nowhere still appears in the trace,
            // attributed to the frontier head.
            selected.push(SelectedRelation {
                rel_type: choice.rel_type.as_str().to_string(),
                source: hop_source.unwrap_or_else(|| {
                    current.first().map(|e| e.name.clone()).unwrap_or_default()
                }),
                score: choice.score,
                reasoning: choice.reasoning.clone(),
            });
        }

        next.truncate(config.num_retain_entity);
        Ok((next, selected))
    }

    /// Scores candidates through the pruning strategy and returns the top
    /// one with its edge confidence.
    fn pick_best_candidate(
        &self,
        question: &str,
        relation: &str,
        candidates: Vec<(Entity, f32)>,
        strategy: &dyn PruningStrategy,
    ) -> Option<(Entity, f32)> {
        let prunable: Vec<CandidateEntity> = candidates
            .iter()
            .map(|(entity, _)| CandidateEntity {
                name: entity.name.clone(),
                description: entity.description.clone(),
                kind: entity.kind.as_str().to_string(),
                confidence: entity.confidence,
            })
            .collect();
        let context = PruneContext {
            relation: relation.to_string(),
            ..PruneContext::default()
        };
        let scored = strategy.score_entities(question, &prunable, &context);
        let winner = scored.first()?;
        candidates
            .into_iter()
            .find(|(entity, _)| entity.name == winner.candidate.name)
    }

    /// SUFFICIENCY_CHECK: the gate never fails — errors read as "not yet".
    fn check_sufficiency(
        &self,
        question: &str,
        step: &ToGStep,
        config: &ToGConfig,
    ) -> SufficiencyResponse {
        let relation_text = step
            .relations_selected
            .iter()
            .map(|r| format!("{} --[{}]--> ?", r.source, r.rel_type))
            .collect::<Vec<_>>()
            .join("; ");
        let prompt = build_tog_sufficiency_prompt(question, &relation_text);
        self.gateway
            .generate_json::<SufficiencyResponse>("tog_sufficiency", &prompt, config.reasoning_temp)
            .unwrap_or_else(|e| {
                tracing::warn!("sufficiency check failed: {e}");
                SufficiencyResponse {
                    sufficient: false,
                    confidence_score: 0.0,
                    reasoning: format!("sufficiency evaluation failed: {e}"),
                }
            })
    }

    /// GENERATE_ANSWER: summarize the path and ask for the grounded answer.
    fn generate_final_answer(
        &self,
        question: &str,
        state: &TraversalState,
        config: &ToGConfig,
    ) -> Result<(String, f32, String)> {
        if state.steps.is_empty() {
            return Ok((
                "No reasoning path is available to answer this question.".to_string(),
                0.0,
                String::new(),
            ));
        }

        let path_summary = state
            .steps
            .iter()
            .map(|step| {
                let entities: Vec<&str> = step
                    .entities_explored
                    .iter()
                    .map(|e| e.name.as_str())
                    .collect();
                let relations: Vec<String> = state
                    .triplets
                    .iter()
                    .filter(|t| t.source_step.as_deref() == Some(&format!("depth_{}", step.depth)))
                    .map(|t| format!("{}--[{}]-->{}", t.subject, t.relation, t.object))
                    .collect();
                format!(
                    "Step {}: Entities {entities:?}, Relations {relations:?}",
                    step.depth
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        let prompt = build_tog_answer_prompt(question, &path_summary);
        let response: FinalAnswerResponse =
            self.gateway
                .generate_json("tog_final_answer", &prompt, config.reasoning_temp)?;
        Ok((
            response.answer,
            response.confidence.clamp(0.0, 1.0),
            response.reasoning_summary,
        ))
    }

    /// Degraded path: up to two fuzzy-matched entities, one diagnostic
    /// step, low confidence.
    fn fallback_reasoning(&self, question: &str, config: &ToGConfig) -> ToGOutcome {
        let mut entities: Vec<ToGEntity> = Vec::new();
        if let Ok(available) = self.available_entities(config.document_ids.as_deref()) {
            let matched = fuzzy_match_from_question(question, &available);
            for name in matched.into_iter().take(2) {
                if let Ok(Some(entity)) = self.store.find_entity_by_name(&name, None) {
                    entities.push(ToGEntity::from(&entity));
                }
            }
        }

        let steps = if entities.is_empty() {
            Vec::new()
        } else {
            vec![ToGStep {
                depth: 1,
                entities_explored: entities,
                relations_selected: Vec::new(),
                sufficiency_score: Some(0.0),
                notes: Some("fallback analysis after a processing error".to_string()),
            }]
        };

        ToGOutcome {
            answer: format!(
                "Full multi-hop reasoning could not be completed for this question: \
                 '{question}'. Try rephrasing it, or verify that the relevant \
                 documents are indexed."
            ),
            confidence: FALLBACK_CONFIDENCE,
            sufficiency_status: SufficiencyStatus::Unknown,
            reasoning_path: steps,
            retrieved_triplets: Vec::new(),
            reasoning_summary: String::new(),
        }
    }
}

/// Best fuzzy match for one name against the pool.
fn fuzzy_match(target: &str, pool: &[String], threshold: f64) -> Option<String> {
    let mut best: Option<(f64, &String)> = None;
    for candidate in pool {
        let score = name_similarity(target, candidate);
        if score >= threshold && best.is_none_or(|(s, _)| score > s) {
            best = Some((score, candidate));
        }
    }
    best.map(|(_, name)| name.clone())
}

/// Fuzzy-matches meaningful question tokens against entity names.
fn fuzzy_match_from_question(question: &str, pool: &[String]) -> Vec<String> {
    let question_lower = question.to_lowercase();
    let words: Vec<&str> = question_lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .collect();

    let mut scored: Vec<(f64, &String)> = pool
        .iter()
        .map(|entity| {
            let entity_lower = entity.to_lowercase();
            let mut best = if question_lower.contains(&entity_lower) {
                1.0
            } else {
                0.0
            };
            for word in &words {
                best = f64::max(best, name_similarity(word, entity));
            }
            (best, entity)
        })
        .filter(|(score, _)| *score > QUESTION_FUZZY_THRESHOLD)
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(QUESTION_FUZZY_TOP_K)
        .map(|(_, name)| name.clone())
        .collect()
}

/// True when the next frontier overlaps the current one past the ratio.
fn detect_cycle(current: &[Entity], next: &[Entity]) -> bool {
    if next.is_empty() {
        return false;
    }
    let current_names: HashSet<String> =
        current.iter().map(|e| normalize_name(&e.name)).collect();
    let overlap = next
        .iter()
        .filter(|e| current_names.contains(&normalize_name(&e.name)))
        .count();
    #[allow(clippy::cast_precision_loss)]
    let ratio = overlap as f64 / next.len() as f64;
    ratio > CYCLE_OVERLAP_RATIO
}
