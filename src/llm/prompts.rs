//! Prompt templates and builders.
//!
//! Centralizes every prompt the engine sends. Extraction uses a delimited
//! record stream rather than JSON because partial output stays parseable:
//! each record is one line, fields separated by [`TUPLE_DELIMITER`], and a
//! finished response ends with [`COMPLETION_MARKER`].

use crate::models::{Community, EntityKind};

/// Field separator inside one extraction record.
pub const TUPLE_DELIMITER: &str = "|||";

/// Record separator in the extraction stream.
pub const RECORD_DELIMITER: &str = "\n";

/// Marker a finished extraction response must end with.
pub const COMPLETION_MARKER: &str = "<COMPLETE>";

/// Renders the default entity-kind vocabulary for prompt interpolation.
#[must_use]
pub fn entity_kind_list() -> String {
    EntityKind::all()
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Builds the joint entity/relationship extraction prompt for one chunk.
#[must_use]
pub fn build_extraction_prompt(chunk_text: &str) -> String {
    let kinds = entity_kind_list();
    format!(
        r#"-Goal-
Given a text document, identify all entities of the listed types and all
relationships among the identified entities.

-Steps-
1. Identify all entities. For each, extract:
- entity_name: name of the entity, capitalized
- entity_type: one of [{kinds}]
- entity_description: comprehensive description of the entity's attributes and activities
Format each entity as ("entity"{TUPLE_DELIMITER}<entity_name>{TUPLE_DELIMITER}<entity_type>{TUPLE_DELIMITER}<entity_description>)

2. From the entities in step 1, identify all pairs of (source_entity, target_entity) that are *clearly related*. For each pair, extract:
- source_entity and target_entity: names as identified in step 1
- relationship_description: why the entities are related
- relationship_strength: an integer from 1 to 10
Format each relationship as ("relationship"{TUPLE_DELIMITER}<source_entity>{TUPLE_DELIMITER}<target_entity>{TUPLE_DELIMITER}<relationship_description>{TUPLE_DELIMITER}<relationship_strength>)

3. Return the output as a single list, one record per line.

4. When finished, output {COMPLETION_MARKER}

######################
-Example-
######################
Text:
Nadia Kova joined Meridian Labs in 2019 and now leads its Lyon office.
######################
Output:
("entity"{TUPLE_DELIMITER}NADIA KOVA{TUPLE_DELIMITER}PERSON{TUPLE_DELIMITER}Nadia Kova is a Meridian Labs employee who leads the Lyon office)
("entity"{TUPLE_DELIMITER}MERIDIAN LABS{TUPLE_DELIMITER}ORGANIZATION{TUPLE_DELIMITER}Meridian Labs is an organization with an office in Lyon)
("entity"{TUPLE_DELIMITER}LYON{TUPLE_DELIMITER}GEO{TUPLE_DELIMITER}Lyon is the city hosting a Meridian Labs office)
("relationship"{TUPLE_DELIMITER}NADIA KOVA{TUPLE_DELIMITER}MERIDIAN LABS{TUPLE_DELIMITER}Nadia Kova works at Meridian Labs and leads an office{TUPLE_DELIMITER}9)
("relationship"{TUPLE_DELIMITER}MERIDIAN LABS{TUPLE_DELIMITER}LYON{TUPLE_DELIMITER}Meridian Labs operates an office located in Lyon{TUPLE_DELIMITER}7)
{COMPLETION_MARKER}

######################
-Real Data-
######################
Text:
{chunk_text}
######################
Output:
"#
    )
}

/// Continuation prompt for a second extraction pass.
#[must_use]
pub fn build_extraction_continue_prompt() -> String {
    format!(
        "MANY entities and relationships were missed in the last extraction. \
         Add them below using the same format, and output {COMPLETION_MARKER} when done:"
    )
}

/// Gate prompt asking whether another pass is worthwhile.
pub const EXTRACTION_LOOP_PROMPT: &str = "It appears some entities or relationships may still \
have been missed. Answer Y if entities or relationships still need to be added, or N if there \
are none. Answer with a single letter Y or N.";

/// Builds the query classification prompt.
#[must_use]
pub fn build_classification_prompt(query: &str) -> String {
    format!(
        r#"Classify the following question for a knowledge-graph QA engine.

Question: {query}

Types:
- "local": about one specific entity and its direct neighborhood
- "global": about the corpus as a whole, its main topics or themes
- "hybrid": needs both entity detail and corpus-level context
- "tog": needs multi-hop reasoning across several relationships
- "comparative": compares two or more entities
- "exploratory": open-ended browsing of an area
- "specific": a narrow factual lookup

Respond as JSON:
{{"type": "...", "key_entities": ["..."], "confidence": 0.0}}
"#
    )
}

/// Builds the final grounded-answer prompt.
#[must_use]
pub fn build_answer_prompt(query: &str, context: &str, citations: &[String]) -> String {
    let citation_list = citations
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{}] {c}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Answer the question using ONLY the supplied context. Cite sources with
numbered markers like [1] that refer to the citation list.

Question: {query}

Context:
{context}

Citations:
{citation_list}

Respond as JSON:
{{"answer": "...", "citations": [1, 2], "confidence_score": 0.0, "reasoning": "..."}}
"#
    )
}

/// Builds the community summarization prompt.
#[must_use]
pub fn build_community_summary_prompt(
    level: u32,
    member_count: usize,
    members_text: &str,
    relationships_text: &str,
) -> String {
    format!(
        r#"Generate a comprehensive summary of this entity community in 2-3 sentences.

Community Level: {level}
Member Count: {member_count}

Key Members:
{members_text}

Key Relationships:
{relationships_text}

Provide a brief summary of what this community represents, 3-5 main themes,
and its significance (high/medium/low).

Respond as JSON:
{{"summary": "...", "themes": ["..."], "significance": "high|medium|low"}}
"#
    )
}

/// Builds the map-phase prompt over one community batch.
#[must_use]
pub fn build_map_batch_prompt(query: &str, communities: &[Community]) -> String {
    let digest = communities
        .iter()
        .map(|c| {
            format!(
                "- Community {} (level {}, {} members): {}",
                c.id,
                c.level,
                c.size,
                c.summary.as_deref().unwrap_or("(no summary)")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"You are answering the question below from a batch of community summaries.
Summarize what THIS batch contributes to the answer. If the batch is
irrelevant, say so.

Question: {query}

Communities:
{digest}

Respond as JSON:
{{"summary": "...", "relevant_communities": [1, 2], "confidence": 0.0}}
"#
    )
}

/// Builds the reduce-phase synthesis prompt.
#[must_use]
pub fn build_reduce_prompt(query: &str, batch_summaries: &[String]) -> String {
    let numbered = batch_summaries
        .iter()
        .enumerate()
        .map(|(i, s)| format!("Batch {}: {s}", i + 1))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        r#"Synthesize a final answer to the question from the batch summaries below.

Question: {query}

Batch Summaries:
{numbered}

Respond as JSON:
{{"answer": "...", "key_insights": ["..."], "supporting_communities": [1, 2],
  "limitations": "...", "confidence_score": 0.0}}
"#
    )
}

/// Builds the entity-resolution adjudication prompt for an ambiguous pair.
#[must_use]
pub fn build_resolution_prompt(
    name_a: &str,
    description_a: &str,
    name_b: &str,
    description_b: &str,
) -> String {
    format!(
        r#"Decide whether these two knowledge-graph entities refer to the same
real-world subject.

Entity A: {name_a}
Description A: {description_a}

Entity B: {name_b}
Description B: {description_b}

Respond as JSON:
{{"are_same": true, "confidence": 0.0, "canonical_name": "...", "reasoning": "..."}}
"#
    )
}

// ============================================================================
// ToG prompts
// ============================================================================

/// Builds the topic-entity selection prompt.
#[must_use]
pub fn build_tog_topic_prompt(question: &str, available_entities: &str) -> String {
    format!(
        r#"Identify up to 5 entities from the available list that the question is
about. Only select entities that appear in the list.

Question: {question}

Available entities: {available_entities}

Respond as JSON:
{{"topic_entities": ["..."]}}
"#
    )
}

/// Builds the relation-scoring prompt for one exploration step.
#[must_use]
pub fn build_tog_relation_prompt(
    question: &str,
    entities: &str,
    relations: &str,
    previous_relations: &str,
) -> String {
    format!(
        r#"Score how useful each relation type is for answering the question,
given the entities currently being explored. Scores are between 0.0 and 1.0.

Question: {question}
Current entities: {entities}
Already explored relations: {previous_relations}

Candidate relations: {relations}

Respond as JSON:
{{"relations": [{{"relation": "...", "score": 0.0, "reasoning": "..."}}]}}
"#
    )
}

/// Builds the entity-scoring prompt for relation expansion.
#[must_use]
pub fn build_tog_entity_prompt(question: &str, relation: &str, candidates: &str) -> String {
    format!(
        r#"Score how relevant each candidate entity is for answering the question,
reached via the relation "{relation}". Scores are between 0.0 and 1.0.

Question: {question}

Candidates:
{candidates}

Respond as JSON:
{{"entity_scores": [{{"entity": "...", "score": 0.0, "reasoning": "..."}}]}}
"#
    )
}

/// Builds the sufficiency-check prompt.
#[must_use]
pub fn build_tog_sufficiency_prompt(question: &str, relations: &str) -> String {
    format!(
        r#"Decide whether the relations explored so far contain enough information
to answer the question.

Question: {question}

Explored relations: {relations}

Respond as JSON:
{{"sufficient": true, "confidence_score": 0.0, "reasoning": "..."}}
"#
    )
}

/// Builds the final ToG answer prompt.
#[must_use]
pub fn build_tog_answer_prompt(question: &str, reasoning_path: &str) -> String {
    format!(
        r#"Answer the question from the reasoning path explored over the knowledge
graph. Ground every claim in the path; do not invent facts.

Question: {question}

Reasoning path: {reasoning_path}

Respond as JSON:
{{"answer": "...", "confidence": 0.0, "reasoning_summary": "..."}}
"#
    )
}
