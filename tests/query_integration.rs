//! Query service integration: the classify → retrieve → answer pipeline and
//! the map-reduce global path.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{ScriptedLlm, test_gateway};
use graphtog::config::GraphtogConfig;
use graphtog::models::{CommunitySummary, Document, EntityKind, OpStatus, Relation, RelationType, Significance, TextUnit};
use graphtog::query::QueryService;
use graphtog::storage::{GraphStore, MemoryGraphStore};
use std::sync::Arc;

fn entity_graph() -> Arc<MemoryGraphStore> {
    let store = Arc::new(MemoryGraphStore::new());
    store
        .upsert_document(&Document::new("doc-1", "d.md", "/d.md", "h"))
        .unwrap();
    store
        .create_text_unit(&TextUnit::new(
            "tu-1",
            "doc-1",
            "Alice is a software engineer who works at Acme Corp in Paris.",
            0,
            61,
        ))
        .unwrap();
    let alice = store
        .upsert_entity("Alice", EntityKind::Person, "a software engineer", 1.0, None)
        .unwrap();
    let acme = store
        .upsert_entity("Acme Corp", EntityKind::Organization, "an engineering company", 1.0, None)
        .unwrap();
    store.link_mention(&alice, "tu-1").unwrap();
    store.link_mention(&acme, "tu-1").unwrap();
    store
        .upsert_relation(
            &Relation::new(alice, acme, RelationType::new("WORKS_AT")).with_confidence(0.9),
        )
        .unwrap();
    store
}

/// Seeds `count` summarized single-member communities.
fn community_corpus(count: i64) -> Arc<MemoryGraphStore> {
    let store = Arc::new(MemoryGraphStore::new());
    for i in 0..count {
        let id = store
            .upsert_entity(
                &format!("Topic{i}"),
                EntityKind::Concept,
                &format!("theme number {i}"),
                1.0,
                None,
            )
            .unwrap();
        store.assign_communities(&[(id, i)], 0).unwrap();
        store
            .store_community_summary(
                i,
                0,
                &CommunitySummary {
                    summary: format!("Community {i} covers theme number {i}."),
                    themes: vec![format!("theme-{i}")],
                    significance: Significance::Medium,
                },
            )
            .unwrap();
    }
    store
}

#[test]
fn test_local_query_pipeline() {
    let store = entity_graph();
    let llm = ScriptedLlm::new()
        .on(
            "Classify the following question",
            r#"{"type": "specific", "key_entities": ["Alice"], "confidence": 0.9}"#,
        )
        .on(
            "Answer the question using ONLY the supplied context",
            r#"{"answer": "Alice works at Acme Corp [1].", "citations": [1], "confidence_score": 0.85, "reasoning": "stated directly in the excerpt"}"#,
        );
    let service = QueryService::new(store, test_gateway(llm), GraphtogConfig::default());

    let envelope = service.process("Where does Alice work?", None);
    assert_eq!(envelope.status, OpStatus::Success);
    let answer = envelope.data.expect("answer present");

    assert_eq!(answer.query_type, "specific");
    assert_eq!(answer.entities_found, vec!["Alice".to_string()]);
    assert!(answer.answer.contains("Acme Corp"));
    assert_eq!(answer.citations, vec!["Alice (PERSON)".to_string()]);
    assert!(answer.context.contains("WORKS_AT"));
    assert!(answer.context.contains("Excerpt"));

    // The reasoning trace narrates every pipeline step.
    let steps: Vec<&str> = envelope
        .reasoning_steps
        .iter()
        .map(|s| s.step.as_str())
        .collect();
    assert!(steps.contains(&"classify_query"));
    assert!(steps.contains(&"entity_lookup"));
    assert!(steps.contains(&"build_context"));
    assert!(steps.contains(&"generate_answer"));
}

#[test]
fn test_unknown_entities_fall_back_to_top_entities() {
    let store = entity_graph();
    let llm = ScriptedLlm::new()
        .on(
            "Classify the following question",
            r#"{"type": "exploratory", "key_entities": ["Zorblax"], "confidence": 0.4}"#,
        )
        .on(
            "Answer the question using ONLY the supplied context",
            r#"{"answer": "The graph covers Alice and Acme Corp.", "citations": [], "confidence_score": 0.5, "reasoning": "fallback"}"#,
        );
    let service = QueryService::new(store, test_gateway(llm), GraphtogConfig::default());

    let envelope = service.process("Tell me about Zorblax", None);
    assert_eq!(envelope.status, OpStatus::Success);
    let answer = envelope.data.unwrap();
    assert!(!answer.entities_found.is_empty(), "top entities seeded the context");
}

#[test]
fn test_empty_graph_query_is_not_found() {
    let store = Arc::new(MemoryGraphStore::new());
    let llm = ScriptedLlm::new().on(
        "Classify the following question",
        r#"{"type": "specific", "key_entities": [], "confidence": 0.2}"#,
    );
    let service = QueryService::new(store, test_gateway(llm), GraphtogConfig::default());

    let envelope = service.process("Anything there?", None);
    assert_eq!(envelope.status, OpStatus::NotFound);
    assert!(envelope.error.is_some());
    assert!(!envelope.reasoning_steps.is_empty());
}

#[test]
fn test_global_mapreduce_batches() {
    let store = community_corpus(25);
    let llm = ScriptedLlm::new()
        .on(
            "Classify the following question",
            r#"{"type": "global", "key_entities": [], "confidence": 0.9}"#,
        )
        .on(
            "Summarize what THIS batch contributes",
            r#"{"summary": "These communities cover adjacent themes.", "relevant_communities": [0, 1], "confidence": 0.8}"#,
        )
        .on(
            "Synthesize a final answer",
            r#"{"answer": "The corpus spans twenty-five themed communities.", "key_insights": ["themes are evenly spread"], "supporting_communities": [0, 5, 20], "limitations": "", "confidence_score": 0.8}"#,
        );
    let service = QueryService::new(store, test_gateway(llm), GraphtogConfig::default());

    let envelope = service.process("What are the main themes of the corpus?", None);
    assert_eq!(envelope.status, OpStatus::Success);
    let answer = envelope.data.unwrap();
    let global = answer.global.expect("global detail present");

    // ceil(25 / 10) = 3 map batches.
    assert_eq!(global.num_batches, 3);
    assert_eq!(global.num_communities, 25);
    assert_eq!(global.failed_batches, 0);
    assert!(!global.supporting_communities.is_empty());
    assert_eq!(answer.query_type, "global_mapreduce");
    assert!(answer.answer.contains("communities"));
}

#[test]
fn test_mapreduce_failed_batch_noted_in_limitations() {
    let store = community_corpus(25);
    // The batch containing "Community 20" answers garbage; its summary is
    // omitted and 1/3 >= 25% forces a partial-coverage note.
    let llm = ScriptedLlm::new()
        .on(
            "Classify the following question",
            r#"{"type": "global", "key_entities": [], "confidence": 0.9}"#,
        )
        .on("- Community 20 (level", "this is not json at all")
        .on(
            "Summarize what THIS batch contributes",
            r#"{"summary": "Adjacent themes.", "relevant_communities": [2], "confidence": 0.8}"#,
        )
        .on(
            "Synthesize a final answer",
            r#"{"answer": "Most themes are covered.", "key_insights": [], "supporting_communities": [2], "limitations": "", "confidence_score": 0.6}"#,
        );
    let service = QueryService::new(store, test_gateway(llm), GraphtogConfig::default());

    let envelope = service.process("What are the main themes?", None);
    assert_eq!(envelope.status, OpStatus::Success);
    let global = envelope.data.unwrap().global.expect("global detail");

    assert_eq!(global.num_batches, 3);
    assert_eq!(global.failed_batches, 1);
    assert!(
        global.limitations.contains("Partial coverage"),
        "limitations must flag the failed batch: {}",
        global.limitations
    );
}

#[test]
fn test_mapreduce_without_summaries_is_an_error() {
    let store = Arc::new(MemoryGraphStore::new());
    // 25 communities, none summarized.
    for i in 0..25 {
        let id = store
            .upsert_entity(&format!("Bare{i}"), EntityKind::Concept, "", 1.0, None)
            .unwrap();
        store.assign_communities(&[(id, i)], 0).unwrap();
    }
    let llm = ScriptedLlm::new().on(
        "Classify the following question",
        r#"{"type": "global", "key_entities": [], "confidence": 0.9}"#,
    );
    let service = QueryService::new(store, test_gateway(llm), GraphtogConfig::default());

    let envelope = service.process("What are the main themes?", None);
    assert_eq!(envelope.status, OpStatus::Error);
    let error = envelope.error.expect("error surfaced");
    assert!(
        error.message.contains("summaries"),
        "message names the missing summaries: {}",
        error.message
    );
}

#[test]
fn test_small_corpus_global_skips_mapreduce() {
    // Below the community threshold the standard path runs instead.
    let store = entity_graph();
    let llm = ScriptedLlm::new()
        .on(
            "Classify the following question",
            r#"{"type": "global", "key_entities": ["Alice"], "confidence": 0.7}"#,
        )
        .on(
            "Answer the question using ONLY the supplied context",
            r#"{"answer": "A small graph about Alice and Acme.", "citations": [1], "confidence_score": 0.6, "reasoning": "few entities"}"#,
        );
    let service = QueryService::new(store, test_gateway(llm), GraphtogConfig::default());

    let envelope = service.process("What is this corpus about?", None);
    assert_eq!(envelope.status, OpStatus::Success);
    let answer = envelope.data.unwrap();
    assert!(answer.global.is_none(), "map-reduce did not engage");
    assert_eq!(answer.query_type, "global");
}
