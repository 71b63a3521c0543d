//! ToG reasoner integration: multi-hop happy path, cycle safeguard,
//! sufficiency short-circuit, and fallback behavior.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{ScriptedLlm, test_gateway};
use graphtog::models::{EntityKind, Relation, RelationType, Triplet};
use graphtog::storage::{GraphStore, MemoryGraphStore};
use graphtog::tog::{PruningMethod, SufficiencyStatus, ToGConfig, ToGReasoner};
use std::sync::Arc;

/// Alice —WORKS_AT→ Acme —LOCATED_IN→ Paris.
fn work_graph() -> Arc<MemoryGraphStore> {
    let store = Arc::new(MemoryGraphStore::new());
    let alice = store
        .upsert_entity("Alice", EntityKind::Person, "a software engineer", 1.0, None)
        .unwrap();
    let acme = store
        .upsert_entity("Acme", EntityKind::Organization, "an engineering company", 1.0, None)
        .unwrap();
    let paris = store
        .upsert_entity("Paris", EntityKind::Geo, "capital of France", 1.0, None)
        .unwrap();
    store
        .upsert_relation(
            &Relation::new(alice, acme.clone(), RelationType::new("WORKS_AT"))
                .with_confidence(0.9),
        )
        .unwrap();
    store
        .upsert_relation(
            &Relation::new(acme, paris, RelationType::new("LOCATED_IN")).with_confidence(0.85),
        )
        .unwrap();
    store
}

#[test]
fn test_multi_hop_happy_path() {
    let store = work_graph();
    let llm = ScriptedLlm::new()
        .on(
            "Identify up to 5 entities",
            r#"{"topic_entities": ["Alice"]}"#,
        )
        .on(
            "Decide whether the relations explored so far",
            r#"{"sufficient": false, "confidence_score": 0.3, "reasoning": "only one hop so far"}"#,
        )
        .on(
            "Answer the question from the reasoning path",
            r#"{"answer": "Alice works at Acme, which is located in Paris.", "confidence": 0.9, "reasoning_summary": "followed WORKS_AT then LOCATED_IN"}"#,
        );
    let reasoner = ToGReasoner::new(store, test_gateway(llm));

    let config = ToGConfig {
        search_depth: 2,
        pruning_method: PruningMethod::Bm25,
        ..ToGConfig::default()
    };
    let outcome = reasoner.process_query("Where does Alice work and in which city?", &config);

    assert!(outcome.answer.contains("Acme"));
    assert!(outcome.answer.contains("Paris"));
    assert!(outcome.confidence >= 0.6);

    // Both hops were recorded as evidence.
    assert!(outcome
        .retrieved_triplets
        .contains(&Triplet::new("Alice", "WORKS_AT", "Acme")));
    assert!(outcome
        .retrieved_triplets
        .contains(&Triplet::new("Acme", "LOCATED_IN", "Paris")));

    // Depth bounded by the configuration.
    let max_depth = outcome.reasoning_path.iter().map(|s| s.depth).max().unwrap();
    assert!(max_depth <= config.search_depth);
}

#[test]
fn test_cycle_safeguard_terminates_early() {
    let store = Arc::new(MemoryGraphStore::new());
    let a = store
        .upsert_entity("NodeA", EntityKind::Concept, "first node", 1.0, None)
        .unwrap();
    let b = store
        .upsert_entity("NodeB", EntityKind::Concept, "second node", 1.0, None)
        .unwrap();
    store
        .upsert_relation(&Relation::new(a.clone(), b.clone(), RelationType::new("LINKS")))
        .unwrap();
    store
        .upsert_relation(&Relation::new(b, a, RelationType::new("LINKS")))
        .unwrap();

    let llm = ScriptedLlm::new()
        .on("Identify up to 5 entities", r#"{"topic_entities": ["NodeA"]}"#)
        .on(
            "Decide whether the relations explored so far",
            r#"{"sufficient": false, "confidence_score": 0.1, "reasoning": "loop"}"#,
        )
        .on(
            "Answer the question from the reasoning path",
            r#"{"answer": "The graph only loops between NodeA and NodeB.", "confidence": 0.4, "reasoning_summary": "cycle"}"#,
        );
    let reasoner = ToGReasoner::new(store, test_gateway(llm));

    let config = ToGConfig {
        search_depth: 5,
        pruning_method: PruningMethod::Bm25,
        ..ToGConfig::default()
    };
    let outcome = reasoner.process_query("What connects NodeA onwards?", &config);

    // Relation-type dedup ends the loop well before the depth bound.
    assert!(outcome.reasoning_path.len() <= 2);
    assert_eq!(outcome.sufficiency_status, SufficiencyStatus::Insufficient);

    let explored: usize = outcome
        .reasoning_path
        .iter()
        .map(|s| s.entities_explored.len())
        .sum();
    assert!(explored < 5);
}

#[test]
fn test_sufficiency_short_circuits() {
    let store = work_graph();
    let llm = ScriptedLlm::new()
        .on("Identify up to 5 entities", r#"{"topic_entities": ["Alice"]}"#)
        .on(
            "Decide whether the relations explored so far",
            r#"{"sufficient": true, "confidence_score": 0.95, "reasoning": "the employer is already known"}"#,
        )
        .on(
            "Answer the question from the reasoning path",
            r#"{"answer": "Alice works at Acme.", "confidence": 0.9, "reasoning_summary": "one hop sufficed"}"#,
        );
    let reasoner = ToGReasoner::new(store, test_gateway(llm));

    let config = ToGConfig {
        search_depth: 3,
        pruning_method: PruningMethod::Bm25,
        ..ToGConfig::default()
    };
    let outcome = reasoner.process_query("Where does Alice work?", &config);

    assert_eq!(outcome.sufficiency_status, SufficiencyStatus::Sufficient);
    assert_eq!(outcome.reasoning_path.len(), 1, "stopped after the first hop");
    assert!(outcome.reasoning_path[0].sufficiency_score.unwrap() > 0.9);
}

#[test]
fn test_no_topic_match_falls_back_with_low_confidence() {
    let store = Arc::new(MemoryGraphStore::new());
    let llm = ScriptedLlm::new();
    let reasoner = ToGReasoner::new(store, test_gateway(llm));

    let outcome = reasoner.process_query(
        "What does the empty graph know?",
        &ToGConfig {
            pruning_method: PruningMethod::Bm25,
            ..ToGConfig::default()
        },
    );
    assert!(outcome.confidence <= 0.2);
    assert!(outcome.retrieved_triplets.is_empty());
}

#[test]
fn test_exploration_bound_invariant() {
    // |explored| <= 1 + width * depth * retain even on a dense graph.
    let store = Arc::new(MemoryGraphStore::new());
    let hub = store
        .upsert_entity("Hub", EntityKind::Concept, "center", 1.0, None)
        .unwrap();
    for i in 0..30 {
        let spoke = store
            .upsert_entity(&format!("Spoke{i}"), EntityKind::Concept, "edge node", 1.0, None)
            .unwrap();
        store
            .upsert_relation(
                &Relation::new(hub.clone(), spoke, RelationType::new(format!("REL_{i}")))
                    .with_confidence(0.9),
            )
            .unwrap();
    }

    let llm = ScriptedLlm::new()
        .on("Identify up to 5 entities", r#"{"topic_entities": ["Hub"]}"#)
        .on(
            "Answer the question from the reasoning path",
            r#"{"answer": "Hub links to many spokes.", "confidence": 0.7, "reasoning_summary": "hub"}"#,
        );
    let reasoner = ToGReasoner::new(store, test_gateway(llm));

    let config = ToGConfig {
        search_width: 3,
        search_depth: 3,
        num_retain_entity: 5,
        enable_sufficiency_check: false,
        pruning_method: PruningMethod::Bm25,
        ..ToGConfig::default()
    };
    let outcome = reasoner.process_query("What does the hub connect to?", &config);

    let mut explored: std::collections::HashSet<String> = std::collections::HashSet::new();
    for step in &outcome.reasoning_path {
        for entity in &step.entities_explored {
            explored.insert(entity.name.clone());
        }
    }
    for triplet in &outcome.retrieved_triplets {
        explored.insert(triplet.object.clone());
    }
    let bound = 1 + config.search_width * (config.search_depth as usize) * config.num_retain_entity;
    assert!(explored.len() <= bound, "{} > {bound}", explored.len());
}
