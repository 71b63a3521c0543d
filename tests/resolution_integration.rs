//! Entity-resolution integration: fuzzy pair discovery, LLM adjudication,
//! and merge semantics against a populated graph.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{ScriptedLlm, test_gateway};
use graphtog::config::ResolutionConfig;
use graphtog::models::{Document, EntityKind, Relation, RelationType, TextUnit};
use graphtog::resolve::EntityResolver;
use graphtog::storage::{GraphStore, MemoryGraphStore};
use std::sync::Arc;

fn seeded_store() -> Arc<MemoryGraphStore> {
    let store = Arc::new(MemoryGraphStore::new());
    store
        .upsert_document(&Document::new("doc-1", "d.md", "/d.md", "h"))
        .unwrap();
    store
        .create_text_unit(&TextUnit::new("tu-1", "doc-1", "Microsoft Corporation ...", 0, 25))
        .unwrap();
    store
        .create_text_unit(&TextUnit::new("tu-2", "doc-1", "Microsoft Corp ...", 26, 44))
        .unwrap();
    store
}

#[test]
fn test_fuzzy_merge_scenario() {
    let store = seeded_store();
    let resolver = EntityResolver::new(store.clone(), None, ResolutionConfig::default());

    let primary = store
        .upsert_entity(
            "Microsoft Corporation",
            EntityKind::Organization,
            "software company",
            0.9,
            Some("doc-1"),
        )
        .unwrap();
    let duplicate = store
        .upsert_entity(
            "Microsoft Corp",
            EntityKind::Organization,
            "software firm",
            0.8,
            Some("doc-1"),
        )
        .unwrap();
    let redmond = store
        .upsert_entity("Redmond", EntityKind::Geo, "a city", 1.0, None)
        .unwrap();

    store.link_mention(&primary, "tu-1").unwrap();
    store.link_mention(&duplicate, "tu-2").unwrap();
    store
        .upsert_relation(
            &Relation::new(duplicate.clone(), redmond.clone(), RelationType::new("LOCATED_IN"))
                .with_confidence(0.85),
        )
        .unwrap();

    // The pair is discoverable above the default threshold.
    let pairs = resolver
        .find_duplicate_pairs(Some(EntityKind::Organization), None)
        .unwrap();
    assert_eq!(pairs.len(), 1);
    assert!(pairs[0].similarity > 0.85, "got {}", pairs[0].similarity);

    let outcome = resolver
        .merge(&primary, &[duplicate.clone()], Some("Microsoft"))
        .expect("merge succeeds");

    // One entity named "Microsoft" with the duplicate preserved as alias.
    assert_eq!(outcome.final_name, "Microsoft");
    assert!(outcome.aliases.iter().any(|a| a == "Microsoft Corp"));
    assert!(store.get_entity(&duplicate).unwrap().is_none());

    let merged = store.get_entity(&primary).unwrap().unwrap();
    assert_eq!(merged.name, "Microsoft");
    assert_eq!(merged.mention_count, 2, "both MENTIONED_IN edges present");

    // The duplicate's relation now hangs off the primary.
    let relations = store.relations_of(&primary).unwrap();
    assert!(relations.iter().any(|r| r.target == redmond));

    // Merge-then-find: the duplicate's name resolves to the primary.
    let via_alias = store
        .find_entity_by_name("Microsoft Corp", Some(EntityKind::Organization))
        .unwrap()
        .expect("alias lookup works");
    assert_eq!(via_alias.id, primary);
}

#[test]
fn test_llm_adjudicated_auto_merge() {
    let store = seeded_store();
    let llm = ScriptedLlm::new().on(
        "Decide whether these two knowledge-graph entities",
        r#"{"are_same": true, "confidence": 0.97, "canonical_name": "Microsoft", "reasoning": "same company"}"#,
    );
    let config = ResolutionConfig {
        enabled: true,
        use_llm: true,
        ..ResolutionConfig::default()
    };
    let resolver = EntityResolver::new(store.clone(), Some(test_gateway(llm)), config);

    store
        .upsert_entity("Microsoft Corporation", EntityKind::Organization, "", 1.0, None)
        .unwrap();
    store
        .upsert_entity("Microsoft Corp", EntityKind::Organization, "", 1.0, None)
        .unwrap();

    let report = resolver.resolve_all(true).unwrap();
    assert_eq!(report.pairs_considered, 1);
    assert_eq!(report.merges_applied, 1);

    let orgs = store.entities_by_kind(Some(EntityKind::Organization)).unwrap();
    assert_eq!(orgs.len(), 1);
    assert_eq!(orgs[0].name, "Microsoft");
}

#[test]
fn test_llm_rejection_defers_pair() {
    let store = seeded_store();
    let llm = ScriptedLlm::new().on(
        "Decide whether these two knowledge-graph entities",
        r#"{"are_same": false, "confidence": 0.9, "canonical_name": "", "reasoning": "different subsidiaries"}"#,
    );
    let config = ResolutionConfig {
        use_llm: true,
        ..ResolutionConfig::default()
    };
    let resolver = EntityResolver::new(store.clone(), Some(test_gateway(llm)), config);

    store
        .upsert_entity("Acme Holdings", EntityKind::Organization, "", 1.0, None)
        .unwrap();
    store
        .upsert_entity("Acme Holding", EntityKind::Organization, "", 1.0, None)
        .unwrap();

    let report = resolver.resolve_all(true).unwrap();
    assert_eq!(report.merges_applied, 0);
    assert_eq!(report.pairs_deferred, 1);
    assert_eq!(
        store.entities_by_kind(Some(EntityKind::Organization)).unwrap().len(),
        2
    );
}

#[test]
fn test_double_merge_is_idempotent() {
    let store = seeded_store();
    let resolver = EntityResolver::new(store.clone(), None, ResolutionConfig::default());

    let primary = store
        .upsert_entity("Globex Corporation", EntityKind::Organization, "", 1.0, None)
        .unwrap();
    let duplicate = store
        .upsert_entity("Globex Corp", EntityKind::Organization, "", 1.0, None)
        .unwrap();

    let first = resolver.merge(&primary, &[duplicate.clone()], None).unwrap();
    let snapshot = store.get_entity(&primary).unwrap().unwrap();

    let second = resolver.merge(&primary, &[duplicate], None).unwrap();
    let after = store.get_entity(&primary).unwrap().unwrap();

    assert_eq!(first.merged_count, 1);
    assert_eq!(second.merged_count, 0);
    assert_eq!(snapshot.aliases, after.aliases);
    assert_eq!(snapshot.name, after.name);
}
