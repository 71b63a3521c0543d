//! End-to-end indexing tests: chunking → extraction → graph construction →
//! community detection, driven by a scripted LLM.

// Integration tests use expect/unwrap for simplicity.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{ScriptedLlm, extraction_response, test_gateway};
use graphtog::config::GraphtogConfig;
use graphtog::index::IndexingPipeline;
use graphtog::models::{DocumentStatus, EntityKind};
use graphtog::storage::{GraphStore, MemoryGraphStore};
use std::sync::Arc;

const ALICE_DOC: &str = "Alice is a software engineer who works at Acme Corp.\n\n\
Acme Corp is a manufacturing company based in Paris.";

fn alice_llm() -> ScriptedLlm {
    // Rule order matters: the summary and loop-gate prompts also contain
    // chunk text (via entity descriptions), so their needles come first.
    ScriptedLlm::new()
        .on(
            "Generate a comprehensive summary",
            r#"{"summary": "A workplace cluster around Acme Corp.", "themes": ["employment", "manufacturing", "Paris"], "significance": "medium"}"#,
        )
        .on("Answer Y if", "N")
        .on(
            "Alice is a software engineer",
            &extraction_response(&[
                r#"("entity"|||ALICE|||PERSON|||Alice is a software engineer who works at Acme Corp)"#,
                r#"("entity"|||ACME CORP|||ORGANIZATION|||Acme Corp is a manufacturing company based in Paris)"#,
                r#"("relationship"|||ALICE|||ACME CORP|||Alice works at Acme Corp|||9)"#,
            ]),
        )
}

fn pipeline(store: Arc<MemoryGraphStore>, llm: ScriptedLlm) -> IndexingPipeline {
    let config = GraphtogConfig::default();
    IndexingPipeline::new(store, test_gateway(llm), config).expect("pipeline builds")
}

#[test]
fn test_basic_ingest_builds_grounded_entities() {
    let store = Arc::new(MemoryGraphStore::new());
    let pipeline = pipeline(store.clone(), alice_llm());

    let report = pipeline
        .index_document("doc-alice", "alice.md", "/docs/alice.md", ALICE_DOC.as_bytes())
        .expect("indexing succeeds");

    assert_eq!(report.status, "completed");
    assert_eq!(report.chunks, 1, "small document is one chunk");
    assert_eq!(report.entities, 2);
    assert_eq!(report.relations, 1);

    let alice = store
        .find_entity_by_name("Alice", Some(EntityKind::Person))
        .unwrap()
        .expect("Alice exists");
    assert_eq!(alice.mention_count, 1);
    assert_eq!(store.mentions_of(&alice.id).unwrap().len(), 1);

    let acme = store
        .find_entity_by_name("Acme Corp", Some(EntityKind::Organization))
        .unwrap()
        .expect("Acme Corp exists");
    assert_eq!(acme.mention_count, 1);

    let relations = store.relations_of(&alice.id).unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].rel_type.as_str(), "WORKS_AT");

    let doc = store.get_document("doc-alice").unwrap().expect("doc exists");
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.version, 1);
}

#[test]
fn test_fingerprint_dedup_across_documents() {
    let store = Arc::new(MemoryGraphStore::new());
    let llm = ScriptedLlm::new()
        .on("Generate a comprehensive summary", r#"{"summary": "s", "themes": ["t"], "significance": "low"}"#)
        .on("Answer Y if", "N")
        .on(
            "Alice leads the project",
            &extraction_response(&[
                r#"("entity"|||ALICE|||PERSON|||Alice leads the project)"#,
            ]),
        )
        .on(
            "the report was written by alice",
            &extraction_response(&[
                r#"("entity"|||alice|||PERSON|||the report author)"#,
            ]),
        );
    let pipeline = pipeline(store.clone(), llm);

    pipeline
        .index_document("doc-1", "one.md", "/docs/one.md", b"Alice leads the project.")
        .expect("first document indexes");
    pipeline
        .index_document("doc-2", "two.md", "/docs/two.md", b"the report was written by alice.")
        .expect("second document indexes");

    // One entity despite differing case, grounded in both documents.
    let people = store.entities_by_kind(Some(EntityKind::Person)).unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(people[0].mention_count, 2);
    assert_eq!(store.mentions_of(&people[0].id).unwrap().len(), 2);
}

#[test]
fn test_reindex_unchanged_is_skipped() {
    let store = Arc::new(MemoryGraphStore::new());
    let pipeline = pipeline(store.clone(), alice_llm());

    let first = pipeline
        .index_document("doc-alice", "alice.md", "/docs/alice.md", ALICE_DOC.as_bytes())
        .unwrap();
    assert!(!first.skipped);
    let stats_before = store.graph_statistics().unwrap();

    let second = pipeline
        .index_document("doc-alice", "alice.md", "/docs/alice.md", ALICE_DOC.as_bytes())
        .unwrap();
    assert!(second.skipped);
    assert_eq!(second.version, 1);

    // Graph unchanged: no duplicated entities or relations.
    let stats_after = store.graph_statistics().unwrap();
    assert_eq!(stats_before, stats_after);
}

#[test]
fn test_reindex_changed_content_bumps_version() {
    let store = Arc::new(MemoryGraphStore::new());
    let llm = alice_llm().on(
        "Alice moved to Berlin",
        &extraction_response(&[
            r#"("entity"|||ALICE|||PERSON|||Alice moved to Berlin)"#,
            r#"("entity"|||BERLIN|||GEO|||Berlin is a city)"#,
        ]),
    );
    let pipeline = pipeline(store.clone(), llm);

    pipeline
        .index_document("doc-alice", "alice.md", "/docs/alice.md", ALICE_DOC.as_bytes())
        .unwrap();
    let report = pipeline
        .index_document(
            "doc-alice",
            "alice.md",
            "/docs/alice.md",
            b"Alice moved to Berlin this year.",
        )
        .unwrap();

    assert!(!report.skipped);
    assert_eq!(report.version, 2);

    // The old subgraph is gone; Acme no longer exists.
    assert!(store
        .find_entity_by_name("Acme Corp", None)
        .unwrap()
        .is_none());
    assert!(store.find_entity_by_name("Berlin", None).unwrap().is_some());
}

#[test]
fn test_delete_document_reduces_counts_exactly() {
    let store = Arc::new(MemoryGraphStore::new());
    let pipeline = pipeline(store.clone(), alice_llm());
    pipeline
        .index_document("doc-alice", "alice.md", "/docs/alice.md", ALICE_DOC.as_bytes())
        .unwrap();

    let before = store.graph_statistics().unwrap();
    let report = pipeline.delete_document("doc-alice").unwrap();
    let after = store.graph_statistics().unwrap();

    assert_eq!(after.documents, before.documents - 1);
    assert_eq!(after.text_units, before.text_units - report.deleted.text_units);
    assert_eq!(after.entities, 0, "all entities were grounded only here");
}

#[test]
fn test_extraction_failure_marks_document_failed() {
    let store = Arc::new(MemoryGraphStore::new());
    // The default "{}" response parses as no records at all.
    let llm = ScriptedLlm::new();
    let pipeline = pipeline(store.clone(), llm);

    let report = pipeline
        .index_document("doc-empty", "e.md", "/docs/e.md", b"Nothing of note here.")
        .unwrap();
    assert_eq!(report.status, "failed");
    assert_eq!(report.entities, 0);

    let doc = store.get_document("doc-empty").unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
}

#[test]
fn test_communities_detected_and_summarized() {
    let store = Arc::new(MemoryGraphStore::new());
    let pipeline = pipeline(store.clone(), alice_llm());
    let report = pipeline
        .index_document("doc-alice", "alice.md", "/docs/alice.md", ALICE_DOC.as_bytes())
        .unwrap();

    assert!(report.communities >= 1);
    assert!(report.summarized >= 1);

    let communities = store.list_communities(Some(0)).unwrap();
    let sizes: usize = communities.iter().map(|c| c.size).sum();
    assert_eq!(sizes, store.graph_statistics().unwrap().entities);
    assert!(communities.iter().any(|c| c.summary.is_some()));
}
