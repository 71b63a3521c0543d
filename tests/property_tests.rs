//! Property-based tests for identity, chunking, and parsing invariants.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use graphtog::chunking::Chunker;
use graphtog::config::ChunkingConfig;
use graphtog::models::{EntityId, EntityKind, RelationType, normalize_name};
use graphtog::resolve::name_similarity;
use proptest::prelude::*;

proptest! {
    /// Property: the fingerprint is insensitive to case and whitespace.
    #[test]
    fn prop_fingerprint_case_insensitive(name in "[A-Za-z][A-Za-z ]{0,30}") {
        let upper = EntityId::fingerprint(&name.to_uppercase(), EntityKind::Person);
        let lower = EntityId::fingerprint(&name.to_lowercase(), EntityKind::Person);
        let padded = EntityId::fingerprint(&format!("  {name}  "), EntityKind::Person);
        prop_assert_eq!(&upper, &lower);
        prop_assert_eq!(&upper, &padded);
    }

    /// Property: fingerprints differ across kinds for the same name.
    #[test]
    fn prop_fingerprint_kind_sensitive(name in "[A-Za-z]{1,20}") {
        let person = EntityId::fingerprint(&name, EntityKind::Person);
        let geo = EntityId::fingerprint(&name, EntityKind::Geo);
        prop_assert_ne!(person, geo);
    }

    /// Property: name normalization is idempotent.
    #[test]
    fn prop_normalize_idempotent(name in ".{0,60}") {
        let once = normalize_name(&name);
        let twice = normalize_name(&once);
        prop_assert_eq!(once, twice);
    }

    /// Property: relation-type normalization is idempotent.
    #[test]
    fn prop_relation_type_idempotent(label in "[A-Za-z][A-Za-z _-]{0,30}") {
        let first = RelationType::new(&label);
        let second = RelationType::new(first.as_str());
        prop_assert_eq!(first.as_str(), second.as_str());
    }

    /// Property: entity-kind labels roundtrip through parse.
    #[test]
    fn prop_entity_kind_roundtrip(idx in 0usize..10) {
        let kind = EntityKind::all()[idx];
        prop_assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
    }

    /// Property: similarity is symmetric and bounded.
    #[test]
    fn prop_similarity_symmetric(a in "[a-z ]{1,20}", b in "[a-z ]{1,20}") {
        let ab = name_similarity(&a, &b);
        let ba = name_similarity(&b, &a);
        prop_assert!((ab - ba).abs() < 1e-9);
        prop_assert!((0.0..=1.0).contains(&ab));
    }

    /// Property: every chunk's offsets slice back to its text, and every
    /// non-whitespace byte of the source is covered by some chunk.
    #[test]
    fn prop_chunk_offsets_and_coverage(
        paragraphs in proptest::collection::vec("[a-zA-Z0-9 .,]{10,120}", 1..12)
    ) {
        let text = paragraphs.join("\n\n");
        let chunker = Chunker::new(ChunkingConfig {
            target_tokens: 30,
            overlap_tokens: 8,
            min_tokens: 2,
        }).expect("valid config");

        let chunks = chunker.chunk(&text);
        let mut covered = vec![false; text.len()];
        for chunk in &chunks {
            prop_assert_eq!(&text[chunk.start_char..chunk.end_char], chunk.text.as_str());
            for flag in &mut covered[chunk.start_char..chunk.end_char] {
                *flag = true;
            }
        }
        for (i, byte) in text.bytes().enumerate() {
            if !byte.is_ascii_whitespace() {
                prop_assert!(covered[i], "byte {} not covered", i);
            }
        }
    }

    /// Property: chunking never produces empty chunks or reversed spans.
    #[test]
    fn prop_chunks_are_well_formed(text in "[a-zA-Z0-9 .,\n]{0,600}") {
        let chunker = Chunker::with_defaults();
        for chunk in chunker.chunk(&text) {
            prop_assert!(chunk.start_char < chunk.end_char);
            prop_assert!(!chunk.text.trim().is_empty());
        }
    }
}
