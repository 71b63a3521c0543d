//! Entity resolution: fuzzy and LLM-assisted deduplication.
//!
//! The fingerprint identity on entities already collapses case and
//! whitespace variants; resolution handles the rest — "Microsoft Corp"
//! versus "Microsoft Corporation", initials, trailing legal suffixes.
//!
//! # How a merge works
//!
//! 1. Mention counts union onto the primary.
//! 2. Duplicate names (and their aliases) become aliases of the primary.
//! 3. MENTIONED_IN links transfer, deduplicated.
//! 4. Incoming and outgoing relations transfer; the max-confidence variant
//!    of each `(source, type, target)` triple survives.
//! 5. Duplicates are detach-deleted.
//! 6. A requested canonical name renames the primary only when no other
//!    entity of the kind owns it; otherwise it is preserved as an alias.
//!
//! Merges are idempotent: re-merging an already-absorbed id is a no-op.
//! A per-primary lock keeps concurrent merges from interleaving relation
//! transfers.

use crate::config::ResolutionConfig;
use crate::llm::prompts::build_resolution_prompt;
use crate::llm::LlmGateway;
use crate::models::{Entity, EntityId, EntityKind, Relation, normalize_name};
use crate::storage::GraphStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A fuzzy-similar entity candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarEntity {
    /// The candidate entity.
    pub entity: Entity,
    /// Similarity to the probe name, 0.0 to 1.0.
    pub similarity: f64,
}

/// A candidate duplicate pair, `a.id < b.id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePair {
    /// First entity of the pair.
    pub a: Entity,
    /// Second entity of the pair.
    pub b: Entity,
    /// Name similarity, 0.0 to 1.0.
    pub similarity: f64,
}

/// LLM adjudication of an ambiguous pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResolution {
    /// Whether the entities refer to the same subject.
    pub are_same: bool,
    /// Confidence in the verdict, 0.0 to 1.0.
    #[serde(default)]
    pub confidence: f32,
    /// Preferred canonical name when merging.
    #[serde(default)]
    pub canonical_name: String,
    /// Model reasoning, for operator review.
    #[serde(default)]
    pub reasoning: String,
}

/// Result of a merge operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Duplicates actually absorbed (absent ids are skipped).
    pub merged_count: usize,
    /// Aliases on the primary after the merge.
    pub aliases: Vec<String>,
    /// The primary's name after any canonical rename.
    pub final_name: String,
}

/// Report from a corpus-wide resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    /// Pairs examined.
    pub pairs_considered: usize,
    /// Merges performed.
    pub merges_applied: usize,
    /// Pairs left for operator review.
    pub pairs_deferred: usize,
}

/// Computes name similarity: case-folded, whitespace-collapsed, exact
/// matches short-circuit to 1.0, otherwise Jaro-Winkler.
#[must_use]
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a == b {
        return 1.0;
    }
    strsim::jaro_winkler(&a, &b)
}

/// Fuzzy and LLM-assisted entity deduplication.
pub struct EntityResolver {
    store: Arc<dyn GraphStore>,
    gateway: Option<Arc<LlmGateway>>,
    config: ResolutionConfig,
    /// Primaries with a merge in flight.
    merge_locks: Mutex<Vec<EntityId>>,
}

impl EntityResolver {
    /// Creates a resolver. The gateway is optional; without it, ambiguous
    /// pairs are deferred to the operator.
    #[must_use]
    pub fn new(
        store: Arc<dyn GraphStore>,
        gateway: Option<Arc<LlmGateway>>,
        config: ResolutionConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
            merge_locks: Mutex::new(Vec::new()),
        }
    }

    /// Finds entities of a kind whose names are similar to `name`.
    ///
    /// Exact matches are excluded; callers already have those via the
    /// fingerprint. Sorted by similarity descending.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn find_similar(
        &self,
        name: &str,
        kind: EntityKind,
        threshold: Option<f64>,
    ) -> Result<Vec<SimilarEntity>> {
        let threshold = threshold.unwrap_or(self.config.similarity_threshold);
        let mut out: Vec<SimilarEntity> = self
            .store
            .entities_by_kind(Some(kind))?
            .into_iter()
            .filter_map(|entity| {
                let similarity = name_similarity(name, &entity.name);
                (similarity >= threshold && similarity < 1.0)
                    .then_some(SimilarEntity { entity, similarity })
            })
            .collect();
        out.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(out)
    }

    /// Finds all candidate duplicate pairs, optionally within one kind.
    ///
    /// Pairwise within a kind (entities of different kinds never pair).
    /// Pairs are ordered `a.id < b.id` and sorted by similarity descending.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn find_duplicate_pairs(
        &self,
        kind: Option<EntityKind>,
        threshold: Option<f64>,
    ) -> Result<Vec<DuplicatePair>> {
        let threshold = threshold.unwrap_or(self.config.similarity_threshold);
        let entities = self.store.entities_by_kind(kind)?;

        let mut by_kind: HashMap<EntityKind, Vec<&Entity>> = HashMap::new();
        for entity in &entities {
            by_kind.entry(entity.kind).or_default().push(entity);
        }

        let mut pairs = Vec::new();
        for group in by_kind.values() {
            for (i, first) in group.iter().enumerate() {
                for second in &group[i + 1..] {
                    let similarity = name_similarity(&first.name, &second.name);
                    if similarity >= threshold {
                        let (a, b) = if first.id < second.id {
                            (*first, *second)
                        } else {
                            (*second, *first)
                        };
                        pairs.push(DuplicatePair {
                            a: a.clone(),
                            b: b.clone(),
                            similarity,
                        });
                    }
                }
            }
        }
        pairs.sort_by(|x, y| {
            y.similarity
                .partial_cmp(&x.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(pairs)
    }

    /// Asks the LLM whether an ambiguous pair refers to the same subject.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when no gateway is configured; propagates gateway
    /// failures otherwise.
    pub fn resolve_with_llm(&self, a: &Entity, b: &Entity) -> Result<LlmResolution> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| Error::internal("resolve_with_llm", "no LLM gateway configured"))?;
        let prompt =
            build_resolution_prompt(&a.name, &a.description, &b.name, &b.description);
        let mut resolution: LlmResolution = gateway.generate_json("resolve_entities", &prompt, 0.0)?;
        resolution.confidence = resolution.confidence.clamp(0.0, 1.0);
        Ok(resolution)
    }

    /// Merges duplicates into a primary entity.
    ///
    /// Absorbed or unknown duplicate ids are skipped, which is what makes
    /// repeated merges no-ops.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the primary does not exist; propagates
    /// storage failures.
    pub fn merge(
        &self,
        primary_id: &EntityId,
        duplicate_ids: &[EntityId],
        canonical_name: Option<&str>,
    ) -> Result<MergeOutcome> {
        let _guard = MergeGuard::acquire(&self.merge_locks, primary_id)?;

        let mut primary = self
            .store
            .get_entity(primary_id)?
            .ok_or_else(|| Error::not_found("entity", primary_id.as_str()))?;
        let base_mentions = primary.mention_count;
        let mut absorbed_mentions = 0_u32;
        let mut merged_count = 0;

        for duplicate_id in duplicate_ids {
            if duplicate_id == primary_id {
                continue;
            }
            let Some(duplicate) = self.store.get_entity(duplicate_id)? else {
                // Already absorbed by an earlier merge.
                continue;
            };

            // 1-2: counters and aliases.
            absorbed_mentions += duplicate.mention_count;
            primary.push_alias(duplicate.name.clone());
            for alias in &duplicate.aliases {
                primary.push_alias(alias.clone());
            }
            primary.confidence = primary.confidence.max(duplicate.confidence);

            // 3: transfer grounding links, deduplicated by the store.
            for text_unit in self.store.mentions_of(duplicate_id)? {
                self.store.link_mention(primary_id, &text_unit)?;
            }

            // 4: transfer relations, keeping the max-confidence variant per
            // (source, type, target). The store's take-max upsert does the
            // bookkeeping.
            for relation in self.store.relations_of(duplicate_id)? {
                let source = if relation.source == *duplicate_id {
                    primary_id.clone()
                } else {
                    relation.source.clone()
                };
                let target = if relation.target == *duplicate_id {
                    primary_id.clone()
                } else {
                    relation.target.clone()
                };
                if source == target {
                    continue;
                }
                self.store.upsert_relation(&Relation {
                    source,
                    target,
                    ..relation
                })?;
            }

            // 5: detach-delete.
            self.store.delete_entity(duplicate_id)?;
            merged_count += 1;
            tracing::info!(
                primary = primary_id.as_str(),
                duplicate = duplicate_id.as_str(),
                "merged duplicate entity"
            );
        }

        // Mention count: distinct transferred links when grounded, summed
        // counters when the graph carries no mention edges at all.
        let linked = self.store.mentions_of(primary_id)?.len();
        #[allow(clippy::cast_possible_truncation)]
        {
            primary.mention_count = if linked > 0 {
                linked as u32
            } else {
                base_mentions + absorbed_mentions
            };
        }

        // 6: conditional canonical rename.
        if let Some(canonical) = canonical_name {
            if normalize_name(canonical) != normalize_name(&primary.name) {
                let owner = self.store.find_entity_by_name(canonical, Some(primary.kind))?;
                let taken = owner.is_some_and(|o| o.id != primary.id);
                if taken {
                    primary.push_alias(canonical.to_string());
                } else {
                    let previous = std::mem::replace(&mut primary.name, canonical.to_string());
                    primary.push_alias(previous);
                    // Drop the new canonical name from aliases if it was one.
                    let canonical_norm = normalize_name(canonical);
                    primary.aliases.retain(|a| normalize_name(a) != canonical_norm);
                }
            }
        }

        self.store.update_entity(&primary)?;

        // Community summaries over the touched entity are stale now.
        if let Ok(Some(community)) = self.store.entity_community(primary_id, 0) {
            let _ = self.store.mark_communities_stale(&[community]);
        }

        Ok(MergeOutcome {
            merged_count,
            aliases: primary.aliases.clone(),
            final_name: primary.name,
        })
    }

    /// Runs a corpus-wide resolution pass.
    ///
    /// With a gateway, ambiguous pairs go to the LLM and merge when the
    /// verdict confidence clears `auto_merge_threshold`. Without one, only
    /// near-certain pairs (similarity at or above the auto-merge threshold)
    /// merge; the rest are deferred.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; per-pair LLM failures defer the pair.
    pub fn resolve_all(&self, apply: bool) -> Result<ResolutionReport> {
        let mut report = ResolutionReport::default();
        let pairs = self.find_duplicate_pairs(None, None)?;
        report.pairs_considered = pairs.len();

        for pair in pairs {
            // Either side may have been absorbed by an earlier merge.
            if self.store.get_entity(&pair.a.id)?.is_none()
                || self.store.get_entity(&pair.b.id)?.is_none()
            {
                continue;
            }
            let decision = self.adjudicate(&pair);
            match decision {
                Some((canonical, confidence))
                    if confidence >= self.config.auto_merge_threshold && apply =>
                {
                    self.merge(&pair.a.id, &[pair.b.id.clone()], canonical.as_deref())?;
                    report.merges_applied += 1;
                },
                _ => report.pairs_deferred += 1,
            }
        }
        Ok(report)
    }

    /// Produces `(canonical_name, confidence)` for a pair, or `None` when
    /// the pair should stay separate.
    fn adjudicate(&self, pair: &DuplicatePair) -> Option<(Option<String>, f32)> {
        if self.config.use_llm && self.gateway.is_some() {
            match self.resolve_with_llm(&pair.a, &pair.b) {
                Ok(resolution) if resolution.are_same => {
                    let canonical = (!resolution.canonical_name.is_empty())
                        .then_some(resolution.canonical_name);
                    return Some((canonical, resolution.confidence));
                },
                Ok(_) => return None,
                Err(e) => {
                    tracing::warn!(
                        a = pair.a.name,
                        b = pair.b.name,
                        "LLM resolution failed, deferring pair: {e}"
                    );
                    return None;
                },
            }
        }
        // Lexical-only mode: similarity is the only evidence.
        #[allow(clippy::cast_possible_truncation)]
        Some((None, pair.similarity as f32))
    }
}

/// Per-primary merge lock; dropping releases it.
struct MergeGuard<'a> {
    locks: &'a Mutex<Vec<EntityId>>,
    id: EntityId,
}

impl<'a> MergeGuard<'a> {
    fn acquire(locks: &'a Mutex<Vec<EntityId>>, id: &EntityId) -> Result<Self> {
        loop {
            {
                let mut held = locks
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !held.contains(id) {
                    held.push(id.clone());
                    return Ok(Self {
                        locks,
                        id: id.clone(),
                    });
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        held.retain(|held_id| held_id != &self.id);
    }
}
