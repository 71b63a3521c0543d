//! Property-graph storage backends.
//!
//! The [`GraphStore`] trait is the engine's only view of persistence:
//! entities, relations, text units, documents, and community assignments.
//! Two implementations ship:
//!
//! | Backend | Use Case | Features |
//! |---------|----------|----------|
//! | [`SqliteGraphStore`] | Default; embedded | Schema-enforced UNIQUE constraints |
//! | [`MemoryGraphStore`] | Testing, small corpora | Fast, no persistence |
//!
//! # Concurrency
//!
//! - Methods take `&self`; backends use interior mutability and are shared
//!   via `Arc<dyn GraphStore>`.
//! - The UNIQUE constraint on `(normalized name, kind)` is the cross-worker
//!   deduplication point: concurrent upserts of the same entity converge
//!   onto one node with take-max confidence and summed mention counts.
//! - A `GraphConstraint` error from an upsert means another worker won the
//!   race; callers re-read and continue (success-after-convergence).
//!
//! # Traversal semantics
//!
//! `entity_context` walks semantic relations only. IN_COMMUNITY and
//! PART_OF structure edges never participate in BFS, and MENTIONED_IN is
//! only followed to collect supporting text.

mod memory;
mod sqlite;

pub use memory::MemoryGraphStore;
pub use sqlite::SqliteGraphStore;

use crate::Result;
use crate::models::{
    Community, CommunitySummary, Document, DocumentStatus, Entity, EntityId, EntityKind, Relation,
    RelationType, TextUnit,
};
use serde::{Deserialize, Serialize};

/// Counts of the major node and edge populations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Number of documents.
    pub documents: usize,
    /// Number of text units.
    pub text_units: usize,
    /// Number of entities.
    pub entities: usize,
    /// Number of relations.
    pub relations: usize,
    /// Number of communities across all levels.
    pub communities: usize,
}

/// An entity reached during neighborhood traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedEntity {
    /// The neighbor entity.
    pub entity: Entity,
    /// Label of the edge that first reached it.
    pub rel_type: RelationType,
    /// Hop distance from the seed.
    pub distance: u32,
}

/// Neighborhood context around one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    /// Neighbors within the hop limit, nearest first.
    pub related_entities: Vec<RelatedEntity>,
    /// Supporting text units, when requested.
    pub text_units: Vec<TextUnit>,
}

/// Distinct relation type incident on a set of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationTypeStat {
    /// The relation label.
    pub rel_type: RelationType,
    /// How many edges carry the label.
    pub frequency: usize,
    /// Mean confidence across those edges.
    pub avg_confidence: f32,
}

/// What a document deletion removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedSubgraph {
    /// Text units removed.
    pub text_units: usize,
    /// Entities whose mention count dropped to zero and were removed.
    pub entities: usize,
    /// Relations removed alongside their endpoints.
    pub relations: usize,
}

/// Communities and entities touched by a document, for invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedCommunities {
    /// Community ids whose summaries need refreshing.
    pub communities: Vec<i64>,
    /// Entities grounded in the document.
    pub entities: Vec<EntityId>,
}

/// Trait for property-graph storage backends.
///
/// # Implementor Notes
///
/// - All operations are idempotent unless documented otherwise.
/// - `create_text_unit` is the one deliberate exception: an existing id is
///   a `GraphConstraint` error.
/// - Ordering contracts matter: `top_entities` is `(mention_count desc,
///   confidence desc)` and `related_entities` is `(relation confidence
///   desc, mention_count desc)`.
pub trait GraphStore: Send + Sync {
    // ========================================================================
    // Documents
    // ========================================================================

    /// Inserts or updates a document.
    ///
    /// When the stored content hash differs from the incoming one, the
    /// version increments and the status resets to pending. Returns the
    /// stored row.
    fn upsert_document(&self, document: &Document) -> Result<Document>;

    /// Fetches a document by id.
    fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Updates a document's processing status and timestamp.
    fn set_document_status(&self, id: &str, status: DocumentStatus) -> Result<()>;

    /// Lists all documents.
    fn list_documents(&self) -> Result<Vec<Document>>;

    // ========================================================================
    // Text units
    // ========================================================================

    /// Creates a text unit. Fails with `GraphConstraint` if the id exists.
    fn create_text_unit(&self, unit: &TextUnit) -> Result<()>;

    /// Fetches a text unit by id.
    fn get_text_unit(&self, id: &str) -> Result<Option<TextUnit>>;

    // ========================================================================
    // Entities
    // ========================================================================

    /// Inserts or updates an entity observation.
    ///
    /// Identity is the `(normalized name, kind)` fingerprint. On update the
    /// confidence is take-max, the mention count increments, and a longer
    /// description wins. Returns the entity id.
    fn upsert_entity(
        &self,
        name: &str,
        kind: EntityKind,
        description: &str,
        confidence: f32,
        document_id: Option<&str>,
    ) -> Result<EntityId>;

    /// Fetches an entity by id.
    fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>>;

    /// Finds an entity by canonical name or alias, optionally restricted to
    /// a kind. Name matching is case-insensitive.
    fn find_entity_by_name(&self, name: &str, kind: Option<EntityKind>) -> Result<Option<Entity>>;

    /// Returns entities ordered by `(mention_count desc, confidence desc)`,
    /// optionally restricted to one document.
    fn top_entities(&self, limit: usize, document_id: Option<&str>) -> Result<Vec<Entity>>;

    /// Returns entities of a kind (or all), unordered beyond id stability.
    fn entities_by_kind(&self, kind: Option<EntityKind>) -> Result<Vec<Entity>>;

    /// Rewrites a stored entity (rename, aliases, counters). The id must
    /// already exist.
    fn update_entity(&self, entity: &Entity) -> Result<()>;

    /// Deletes an entity plus incident relations and mentions. Returns
    /// whether it existed.
    fn delete_entity(&self, id: &EntityId) -> Result<bool>;

    // ========================================================================
    // Mentions
    // ========================================================================

    /// Links an entity to a supporting text unit. Idempotent.
    fn link_mention(&self, entity_id: &EntityId, text_unit_id: &str) -> Result<()>;

    /// Returns the text-unit ids mentioning an entity.
    fn mentions_of(&self, entity_id: &EntityId) -> Result<Vec<String>>;

    /// Returns supporting text units for an entity, newest first.
    fn text_units_for_entity(&self, entity_id: &EntityId, limit: usize) -> Result<Vec<TextUnit>>;

    // ========================================================================
    // Relations
    // ========================================================================

    /// Inserts or updates a relation. At most one edge exists per
    /// `(source, type, target)`; confidence is take-max on re-observation.
    fn upsert_relation(&self, relation: &Relation) -> Result<()>;

    /// Returns relations incident on an entity, both directions.
    fn relations_of(&self, entity_id: &EntityId) -> Result<Vec<Relation>>;

    /// Returns distinct relation types incident on the given entities with
    /// confidence above the floor, ordered by frequency descending.
    fn relation_types_for_entities(
        &self,
        entity_ids: &[EntityId],
        min_confidence: f32,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<RelationTypeStat>>;

    /// Returns candidate targets reachable from `source` via `rel_type`,
    /// ordered by `(relation confidence desc, mention_count desc)`.
    fn related_entities(
        &self,
        source: &EntityId,
        rel_type: &RelationType,
        document_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<(Entity, f32)>>;

    // ========================================================================
    // Traversal
    // ========================================================================

    /// BFS neighborhood up to `hop_limit` over semantic relations,
    /// optionally collecting supporting text units.
    fn entity_context(
        &self,
        entity_id: &EntityId,
        hop_limit: u32,
        include_text: bool,
    ) -> Result<EntityContext>;

    // ========================================================================
    // Document subgraph lifecycle
    // ========================================================================

    /// Removes a document's text units, entities whose mention count drops
    /// to zero, and their incident relations.
    fn delete_document_subgraph(&self, document_id: &str) -> Result<DeletedSubgraph>;

    /// Reports communities and entities touched by a document, for summary
    /// invalidation after incremental updates.
    fn list_affected_communities(&self, document_id: &str) -> Result<AffectedCommunities>;

    // ========================================================================
    // Communities
    // ========================================================================

    /// Replaces community assignments at a level for the given entities.
    fn assign_communities(&self, assignments: &[(EntityId, i64)], level: u32) -> Result<()>;

    /// Drops all assignments (and community rows) at a level, or everywhere.
    fn clear_communities(&self, level: Option<u32>) -> Result<()>;

    /// Returns the community an entity belongs to at a level.
    fn entity_community(&self, entity_id: &EntityId, level: u32) -> Result<Option<i64>>;

    /// Returns member entities of a community, ordered by mention count
    /// descending.
    fn community_members(&self, community_id: i64, level: u32) -> Result<Vec<Entity>>;

    /// Lists communities, optionally at one level.
    fn list_communities(&self, level: Option<u32>) -> Result<Vec<Community>>;

    /// Fetches one community.
    fn get_community(&self, community_id: i64, level: u32) -> Result<Option<Community>>;

    /// Stores a generated summary on a community.
    fn store_community_summary(
        &self,
        community_id: i64,
        level: u32,
        summary: &CommunitySummary,
    ) -> Result<()>;

    /// Flags community summaries as stale after membership changes.
    fn mark_communities_stale(&self, community_ids: &[i64]) -> Result<()>;

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Returns node and edge population counts.
    fn graph_statistics(&self) -> Result<GraphStats>;
}
