//! In-memory graph store.
//!
//! A single `RwLock` guards the whole graph so multi-map mutations
//! (deletes, merges, community reassignment) stay atomic: a concurrent
//! reader sees either the pre- or post-mutation graph, never a node with
//! dangling edges.

use super::{
    AffectedCommunities, DeletedSubgraph, EntityContext, GraphStats, GraphStore, RelatedEntity,
    RelationTypeStat,
};
use crate::models::{
    Community, CommunitySummary, Document, DocumentStatus, Entity, EntityId, EntityKind, Relation,
    RelationType, TextUnit, normalize_name,
};
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<String, Document>,
    text_units: HashMap<String, TextUnit>,
    entities: HashMap<EntityId, Entity>,
    relations: HashMap<(EntityId, RelationType, EntityId), Relation>,
    /// `(entity, text_unit)` pairs; `BTreeSet` keeps iteration stable.
    mentions: BTreeSet<(EntityId, String)>,
    communities: HashMap<(i64, u32), Community>,
    /// `(entity, level) -> community` membership.
    memberships: HashMap<(EntityId, u32), i64>,
}

impl Inner {
    fn lock_err(operation: &str) -> Error {
        Error::GraphUnavailable {
            operation: operation.to_string(),
            cause: "lock poisoned".to_string(),
        }
    }

    /// Documents an entity is grounded in, via its mentions.
    fn entity_documents(&self, entity_id: &EntityId) -> HashSet<String> {
        self.mentions
            .iter()
            .filter(|(e, _)| e == entity_id)
            .filter_map(|(_, tu)| self.text_units.get(tu).map(|t| t.document_id.clone()))
            .collect()
    }

    fn entity_in_documents(&self, entity_id: &EntityId, document_ids: &[String]) -> bool {
        let docs = self.entity_documents(entity_id);
        document_ids.iter().any(|d| docs.contains(d))
    }

    fn recount_mentions(&mut self, entity_id: &EntityId) {
        let count = self
            .mentions
            .iter()
            .filter(|(e, _)| e == entity_id)
            .count();
        if let Some(entity) = self.entities.get_mut(entity_id) {
            #[allow(clippy::cast_possible_truncation)]
            {
                entity.mention_count = count as u32;
            }
        }
    }

    fn remove_entity(&mut self, entity_id: &EntityId) -> usize {
        let before = self.relations.len();
        self.relations
            .retain(|(s, _, t), _| s != entity_id && t != entity_id);
        let removed_relations = before - self.relations.len();
        self.mentions.retain(|(e, _)| e != entity_id);
        self.memberships.retain(|(e, _), _| e != entity_id);
        self.entities.remove(entity_id);
        removed_relations
    }

    fn rebuild_community_sizes(&mut self) {
        let mut sizes: HashMap<(i64, u32), usize> = HashMap::new();
        for ((_, level), community_id) in &self.memberships {
            *sizes.entry((*community_id, *level)).or_default() += 1;
        }
        for (key, community) in &mut self.communities {
            community.size = sizes.get(key).copied().unwrap_or(0);
        }
    }
}

/// In-memory [`GraphStore`] implementation.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    inner: RwLock<Inner>,
}

impl MemoryGraphStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, operation: &str) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| Inner::lock_err(operation))
    }

    fn write(&self, operation: &str) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| Inner::lock_err(operation))
    }
}

/// Sorts entities by `(mention_count desc, confidence desc, name)`.
fn sort_by_prominence(entities: &mut [Entity]) {
    entities.sort_by(|a, b| {
        b.mention_count
            .cmp(&a.mention_count)
            .then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.name.cmp(&b.name))
    });
}

impl GraphStore for MemoryGraphStore {
    fn upsert_document(&self, document: &Document) -> Result<Document> {
        let mut inner = self.write("upsert_document")?;
        let stored = inner
            .documents
            .entry(document.id.clone())
            .and_modify(|existing| {
                if existing.content_hash != document.content_hash {
                    existing.version += 1;
                    existing.content_hash = document.content_hash.clone();
                    existing.status = DocumentStatus::Pending;
                }
                existing.name = document.name.clone();
                existing.file_path = document.file_path.clone();
            })
            .or_insert_with(|| document.clone())
            .clone();
        Ok(stored)
    }

    fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read("get_document")?.documents.get(id).cloned())
    }

    fn set_document_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        let mut inner = self.write("set_document_status")?;
        let document = inner
            .documents
            .get_mut(id)
            .ok_or_else(|| Error::not_found("document", id))?;
        document.status = status;
        if status == DocumentStatus::Completed {
            document.last_processed_at = Some(crate::current_timestamp());
        }
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<Document>> {
        let inner = self.read("list_documents")?;
        let mut docs: Vec<Document> = inner.documents.values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    fn create_text_unit(&self, unit: &TextUnit) -> Result<()> {
        let mut inner = self.write("create_text_unit")?;
        if inner.text_units.contains_key(&unit.id) {
            return Err(Error::GraphConstraint {
                operation: "create_text_unit".to_string(),
                cause: format!("text unit id already exists: {}", unit.id),
            });
        }
        inner.text_units.insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    fn get_text_unit(&self, id: &str) -> Result<Option<TextUnit>> {
        Ok(self.read("get_text_unit")?.text_units.get(id).cloned())
    }

    fn upsert_entity(
        &self,
        name: &str,
        kind: EntityKind,
        description: &str,
        confidence: f32,
        document_id: Option<&str>,
    ) -> Result<EntityId> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("entity name is empty".to_string()));
        }
        let id = EntityId::fingerprint(name, kind);
        let mut inner = self.write("upsert_entity")?;
        if let Some(existing) = inner.entities.get_mut(&id) {
            existing.absorb_observation(description, confidence);
        } else {
            let entity = Entity::new(name, kind)
                .with_description(description)
                .with_confidence(confidence);
            let entity = match document_id {
                Some(doc) => entity.with_document(doc),
                None => entity,
            };
            inner.entities.insert(id.clone(), entity);
        }
        Ok(id)
    }

    fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        Ok(self.read("get_entity")?.entities.get(id).cloned())
    }

    fn find_entity_by_name(&self, name: &str, kind: Option<EntityKind>) -> Result<Option<Entity>> {
        let inner = self.read("find_entity_by_name")?;
        let normalized = normalize_name(name);
        let mut matches: Vec<&Entity> = inner
            .entities
            .values()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .filter(|e| e.matches_name(&normalized))
            .collect();
        // Prefer canonical-name matches over alias matches, then prominence.
        matches.sort_by(|a, b| {
            let a_canonical = normalize_name(&a.name) == normalized;
            let b_canonical = normalize_name(&b.name) == normalized;
            b_canonical
                .cmp(&a_canonical)
                .then_with(|| b.mention_count.cmp(&a.mention_count))
        });
        Ok(matches.first().map(|e| (*e).clone()))
    }

    fn top_entities(&self, limit: usize, document_id: Option<&str>) -> Result<Vec<Entity>> {
        let inner = self.read("top_entities")?;
        let mut entities: Vec<Entity> = match document_id {
            Some(doc) => {
                let doc = doc.to_string();
                inner
                    .entities
                    .iter()
                    .filter(|(id, _)| inner.entity_in_documents(id, std::slice::from_ref(&doc)))
                    .map(|(_, e)| e.clone())
                    .collect()
            },
            None => inner.entities.values().cloned().collect(),
        };
        sort_by_prominence(&mut entities);
        entities.truncate(limit);
        Ok(entities)
    }

    fn entities_by_kind(&self, kind: Option<EntityKind>) -> Result<Vec<Entity>> {
        let inner = self.read("entities_by_kind")?;
        let mut entities: Vec<Entity> = inner
            .entities
            .values()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }

    fn update_entity(&self, entity: &Entity) -> Result<()> {
        let mut inner = self.write("update_entity")?;
        if !inner.entities.contains_key(&entity.id) {
            return Err(Error::not_found("entity", entity.id.as_str()));
        }
        inner.entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    fn delete_entity(&self, id: &EntityId) -> Result<bool> {
        let mut inner = self.write("delete_entity")?;
        if !inner.entities.contains_key(id) {
            return Ok(false);
        }
        inner.remove_entity(id);
        Ok(true)
    }

    fn link_mention(&self, entity_id: &EntityId, text_unit_id: &str) -> Result<()> {
        let mut inner = self.write("link_mention")?;
        if !inner.entities.contains_key(entity_id) {
            return Err(Error::not_found("entity", entity_id.as_str()));
        }
        if !inner.text_units.contains_key(text_unit_id) {
            return Err(Error::not_found("text unit", text_unit_id));
        }
        inner
            .mentions
            .insert((entity_id.clone(), text_unit_id.to_string()));
        inner.recount_mentions(entity_id);
        Ok(())
    }

    fn mentions_of(&self, entity_id: &EntityId) -> Result<Vec<String>> {
        let inner = self.read("mentions_of")?;
        Ok(inner
            .mentions
            .iter()
            .filter(|(e, _)| e == entity_id)
            .map(|(_, tu)| tu.clone())
            .collect())
    }

    fn text_units_for_entity(&self, entity_id: &EntityId, limit: usize) -> Result<Vec<TextUnit>> {
        let inner = self.read("text_units_for_entity")?;
        let mut units: Vec<TextUnit> = inner
            .mentions
            .iter()
            .filter(|(e, _)| e == entity_id)
            .filter_map(|(_, tu)| inner.text_units.get(tu).cloned())
            .collect();
        units.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        units.truncate(limit);
        Ok(units)
    }

    fn upsert_relation(&self, relation: &Relation) -> Result<()> {
        if relation.rel_type.is_empty() {
            return Err(Error::InvalidInput("relation type is empty".to_string()));
        }
        let mut inner = self.write("upsert_relation")?;
        if !inner.entities.contains_key(&relation.source) {
            return Err(Error::not_found("entity", relation.source.as_str()));
        }
        if !inner.entities.contains_key(&relation.target) {
            return Err(Error::not_found("entity", relation.target.as_str()));
        }
        let key = (
            relation.source.clone(),
            relation.rel_type.clone(),
            relation.target.clone(),
        );
        inner
            .relations
            .entry(key)
            .and_modify(|existing| {
                existing.confidence = existing.confidence.max(relation.confidence);
                if relation.description.len() > existing.description.len() {
                    existing.description = relation.description.clone();
                }
                if existing.strength.is_none() {
                    existing.strength = relation.strength;
                }
            })
            .or_insert_with(|| relation.clone());
        Ok(())
    }

    fn relations_of(&self, entity_id: &EntityId) -> Result<Vec<Relation>> {
        let inner = self.read("relations_of")?;
        let mut relations: Vec<Relation> = inner
            .relations
            .values()
            .filter(|r| &r.source == entity_id || &r.target == entity_id)
            .cloned()
            .collect();
        relations.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(relations)
    }

    fn relation_types_for_entities(
        &self,
        entity_ids: &[EntityId],
        min_confidence: f32,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<RelationTypeStat>> {
        let inner = self.read("relation_types_for_entities")?;
        let id_set: HashSet<&EntityId> = entity_ids.iter().collect();
        let mut stats: HashMap<RelationType, (usize, f32)> = HashMap::new();

        for relation in inner.relations.values() {
            if relation.confidence <= min_confidence {
                continue;
            }
            if !id_set.contains(&relation.source) && !id_set.contains(&relation.target) {
                continue;
            }
            if let Some(docs) = document_ids {
                if !inner.entity_in_documents(&relation.source, docs)
                    || !inner.entity_in_documents(&relation.target, docs)
                {
                    continue;
                }
            }
            let entry = stats.entry(relation.rel_type.clone()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += relation.confidence;
        }

        let mut out: Vec<RelationTypeStat> = stats
            .into_iter()
            .map(|(rel_type, (frequency, total))| RelationTypeStat {
                rel_type,
                frequency,
                #[allow(clippy::cast_precision_loss)]
                avg_confidence: total / frequency as f32,
            })
            .collect();
        out.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.rel_type.as_str().cmp(b.rel_type.as_str()))
        });
        Ok(out)
    }

    fn related_entities(
        &self,
        source: &EntityId,
        rel_type: &RelationType,
        document_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<(Entity, f32)>> {
        let inner = self.read("related_entities")?;
        let mut candidates: Vec<(Entity, f32)> = inner
            .relations
            .values()
            .filter(|r| &r.source == source && &r.rel_type == rel_type)
            .filter(|r| {
                document_ids
                    .is_none_or(|docs| inner.entity_in_documents(&r.target, docs))
            })
            .filter_map(|r| {
                inner
                    .entities
                    .get(&r.target)
                    .map(|e| (e.clone(), r.confidence))
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.mention_count.cmp(&a.0.mention_count))
                .then_with(|| a.0.name.cmp(&b.0.name))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn entity_context(
        &self,
        entity_id: &EntityId,
        hop_limit: u32,
        include_text: bool,
    ) -> Result<EntityContext> {
        let inner = self.read("entity_context")?;
        if !inner.entities.contains_key(entity_id) {
            return Err(Error::not_found("entity", entity_id.as_str()));
        }

        let mut context = EntityContext::default();
        let mut visited: HashSet<EntityId> = HashSet::from([entity_id.clone()]);
        let mut frontier: VecDeque<(EntityId, u32)> = VecDeque::from([(entity_id.clone(), 0)]);

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= hop_limit {
                continue;
            }
            let mut neighbors: Vec<(EntityId, RelationType)> = inner
                .relations
                .values()
                .filter_map(|r| {
                    if r.source == current {
                        Some((r.target.clone(), r.rel_type.clone()))
                    } else if r.target == current {
                        Some((r.source.clone(), r.rel_type.clone()))
                    } else {
                        None
                    }
                })
                .collect();
            neighbors.sort_by(|a, b| a.0.cmp(&b.0));

            for (neighbor_id, rel_type) in neighbors {
                if !visited.insert(neighbor_id.clone()) {
                    continue;
                }
                if let Some(entity) = inner.entities.get(&neighbor_id) {
                    context.related_entities.push(RelatedEntity {
                        entity: entity.clone(),
                        rel_type,
                        distance: depth + 1,
                    });
                }
                frontier.push_back((neighbor_id, depth + 1));
            }
        }

        if include_text {
            let mut seen: HashSet<String> = HashSet::new();
            let mut ids: Vec<&EntityId> = vec![entity_id];
            ids.extend(context.related_entities.iter().map(|r| &r.entity.id));
            for id in ids {
                for (_, tu) in inner.mentions.iter().filter(|(e, _)| e == id) {
                    if seen.insert(tu.clone()) {
                        if let Some(unit) = inner.text_units.get(tu) {
                            context.text_units.push(unit.clone());
                        }
                    }
                }
            }
        }

        Ok(context)
    }

    fn delete_document_subgraph(&self, document_id: &str) -> Result<DeletedSubgraph> {
        let mut inner = self.write("delete_document_subgraph")?;
        let mut deleted = DeletedSubgraph::default();

        let unit_ids: Vec<String> = inner
            .text_units
            .values()
            .filter(|t| t.document_id == document_id)
            .map(|t| t.id.clone())
            .collect();
        deleted.text_units = unit_ids.len();

        let touched: HashSet<EntityId> = inner
            .mentions
            .iter()
            .filter(|(_, tu)| unit_ids.contains(tu))
            .map(|(e, _)| e.clone())
            .collect();

        for unit_id in &unit_ids {
            inner.text_units.remove(unit_id);
        }
        inner.mentions.retain(|(_, tu)| !unit_ids.contains(tu));

        for entity_id in touched {
            inner.recount_mentions(&entity_id);
            let dangling = inner
                .entities
                .get(&entity_id)
                .is_some_and(|e| e.mention_count == 0);
            if dangling {
                deleted.relations += inner.remove_entity(&entity_id);
                deleted.entities += 1;
            }
        }
        inner.rebuild_community_sizes();

        inner.documents.remove(document_id);
        Ok(deleted)
    }

    fn list_affected_communities(&self, document_id: &str) -> Result<AffectedCommunities> {
        let inner = self.read("list_affected_communities")?;
        let doc = document_id.to_string();
        let mut entities: Vec<EntityId> = inner
            .entities
            .keys()
            .filter(|id| inner.entity_in_documents(id, std::slice::from_ref(&doc)))
            .cloned()
            .collect();
        entities.sort();

        let mut communities: BTreeSet<i64> = BTreeSet::new();
        for entity_id in &entities {
            for ((member, _), community_id) in &inner.memberships {
                if member == entity_id {
                    communities.insert(*community_id);
                }
            }
        }
        Ok(AffectedCommunities {
            communities: communities.into_iter().collect(),
            entities,
        })
    }

    fn assign_communities(&self, assignments: &[(EntityId, i64)], level: u32) -> Result<()> {
        let mut inner = self.write("assign_communities")?;
        for (entity_id, community_id) in assignments {
            if !inner.entities.contains_key(entity_id) {
                return Err(Error::not_found("entity", entity_id.as_str()));
            }
            inner
                .memberships
                .insert((entity_id.clone(), level), *community_id);
            inner
                .communities
                .entry((*community_id, level))
                .or_insert_with(|| Community::new(*community_id, level, 0));
        }
        inner.rebuild_community_sizes();
        inner.communities.retain(|_, c| c.size > 0);
        Ok(())
    }

    fn clear_communities(&self, level: Option<u32>) -> Result<()> {
        let mut inner = self.write("clear_communities")?;
        match level {
            Some(level) => {
                inner.memberships.retain(|(_, l), _| *l != level);
                inner.communities.retain(|(_, l), _| *l != level);
            },
            None => {
                inner.memberships.clear();
                inner.communities.clear();
            },
        }
        Ok(())
    }

    fn entity_community(&self, entity_id: &EntityId, level: u32) -> Result<Option<i64>> {
        let inner = self.read("entity_community")?;
        Ok(inner.memberships.get(&(entity_id.clone(), level)).copied())
    }

    fn community_members(&self, community_id: i64, level: u32) -> Result<Vec<Entity>> {
        let inner = self.read("community_members")?;
        let mut members: Vec<Entity> = inner
            .memberships
            .iter()
            .filter(|((_, l), c)| *l == level && **c == community_id)
            .filter_map(|((e, _), _)| inner.entities.get(e).cloned())
            .collect();
        sort_by_prominence(&mut members);
        Ok(members)
    }

    fn list_communities(&self, level: Option<u32>) -> Result<Vec<Community>> {
        let inner = self.read("list_communities")?;
        let mut communities: Vec<Community> = inner
            .communities
            .iter()
            .filter(|((_, l), _)| level.is_none_or(|wanted| *l == wanted))
            .map(|(_, c)| c.clone())
            .collect();
        communities.sort_by(|a, b| a.level.cmp(&b.level).then(a.id.cmp(&b.id)));
        Ok(communities)
    }

    fn get_community(&self, community_id: i64, level: u32) -> Result<Option<Community>> {
        let inner = self.read("get_community")?;
        Ok(inner.communities.get(&(community_id, level)).cloned())
    }

    fn store_community_summary(
        &self,
        community_id: i64,
        level: u32,
        summary: &CommunitySummary,
    ) -> Result<()> {
        let mut inner = self.write("store_community_summary")?;
        let community = inner
            .communities
            .get_mut(&(community_id, level))
            .ok_or_else(|| Error::not_found("community", community_id.to_string()))?;
        community.apply_summary(summary.clone());
        Ok(())
    }

    fn mark_communities_stale(&self, community_ids: &[i64]) -> Result<()> {
        let mut inner = self.write("mark_communities_stale")?;
        for ((id, _), community) in &mut inner.communities {
            if community_ids.contains(id) {
                community.stale = true;
            }
        }
        Ok(())
    }

    fn graph_statistics(&self) -> Result<GraphStats> {
        let inner = self.read("graph_statistics")?;
        Ok(GraphStats {
            documents: inner.documents.len(),
            text_units: inner.text_units.len(),
            entities: inner.entities.len(),
            relations: inner.relations.len(),
            communities: inner.communities.len(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn store_with_doc() -> (MemoryGraphStore, String) {
        let store = MemoryGraphStore::new();
        let doc = Document::new("doc-1", "notes.md", "/tmp/notes.md", "hash-a");
        store.upsert_document(&doc).unwrap();
        let unit = TextUnit::new("tu-1", "doc-1", "Alice works at Acme Corp.", 0, 25);
        store.create_text_unit(&unit).unwrap();
        (store, "tu-1".to_string())
    }

    #[test]
    fn test_upsert_entity_deduplicates_by_fingerprint() {
        let (store, unit) = store_with_doc();
        let a = store
            .upsert_entity("Alice", EntityKind::Person, "a person", 0.8, Some("doc-1"))
            .unwrap();
        let b = store
            .upsert_entity("alice", EntityKind::Person, "a person again", 0.9, None)
            .unwrap();
        assert_eq!(a, b);

        store.link_mention(&a, &unit).unwrap();
        let entity = store.get_entity(&a).unwrap().unwrap();
        assert_eq!(entity.mention_count, 1, "mentions recounted from links");
        assert!((entity.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_upsert_then_find_by_name() {
        let (store, _) = store_with_doc();
        store
            .upsert_entity("Acme Corp", EntityKind::Organization, "", 1.0, None)
            .unwrap();
        let found = store
            .find_entity_by_name("acme corp", Some(EntityKind::Organization))
            .unwrap();
        assert!(found.is_some_and(|e| e.name == "Acme Corp"));
    }

    #[test]
    fn test_duplicate_text_unit_is_constraint_error() {
        let (store, _) = store_with_doc();
        let unit = TextUnit::new("tu-1", "doc-1", "again", 0, 5);
        let result = store.create_text_unit(&unit);
        assert!(matches!(result, Err(Error::GraphConstraint { .. })));
    }

    #[test]
    fn test_relation_upsert_is_take_max() {
        let (store, _) = store_with_doc();
        let a = store
            .upsert_entity("Alice", EntityKind::Person, "", 1.0, None)
            .unwrap();
        let b = store
            .upsert_entity("Acme", EntityKind::Organization, "", 1.0, None)
            .unwrap();

        let rel = Relation::new(a.clone(), b.clone(), RelationType::new("WORKS_AT"))
            .with_confidence(0.5);
        store.upsert_relation(&rel).unwrap();
        let rel2 = Relation::new(a.clone(), b, RelationType::new("WORKS_AT")).with_confidence(0.9);
        store.upsert_relation(&rel2).unwrap();

        let relations = store.relations_of(&a).unwrap();
        assert_eq!(relations.len(), 1);
        assert!((relations[0].confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_entity_context_respects_hop_limit() {
        let (store, _) = store_with_doc();
        let a = store
            .upsert_entity("A", EntityKind::Concept, "", 1.0, None)
            .unwrap();
        let b = store
            .upsert_entity("B", EntityKind::Concept, "", 1.0, None)
            .unwrap();
        let c = store
            .upsert_entity("C", EntityKind::Concept, "", 1.0, None)
            .unwrap();
        store
            .upsert_relation(&Relation::new(a.clone(), b.clone(), RelationType::new("R1")))
            .unwrap();
        store
            .upsert_relation(&Relation::new(b, c, RelationType::new("R2")))
            .unwrap();

        let one_hop = store.entity_context(&a, 1, false).unwrap();
        assert_eq!(one_hop.related_entities.len(), 1);

        let two_hop = store.entity_context(&a, 2, false).unwrap();
        assert_eq!(two_hop.related_entities.len(), 2);
        assert_eq!(two_hop.related_entities[1].distance, 2);
    }

    #[test]
    fn test_delete_document_subgraph_removes_dangling_entities() {
        let (store, unit) = store_with_doc();
        let a = store
            .upsert_entity("Alice", EntityKind::Person, "", 1.0, Some("doc-1"))
            .unwrap();
        let b = store
            .upsert_entity("Acme", EntityKind::Organization, "", 1.0, Some("doc-1"))
            .unwrap();
        store.link_mention(&a, &unit).unwrap();
        store.link_mention(&b, &unit).unwrap();
        store
            .upsert_relation(&Relation::new(a.clone(), b, RelationType::new("WORKS_AT")))
            .unwrap();

        let before = store.graph_statistics().unwrap();
        assert_eq!(before.entities, 2);

        let deleted = store.delete_document_subgraph("doc-1").unwrap();
        assert_eq!(deleted.text_units, 1);
        assert_eq!(deleted.entities, 2);
        assert_eq!(deleted.relations, 1);

        let after = store.graph_statistics().unwrap();
        assert_eq!(after.documents, 0);
        assert_eq!(after.entities, 0);
        assert_eq!(after.relations, 0);
    }

    #[test]
    fn test_community_assignment_partition() {
        let (store, _) = store_with_doc();
        let a = store
            .upsert_entity("A", EntityKind::Concept, "", 1.0, None)
            .unwrap();
        let b = store
            .upsert_entity("B", EntityKind::Concept, "", 1.0, None)
            .unwrap();
        store
            .assign_communities(&[(a.clone(), 0), (b, 1)], 0)
            .unwrap();

        assert_eq!(store.entity_community(&a, 0).unwrap(), Some(0));
        let communities = store.list_communities(Some(0)).unwrap();
        assert_eq!(communities.len(), 2);
        assert_eq!(communities.iter().map(|c| c.size).sum::<usize>(), 2);
    }

    #[test]
    fn test_related_entities_ordering() {
        let (store, _) = store_with_doc();
        let hub = store
            .upsert_entity("Hub", EntityKind::Concept, "", 1.0, None)
            .unwrap();
        let weak = store
            .upsert_entity("Weak", EntityKind::Concept, "", 1.0, None)
            .unwrap();
        let strong = store
            .upsert_entity("Strong", EntityKind::Concept, "", 1.0, None)
            .unwrap();
        store
            .upsert_relation(
                &Relation::new(hub.clone(), weak, RelationType::new("LINKS"))
                    .with_confidence(0.4),
            )
            .unwrap();
        store
            .upsert_relation(
                &Relation::new(hub.clone(), strong, RelationType::new("LINKS"))
                    .with_confidence(0.9),
            )
            .unwrap();

        let candidates = store
            .related_entities(&hub, &RelationType::new("LINKS"), None, 10)
            .unwrap();
        assert_eq!(candidates[0].0.name, "Strong");
        assert_eq!(candidates[1].0.name, "Weak");
    }
}
