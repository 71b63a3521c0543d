//! Community detection over the semantic relation subgraph.
//!
//! Entities and their relations are projected into an undirected weighted
//! `petgraph` graph (mention and structure edges are excluded — only
//! semantic relations shape modularity). A seeded Leiden-style optimizer
//! runs local moving until the modularity gain falls under the tolerance,
//! then aggregates communities into super-nodes and repeats, producing a
//! hierarchy: level 0 is the finest partition, higher levels are coarser.
//!
//! Properties:
//!
//! - Every entity lands in exactly one community per level, including
//!   isolated entities (singleton communities).
//! - The seed fixes the node visit order, so detection is deterministic
//!   for a fixed graph.
//! - Fewer than two entities produce a single trivial community; detection
//!   never fails.

pub mod summarize;

pub use summarize::CommunitySummarizer;

use crate::config::CommunityConfig;
use crate::models::EntityId;
use crate::storage::GraphStore;
use crate::Result;
use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Hard cap on hierarchy depth; aggregation rarely goes past three levels.
const MAX_LEVELS: usize = 4;

/// Outcome of a detection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionResult {
    /// Number of hierarchy levels stored.
    pub levels: u32,
    /// Community count per level, finest first.
    pub communities_per_level: Vec<usize>,
    /// Entities assigned.
    pub entities: usize,
}

/// Seeded xorshift64 generator for reproducible visit orders.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9e37_79b9 } else { seed },
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn shuffle<T>(&mut self, slice: &mut [T]) {
        for i in (1..slice.len()).rev() {
            #[allow(clippy::cast_possible_truncation)]
            let j = (self.next() % (i as u64 + 1)) as usize;
            slice.swap(i, j);
        }
    }
}

/// Leiden-style community detector.
pub struct CommunityDetector {
    store: Arc<dyn GraphStore>,
    config: CommunityConfig,
}

impl CommunityDetector {
    /// Creates a detector.
    #[must_use]
    pub fn new(store: Arc<dyn GraphStore>, config: CommunityConfig) -> Self {
        Self { store, config }
    }

    /// Runs full detection and stores the assignments.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; the algorithm itself never fails.
    pub fn detect(&self) -> Result<DetectionResult> {
        let entities = self.store.entities_by_kind(None)?;
        let entity_ids: Vec<EntityId> = entities.into_iter().map(|e| e.id).collect();

        self.store.clear_communities(None)?;
        if entity_ids.is_empty() {
            return Ok(DetectionResult::default());
        }
        if entity_ids.len() < 2 {
            // Trivial single community; never fail on a tiny graph.
            self.store
                .assign_communities(&[(entity_ids[0].clone(), 0)], 0)?;
            return Ok(DetectionResult {
                levels: 1,
                communities_per_level: vec![1],
                entities: 1,
            });
        }

        let (graph, index_of) = self.project(&entity_ids)?;
        let hierarchy = self.optimize(&graph);

        let mut result = DetectionResult {
            levels: 0,
            communities_per_level: Vec::new(),
            entities: entity_ids.len(),
        };

        let stored_levels = if self.config.include_intermediate_levels {
            hierarchy.len()
        } else {
            1
        };
        for (level, membership) in hierarchy.iter().take(stored_levels).enumerate() {
            let assignments: Vec<(EntityId, i64)> = entity_ids
                .iter()
                .map(|id| {
                    let node = index_of[id];
                    (id.clone(), membership[node.index()])
                })
                .collect();
            #[allow(clippy::cast_possible_truncation)]
            self.store.assign_communities(&assignments, level as u32)?;
            let count = membership.iter().collect::<HashSet<_>>().len();
            result.communities_per_level.push(count);
            result.levels += 1;
        }

        tracing::info!(
            levels = result.levels,
            finest = result.communities_per_level.first().copied().unwrap_or(0),
            "community detection complete"
        );
        Ok(result)
    }

    /// Recomputes only the communities touching the affected entities,
    /// keeping ids stable where membership is unchanged.
    ///
    /// Only level 0 is refreshed; coarser levels reconcile on the next full
    /// run.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn detect_incrementally(&self, affected: &[EntityId]) -> Result<DetectionResult> {
        let existing = self.store.list_communities(Some(0))?;
        if existing.is_empty() {
            return self.detect();
        }

        // Scope: affected entities plus every member of the communities
        // they currently belong to.
        let mut scope: HashSet<EntityId> = affected.iter().cloned().collect();
        let mut touched_communities: HashSet<i64> = HashSet::new();
        for id in affected {
            if let Some(community) = self.store.entity_community(id, 0)? {
                touched_communities.insert(community);
                for member in self.store.community_members(community, 0)? {
                    scope.insert(member.id);
                }
            }
        }
        if scope.is_empty() {
            return Ok(DetectionResult::default());
        }

        let mut scope: Vec<EntityId> = scope.into_iter().collect();
        scope.sort();
        let (graph, index_of) = self.project(&scope)?;
        let hierarchy = self.optimize(&graph);
        let Some(membership) = hierarchy.first() else {
            return Ok(DetectionResult::default());
        };

        // Group scoped entities by their new community label.
        let mut groups: BTreeMap<i64, Vec<EntityId>> = BTreeMap::new();
        for id in &scope {
            let label = membership[index_of[id].index()];
            groups.entry(label).or_default().push(id.clone());
        }

        // Stable-id reconciliation: a group that exactly matches an old
        // community keeps its id, anything else gets a fresh one.
        let mut old_memberships: HashMap<i64, HashSet<EntityId>> = HashMap::new();
        for community in &touched_communities {
            old_memberships.insert(
                *community,
                self.store
                    .community_members(*community, 0)?
                    .into_iter()
                    .map(|e| e.id)
                    .collect(),
            );
        }
        let mut next_id = existing.iter().map(|c| c.id).max().unwrap_or(0) + 1;

        let mut assignments: Vec<(EntityId, i64)> = Vec::new();
        let mut stale: Vec<i64> = Vec::new();
        for members in groups.values() {
            let member_set: HashSet<EntityId> = members.iter().cloned().collect();
            let stable = old_memberships
                .iter()
                .find(|(_, old)| **old == member_set)
                .map(|(id, _)| *id);
            let community_id = stable.unwrap_or_else(|| {
                let id = next_id;
                next_id += 1;
                id
            });
            if stable.is_none() {
                stale.push(community_id);
            }
            for member in members {
                assignments.push((member.clone(), community_id));
            }
        }

        self.store.assign_communities(&assignments, 0)?;
        stale.extend(touched_communities.iter().copied());
        self.store.mark_communities_stale(&stale)?;

        Ok(DetectionResult {
            levels: 1,
            communities_per_level: vec![groups.len()],
            entities: scope.len(),
        })
    }

    /// Projects the semantic relation subgraph for the given entities into
    /// an undirected weighted graph.
    fn project(
        &self,
        entity_ids: &[EntityId],
    ) -> Result<(UnGraph<EntityId, f64>, HashMap<EntityId, NodeIndex>)> {
        let mut graph = UnGraph::<EntityId, f64>::default();
        let mut index_of: HashMap<EntityId, NodeIndex> = HashMap::new();
        for id in entity_ids {
            index_of.insert(id.clone(), graph.add_node(id.clone()));
        }

        let mut seen: HashSet<(EntityId, EntityId)> = HashSet::new();
        for id in entity_ids {
            for relation in self.store.relations_of(id)? {
                let (Some(&a), Some(&b)) = (
                    index_of.get(&relation.source),
                    index_of.get(&relation.target),
                ) else {
                    continue;
                };
                if a == b {
                    continue;
                }
                let key = if relation.source < relation.target {
                    (relation.source.clone(), relation.target.clone())
                } else {
                    (relation.target.clone(), relation.source.clone())
                };
                if !seen.insert(key) {
                    continue;
                }
                graph.add_edge(a, b, f64::from(relation.confidence));
            }
        }
        Ok((graph, index_of))
    }

    /// Runs local moving + aggregation, returning per-level memberships
    /// indexed by original node index. Community labels are densified to
    /// `0..n` per level.
    fn optimize(&self, graph: &UnGraph<EntityId, f64>) -> Vec<Vec<i64>> {
        let node_count = graph.node_count();

        // Working representation: weighted adjacency over usize nodes.
        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); node_count];
        for edge in graph.edge_indices() {
            if let (Some((a, b)), Some(weight)) =
                (graph.edge_endpoints(edge), graph.edge_weight(edge))
            {
                adjacency[a.index()].push((b.index(), *weight));
                adjacency[b.index()].push((a.index(), *weight));
            }
        }

        let mut hierarchy: Vec<Vec<i64>> = Vec::new();
        // Maps original node -> current super-node.
        let mut projection: Vec<usize> = (0..node_count).collect();
        let mut rng = XorShift64::new(self.config.seed);

        for _level in 0..MAX_LEVELS {
            let membership = self.local_moving(&adjacency, &mut rng);
            let communities = densify(&membership);
            let community_count = communities.iter().collect::<HashSet<_>>().len();

            // Record this level's membership for the ORIGINAL nodes.
            let level_membership: Vec<i64> = projection
                .iter()
                .map(|&super_node| communities[super_node])
                .collect();
            let distinct_before = adjacency.len();
            hierarchy.push(level_membership);

            if community_count == distinct_before || community_count <= 1 {
                break;
            }

            // Aggregate: communities become the next level's nodes.
            let mut aggregated: HashMap<(usize, usize), f64> = HashMap::new();
            for (node, neighbors) in adjacency.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let ca = communities[node] as usize;
                for (neighbor, weight) in neighbors {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let cb = communities[*neighbor] as usize;
                    if ca == cb {
                        continue;
                    }
                    let key = if ca < cb { (ca, cb) } else { (cb, ca) };
                    // Each undirected edge appears twice in adjacency.
                    *aggregated.entry(key).or_default() += weight / 2.0;
                }
            }
            let mut next_adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); community_count];
            for ((a, b), weight) in aggregated {
                next_adjacency[a].push((b, weight));
                next_adjacency[b].push((a, weight));
            }
            adjacency = next_adjacency;
            projection = projection
                .iter()
                .map(|&super_node| {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let c = communities[super_node] as usize;
                    c
                })
                .collect();
        }

        hierarchy
    }

    /// One level of modularity local moving. Returns a community label per
    /// node (not yet densified).
    fn local_moving(&self, adjacency: &[Vec<(usize, f64)>], rng: &mut XorShift64) -> Vec<usize> {
        let n = adjacency.len();
        let mut community: Vec<usize> = (0..n).collect();
        let degree: Vec<f64> = adjacency
            .iter()
            .map(|neighbors| neighbors.iter().map(|(_, w)| w).sum())
            .collect();
        let total_weight: f64 = degree.iter().sum::<f64>() / 2.0;
        if total_weight <= f64::EPSILON {
            return community;
        }
        let mut community_degree: Vec<f64> = degree.clone();

        let mut order: Vec<usize> = (0..n).collect();
        for _ in 0..self.config.max_iterations {
            rng.shuffle(&mut order);
            let mut moved = false;

            for &node in &order {
                let current = community[node];
                community_degree[current] -= degree[node];

                // Weight from node into each neighboring community.
                let mut links: HashMap<usize, f64> = HashMap::new();
                for (neighbor, weight) in &adjacency[node] {
                    *links.entry(community[*neighbor]).or_default() += weight;
                }

                let gain_of = |target: usize| -> f64 {
                    let link = links.get(&target).copied().unwrap_or(0.0);
                    link - community_degree[target] * degree[node] / (2.0 * total_weight)
                };

                let mut best = current;
                let mut best_gain = gain_of(current);
                let mut targets: Vec<usize> = links.keys().copied().collect();
                targets.sort_unstable();
                for target in targets {
                    let gain = gain_of(target);
                    if gain > best_gain + self.config.tolerance {
                        best = target;
                        best_gain = gain;
                    }
                }

                community[node] = best;
                community_degree[best] += degree[node];
                if best != current {
                    moved = true;
                }
            }

            if !moved {
                break;
            }
        }
        community
    }
}

/// Renumbers arbitrary community labels to dense `0..n` ids, ordered by
/// first appearance.
fn densify(membership: &[usize]) -> Vec<i64> {
    let mut mapping: HashMap<usize, i64> = HashMap::new();
    let mut next = 0_i64;
    membership
        .iter()
        .map(|label| {
            *mapping.entry(*label).or_insert_with(|| {
                let id = next;
                next += 1;
                id
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, Relation, RelationType};
    use crate::storage::MemoryGraphStore;

    fn setup_two_clusters() -> (Arc<MemoryGraphStore>, Vec<EntityId>) {
        let store = Arc::new(MemoryGraphStore::new());
        let names = ["A1", "A2", "A3", "B1", "B2", "B3"];
        let ids: Vec<EntityId> = names
            .iter()
            .map(|n| {
                store
                    .upsert_entity(n, EntityKind::Concept, "", 1.0, None)
                    .unwrap()
            })
            .collect();
        // Dense triangle in each half, one weak bridge.
        let edges = [(0, 1), (1, 2), (0, 2), (3, 4), (4, 5), (3, 5)];
        for (a, b) in edges {
            store
                .upsert_relation(
                    &Relation::new(ids[a].clone(), ids[b].clone(), RelationType::new("LINKS"))
                        .with_confidence(0.9),
                )
                .unwrap();
        }
        store
            .upsert_relation(
                &Relation::new(ids[2].clone(), ids[3].clone(), RelationType::new("BRIDGE"))
                    .with_confidence(0.1),
            )
            .unwrap();
        (store, ids)
    }

    #[test]
    fn test_two_clusters_detected() {
        let (store, ids) = setup_two_clusters();
        let detector = CommunityDetector::new(store.clone(), CommunityConfig::default());
        let result = detector.detect().unwrap();

        assert!(result.levels >= 1);
        assert_eq!(result.entities, 6);
        let finest = result.communities_per_level[0];
        assert!(finest >= 2, "expected the bridge to split, got {finest}");

        // Partition completeness: every entity has exactly one community.
        let communities = store.list_communities(Some(0)).unwrap();
        let total: usize = communities.iter().map(|c| c.size).sum();
        assert_eq!(total, 6);

        // The two triangles land apart.
        let a_side = store.entity_community(&ids[0], 0).unwrap().unwrap();
        let b_side = store.entity_community(&ids[5], 0).unwrap().unwrap();
        assert_ne!(a_side, b_side);
        assert_eq!(
            store.entity_community(&ids[1], 0).unwrap().unwrap(),
            a_side
        );
    }

    #[test]
    fn test_detection_is_deterministic() {
        let (store, _) = setup_two_clusters();
        let detector = CommunityDetector::new(store.clone(), CommunityConfig::default());
        detector.detect().unwrap();
        let first: Vec<_> = store.list_communities(None).unwrap();

        detector.detect().unwrap();
        let second: Vec<_> = store.list_communities(None).unwrap();
        assert_eq!(
            first.iter().map(|c| (c.id, c.level, c.size)).collect::<Vec<_>>(),
            second.iter().map(|c| (c.id, c.level, c.size)).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn test_tiny_graph_is_trivial_community() {
        let store = Arc::new(MemoryGraphStore::new());
        store
            .upsert_entity("Lonely", EntityKind::Concept, "", 1.0, None)
            .unwrap();
        let detector = CommunityDetector::new(store.clone(), CommunityConfig::default());
        let result = detector.detect().unwrap();
        assert_eq!(result.levels, 1);
        assert_eq!(result.communities_per_level, vec![1]);
    }

    #[test]
    fn test_empty_graph_never_fails() {
        let store = Arc::new(MemoryGraphStore::new());
        let detector = CommunityDetector::new(store, CommunityConfig::default());
        let result = detector.detect().unwrap();
        assert_eq!(result.levels, 0);
    }

    #[test]
    fn test_isolated_entities_get_singletons() {
        let store = Arc::new(MemoryGraphStore::new());
        for name in ["X", "Y", "Z"] {
            store
                .upsert_entity(name, EntityKind::Concept, "", 1.0, None)
                .unwrap();
        }
        let detector = CommunityDetector::new(store.clone(), CommunityConfig::default());
        let result = detector.detect().unwrap();
        assert_eq!(result.communities_per_level[0], 3);
    }

    #[test]
    fn test_incremental_keeps_stable_ids() {
        let (store, ids) = setup_two_clusters();
        let detector = CommunityDetector::new(store.clone(), CommunityConfig::default());
        detector.detect().unwrap();
        let before = store.entity_community(&ids[0], 0).unwrap().unwrap();

        // Nothing structural changed; re-detect incrementally around A1.
        detector.detect_incrementally(&[ids[0].clone()]).unwrap();
        let after = store.entity_community(&ids[0], 0).unwrap().unwrap();
        assert_eq!(before, after, "unchanged membership keeps its id");
    }
}
