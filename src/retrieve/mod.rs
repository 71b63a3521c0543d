//! Multi-level retrieval: local, community, global, hierarchical, adaptive.
//!
//! Every mode returns the same envelope shape — a status, the retrieval
//! type, and the mode's payload — so the query layer can treat results
//! uniformly.
//!
//! | Mode | Scope |
//! |------|-------|
//! | local | One entity's neighborhood within a hop limit |
//! | community | The entity's community, co-members, summary |
//! | global | Digest of every community in the corpus |
//! | hierarchical | Classified query entities × (local + community) + global |
//! | adaptive | Levels picked from the classified query category |

use crate::llm::prompts::build_classification_prompt;
use crate::llm::LlmGateway;
use crate::models::{OpStatus, Significance};
use crate::storage::GraphStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Neighbors reported per local retrieval.
const MAX_NEIGHBORS: usize = 15;

/// Paths reported per local retrieval.
const MAX_PATHS: usize = 20;

/// Co-members reported per community retrieval.
const MAX_CO_MEMBERS: usize = 20;

/// Query entities examined by hierarchical retrieval.
const HIERARCHICAL_TOP_K: usize = 5;

/// Uniform retrieval envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retrieval<T> {
    /// Outcome status.
    pub status: OpStatus,
    /// Which retrieval mode produced this.
    pub retrieval_type: String,
    /// Mode payload; absent on not-found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Retrieval<T> {
    fn success(retrieval_type: &str, data: T) -> Self {
        Self {
            status: OpStatus::Success,
            retrieval_type: retrieval_type.to_string(),
            data: Some(data),
        }
    }

    fn not_found(retrieval_type: &str) -> Self {
        Self {
            status: OpStatus::NotFound,
            retrieval_type: retrieval_type.to_string(),
            data: None,
        }
    }
}

/// One traversal path in a local retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRecord {
    /// Seed entity name.
    pub source: String,
    /// Reached entity name.
    pub target: String,
    /// Relation label that reached it.
    pub rel_type: String,
    /// Hop distance.
    pub distance: u32,
}

/// Payload of local retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalContext {
    /// Seed entity.
    pub source_entity: String,
    /// Total neighbors found within the hop limit.
    pub neighbor_count: usize,
    /// Neighbor names, nearest first, capped.
    pub neighbors: Vec<String>,
    /// Traversal paths, capped.
    pub paths: Vec<PathRecord>,
}

/// Payload of community retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityContext {
    /// Community id at level 0.
    pub community_id: i64,
    /// The entity that anchored the lookup.
    pub query_entity: String,
    /// Total member count.
    pub community_size: usize,
    /// Co-member names, capped.
    pub members: Vec<String>,
    /// Community summary, when generated.
    pub summary: Option<String>,
    /// Community themes.
    pub themes: Vec<String>,
}

/// One community digest in global retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityDigest {
    /// Community id.
    pub id: i64,
    /// Hierarchy level.
    pub level: u32,
    /// Member count.
    pub size: usize,
    /// Summary, when generated.
    pub summary: Option<String>,
    /// Themes.
    pub themes: Vec<String>,
    /// Judged importance, when generated.
    pub significance: Option<Significance>,
}

/// Payload of global retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalContext {
    /// Community count.
    pub num_communities: usize,
    /// Total entity count across the graph.
    pub total_entities: usize,
    /// Per-community digests.
    pub communities: Vec<CommunityDigest>,
    /// Whether summaries exist to support global answering.
    pub summaries_available: bool,
}

/// Union payload of hierarchical and adaptive retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedContext {
    /// Deduplicated entity names.
    pub entities: Vec<String>,
    /// Deduplicated community ids.
    pub communities: Vec<i64>,
    /// Deduplicated supporting text snippets.
    pub snippets: Vec<String>,
    /// Retrieval levels that ran.
    pub levels_used: Vec<String>,
}

/// Classified query category, which drives adaptive retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryCategory {
    /// One entity's neighborhood.
    Local,
    /// Corpus-wide question.
    Global,
    /// Both entity detail and corpus context.
    Hybrid,
    /// Multi-hop reasoning.
    Tog,
    /// Comparison of entities.
    Comparative,
    /// Open-ended browsing.
    Exploratory,
    /// Narrow factual lookup.
    Specific,
}

impl QueryCategory {
    /// Parses a category label, defaulting to `Exploratory`.
    #[must_use]
    pub fn parse_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "local" => Self::Local,
            "global" => Self::Global,
            "hybrid" => Self::Hybrid,
            "tog" | "multi_hop" | "multihop" => Self::Tog,
            "comparative" => Self::Comparative,
            "specific" => Self::Specific,
            _ => Self::Exploratory,
        }
    }

    /// Returns the retrieval levels adaptive mode runs for this category.
    #[must_use]
    pub fn retrieval_levels(self) -> &'static [&'static str] {
        match self {
            Self::Specific | Self::Local => &["local"],
            Self::Comparative | Self::Hybrid => &["local", "community"],
            Self::Global | Self::Exploratory | Self::Tog => &["local", "community", "global"],
        }
    }

    /// Returns the category label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
            Self::Hybrid => "hybrid",
            Self::Tog => "tog",
            Self::Comparative => "comparative",
            Self::Exploratory => "exploratory",
            Self::Specific => "specific",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    #[serde(default)]
    key_entities: Vec<String>,
}

/// Multi-level retriever over the graph store.
pub struct Retriever {
    store: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
}

impl Retriever {
    /// Creates a retriever.
    #[must_use]
    pub const fn new(store: Arc<dyn GraphStore>, gateway: Arc<LlmGateway>) -> Self {
        Self { store, gateway }
    }

    /// Local retrieval: neighbors within `hop_limit` of the seed entity.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; a missing entity is a not-found
    /// envelope, not an error.
    pub fn local(&self, entity_name: &str, hop_limit: u32) -> Result<Retrieval<LocalContext>> {
        let Some(entity) = self.store.find_entity_by_name(entity_name, None)? else {
            return Ok(Retrieval::not_found("local"));
        };
        let context = self.store.entity_context(&entity.id, hop_limit, false)?;

        let paths: Vec<PathRecord> = context
            .related_entities
            .iter()
            .take(MAX_PATHS)
            .map(|related| PathRecord {
                source: entity.name.clone(),
                target: related.entity.name.clone(),
                rel_type: related.rel_type.as_str().to_string(),
                distance: related.distance,
            })
            .collect();

        Ok(Retrieval::success(
            "local",
            LocalContext {
                source_entity: entity.name,
                neighbor_count: context.related_entities.len(),
                neighbors: context
                    .related_entities
                    .iter()
                    .take(MAX_NEIGHBORS)
                    .map(|r| r.entity.name.clone())
                    .collect(),
                paths,
            },
        ))
    }

    /// Community retrieval: the seed entity's community and summary.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn community(&self, entity_name: &str) -> Result<Retrieval<CommunityContext>> {
        let Some(entity) = self.store.find_entity_by_name(entity_name, None)? else {
            return Ok(Retrieval::not_found("community"));
        };
        let Some(community_id) = self.store.entity_community(&entity.id, 0)? else {
            return Ok(Retrieval::not_found("community"));
        };

        let members = self.store.community_members(community_id, 0)?;
        let community = self.store.get_community(community_id, 0)?;

        Ok(Retrieval::success(
            "community",
            CommunityContext {
                community_id,
                query_entity: entity.name,
                community_size: members.len(),
                members: members
                    .iter()
                    .take(MAX_CO_MEMBERS)
                    .map(|m| m.name.clone())
                    .collect(),
                summary: community.as_ref().and_then(|c| c.summary.clone()),
                themes: community.map(|c| c.themes).unwrap_or_default(),
            },
        ))
    }

    /// Global retrieval: a digest of every community.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn global(&self) -> Result<Retrieval<GlobalContext>> {
        let communities = self.store.list_communities(Some(0))?;
        if communities.is_empty() {
            return Ok(Retrieval::not_found("global"));
        }
        let stats = self.store.graph_statistics()?;
        let summaries_available = communities.iter().any(|c| c.summary.is_some());

        Ok(Retrieval::success(
            "global",
            GlobalContext {
                num_communities: communities.len(),
                total_entities: stats.entities,
                communities: communities
                    .into_iter()
                    .map(|c| CommunityDigest {
                        id: c.id,
                        level: c.level,
                        size: c.size,
                        summary: c.summary,
                        themes: c.themes,
                        significance: c.significance,
                    })
                    .collect(),
                summaries_available,
            },
        ))
    }

    /// Hierarchical retrieval: classify the query's entities, run local and
    /// community retrieval for each, add the global digest, and union the
    /// results.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; classification failures degrade to
    /// top-entity seeding.
    pub fn hierarchical(&self, query: &str) -> Result<Retrieval<CombinedContext>> {
        let key_entities = self.classify_query_entities(query)?;
        let levels = ["local", "community", "global"];
        let combined = self.run_levels(&key_entities, &levels)?;
        Ok(Retrieval::success("hierarchical", combined))
    }

    /// Adaptive retrieval: the classified category decides which levels run.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn adaptive(
        &self,
        query: &str,
        category: QueryCategory,
    ) -> Result<Retrieval<CombinedContext>> {
        let key_entities = self.classify_query_entities(query)?;
        let combined = self.run_levels(&key_entities, category.retrieval_levels())?;
        Ok(Retrieval::success("adaptive", combined))
    }

    /// Extracts up to the top-K query entities via the classification
    /// prompt, falling back to the graph's top entities.
    fn classify_query_entities(&self, query: &str) -> Result<Vec<String>> {
        let prompt = build_classification_prompt(query);
        let key_entities = match self
            .gateway
            .generate_json::<ClassificationResponse>("classify_query", &prompt, 0.0)
        {
            Ok(response) => response.key_entities,
            Err(e) => {
                tracing::warn!("query-entity classification failed, using top entities: {e}");
                Vec::new()
            },
        };
        let mut out: Vec<String> = key_entities
            .into_iter()
            .take(HIERARCHICAL_TOP_K)
            .collect();
        if out.is_empty() {
            out = self
                .store
                .top_entities(HIERARCHICAL_TOP_K, None)?
                .into_iter()
                .map(|e| e.name)
                .collect();
        }
        Ok(out)
    }

    /// Runs the requested levels for each seed entity and unions results.
    fn run_levels(&self, key_entities: &[String], levels: &[&str]) -> Result<CombinedContext> {
        let mut combined = CombinedContext {
            levels_used: levels.iter().map(ToString::to_string).collect(),
            ..CombinedContext::default()
        };
        let mut entity_names: HashSet<String> = HashSet::new();
        let mut community_ids: HashSet<i64> = HashSet::new();
        let mut snippets: HashSet<String> = HashSet::new();

        for name in key_entities {
            if levels.contains(&"local") {
                if let Some(local) = self.local(name, 2)?.data {
                    entity_names.insert(local.source_entity.clone());
                    entity_names.extend(local.neighbors.iter().cloned());
                    if let Some(entity) = self.store.find_entity_by_name(name, None)? {
                        for unit in self.store.text_units_for_entity(&entity.id, 3)? {
                            snippets.insert(unit.text);
                        }
                    }
                }
            }
            if levels.contains(&"community") {
                if let Some(community) = self.community(name)?.data {
                    community_ids.insert(community.community_id);
                    entity_names.extend(community.members.iter().cloned());
                }
            }
        }
        if levels.contains(&"global") {
            if let Some(global) = self.global()?.data {
                community_ids.extend(global.communities.iter().map(|c| c.id));
            }
        }

        combined.entities = {
            let mut v: Vec<String> = entity_names.into_iter().collect();
            v.sort();
            v
        };
        combined.communities = {
            let mut v: Vec<i64> = community_ids.into_iter().collect();
            v.sort_unstable();
            v
        };
        combined.snippets = {
            let mut v: Vec<String> = snippets.into_iter().collect();
            v.sort();
            v
        };
        Ok(combined)
    }
}
