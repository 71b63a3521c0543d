//! Entity and relation types for knowledge graph construction.
//!
//! Entity identity is deterministic: the id is a fingerprint of the
//! normalized name and the entity kind, so the same real-world subject
//! extracted from two documents (or by two concurrent workers) collapses
//! into a single node.
//!
//! # Entity Kinds
//!
//! The default open vocabulary:
//!
//! | Kind | Examples |
//! |------|----------|
//! | `Person` | "Alice Johnson", "Martin Smith" |
//! | `Organization` | "Acme Corp", "Central Institution" |
//! | `Geo` | "Paris", "Verdantis" |
//! | `Event` | "IPO", "Policy Meeting" |
//! | `Product` | "Model X", "Graphtog" |
//! | `Facility` | "Headquarters", "Plant 7" |
//! | `WorkOfArt` | "The Persistence of Memory" |
//! | `Law` | "GDPR", "Securities Act" |
//! | `Concept` | "Interest Rate", "Market Strategy" |
//! | `Other` | Anything the extractor could not classify |
//!
//! Relation labels are free-form uppercased strings (`WORKS_AT`,
//! `LOCATED_IN`, ...) rather than a closed enum, because the extractor is
//! allowed to invent labels grounded in the source text.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Unique identifier for a graph entity.
///
/// Produced deterministically from `(normalized name, kind)` via
/// [`EntityId::fingerprint`]; two mentions of the same subject always map
/// to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the deterministic fingerprint id for a `(name, kind)` pair.
    ///
    /// The fingerprint hashes the case-folded, whitespace-collapsed name
    /// together with the kind label, so "Alice" and "alice" share an id
    /// while "Alice (PERSON)" and "Alice (PRODUCT)" do not.
    #[must_use]
    pub fn fingerprint(name: &str, kind: EntityKind) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_name(name).as_bytes());
        hasher.update([0x1f]);
        hasher.update(kind.as_str().as_bytes());
        let digest = hasher.finalize();
        Self(format!("ent_{}", hex::encode(&digest[..16])))
    }

    /// Returns the entity ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalizes an entity name for identity comparison.
///
/// Case-folds and collapses internal whitespace; the display name stored on
/// the entity keeps its original casing.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Kind of entity in the knowledge graph.
///
/// `Other` is the open-vocabulary catch-all: unknown labels parse into it
/// rather than failing, so the extractor can never produce an unstorable
/// entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    /// Named individual.
    Person,
    /// Company, institution, team, or collective.
    Organization,
    /// Geographic or political location.
    Geo,
    /// Occurrence anchored in time.
    Event,
    /// Commercial or technical product.
    Product,
    /// Building, plant, or physical installation.
    Facility,
    /// Creative work.
    WorkOfArt,
    /// Law, regulation, or treaty.
    Law,
    /// Abstract idea or topic.
    Concept,
    /// Unclassified subject.
    Other,
}

impl EntityKind {
    /// Returns all entity kind variants.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Person,
            Self::Organization,
            Self::Geo,
            Self::Event,
            Self::Product,
            Self::Facility,
            Self::WorkOfArt,
            Self::Law,
            Self::Concept,
            Self::Other,
        ]
    }

    /// Returns the kind as its canonical uppercase label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::Organization => "ORGANIZATION",
            Self::Geo => "GEO",
            Self::Event => "EVENT",
            Self::Product => "PRODUCT",
            Self::Facility => "FACILITY",
            Self::WorkOfArt => "WORK_OF_ART",
            Self::Law => "LAW",
            Self::Concept => "CONCEPT",
            Self::Other => "OTHER",
        }
    }

    /// Parses a kind label, case-insensitively, with common synonyms.
    ///
    /// Unknown labels map to `Other` via [`Self::parse_lossy`]; this strict
    /// variant returns `None` instead.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().replace(['-', ' '], "_").as_str() {
            "PERSON" | "PEOPLE" => Some(Self::Person),
            "ORGANIZATION" | "ORG" | "COMPANY" => Some(Self::Organization),
            "GEO" | "LOCATION" | "PLACE" => Some(Self::Geo),
            "EVENT" => Some(Self::Event),
            "PRODUCT" => Some(Self::Product),
            "FACILITY" => Some(Self::Facility),
            "WORK_OF_ART" | "ARTWORK" => Some(Self::WorkOfArt),
            "LAW" | "REGULATION" => Some(Self::Law),
            "CONCEPT" | "IDEA" | "TOPIC" => Some(Self::Concept),
            "OTHER" | "UNKNOWN" => Some(Self::Other),
            _ => None,
        }
    }

    /// Parses a kind label, mapping anything unrecognized to `Other`.
    #[must_use]
    pub fn parse_lossy(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Other)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

/// A typed real-world subject in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Deterministic fingerprint id.
    pub id: EntityId,
    /// Canonical display name.
    pub name: String,
    /// Entity kind.
    pub kind: EntityKind,
    /// Description accumulated from extractions.
    pub description: String,
    /// Extraction confidence, 0.0 to 1.0. Take-max under merges.
    pub confidence: f32,
    /// Number of distinct text-unit mentions. Always at least 1.
    pub mention_count: u32,
    /// Alternative surface forms preserved across merges.
    pub aliases: Vec<String>,
    /// Document that first introduced this entity, if tracked.
    pub document_id: Option<String>,
    /// Creation timestamp (Unix seconds).
    pub created_at: u64,
    /// Last mutation timestamp (Unix seconds).
    pub updated_at: u64,
}

impl Entity {
    /// Creates a new entity with a fingerprint id and a single mention.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: EntityKind) -> Self {
        let name = name.into();
        let now = crate::current_timestamp();
        Self {
            id: EntityId::fingerprint(&name, kind),
            name,
            kind,
            description: String::new(),
            confidence: 1.0,
            mention_count: 1,
            aliases: Vec::new(),
            document_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the confidence score, clamped to [0, 1].
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Adds an alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.push_alias(alias.into());
        self
    }

    /// Sets the originating document.
    #[must_use]
    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Appends an alias, skipping duplicates and the canonical name itself.
    pub fn push_alias(&mut self, alias: String) {
        let normalized = normalize_name(&alias);
        if normalized == normalize_name(&self.name) {
            return;
        }
        if !self.aliases.iter().any(|a| normalize_name(a) == normalized) {
            self.aliases.push(alias);
        }
    }

    /// Returns true if this entity matches a name (canonical or alias).
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        let normalized = normalize_name(name);
        normalize_name(&self.name) == normalized
            || self.aliases.iter().any(|a| normalize_name(a) == normalized)
    }

    /// Folds a repeat observation into this entity.
    ///
    /// Confidence is take-max, the mention count grows, and a longer
    /// description replaces a shorter one.
    pub fn absorb_observation(&mut self, description: &str, confidence: f32) {
        self.confidence = self.confidence.max(confidence.clamp(0.0, 1.0));
        self.mention_count = self.mention_count.saturating_add(1);
        if description.len() > self.description.len() {
            self.description = description.to_string();
        }
        self.updated_at = crate::current_timestamp();
    }
}

/// Free-form relation label, normalized to `UPPER_SNAKE_CASE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationType(String);

impl RelationType {
    /// Creates a relation label, uppercasing and underscoring it.
    #[must_use]
    pub fn new(label: impl AsRef<str>) -> Self {
        let normalized = label
            .as_ref()
            .trim()
            .to_uppercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_");
        Self(normalized)
    }

    /// Returns the label as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the label is empty after normalization.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RelationType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A typed directed edge between two entities.
///
/// At most one relation exists per `(source, type, target)` triple;
/// re-observation is take-max on confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Source entity id.
    pub source: EntityId,
    /// Target entity id.
    pub target: EntityId,
    /// Uppercased relation label.
    pub rel_type: RelationType,
    /// Why the extractor believes the entities are related.
    pub description: String,
    /// Confidence, 0.0 to 1.0. Take-max on re-observation.
    pub confidence: f32,
    /// Extractor-supplied strength, 1 to 10, when available.
    pub strength: Option<u8>,
}

impl Relation {
    /// Creates a new relation.
    #[must_use]
    pub fn new(source: EntityId, target: EntityId, rel_type: RelationType) -> Self {
        Self {
            source,
            target,
            rel_type,
            description: String::new(),
            confidence: 1.0,
            strength: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the confidence score, clamped to [0, 1].
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Sets the strength (1-10) and derives confidence as strength/10.
    #[must_use]
    pub fn with_strength(mut self, strength: u8) -> Self {
        let clamped = strength.clamp(1, 10);
        self.strength = Some(clamped);
        self.confidence = f32::from(clamped) / 10.0;
        self
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = EntityId::fingerprint("Alice", EntityKind::Person);
        let b = EntityId::fingerprint("alice", EntityKind::Person);
        let c = EntityId::fingerprint("  Alice  ", EntityKind::Person);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(a.as_str().starts_with("ent_"));
    }

    #[test]
    fn test_fingerprint_varies_by_kind() {
        let person = EntityId::fingerprint("Mercury", EntityKind::Person);
        let product = EntityId::fingerprint("Mercury", EntityKind::Product);
        assert_ne!(person, product);
    }

    #[test_case::test_case("person", EntityKind::Person)]
    #[test_case::test_case("ORG", EntityKind::Organization)]
    #[test_case::test_case("work of art", EntityKind::WorkOfArt)]
    #[test_case::test_case("Location", EntityKind::Geo)]
    #[test_case::test_case("regulation", EntityKind::Law)]
    fn test_kind_parse(label: &str, expected: EntityKind) {
        assert_eq!(EntityKind::parse(label), Some(expected));
    }

    #[test]
    fn test_kind_parse_unknown() {
        assert_eq!(EntityKind::parse("widget"), None);
        assert_eq!(EntityKind::parse_lossy("widget"), EntityKind::Other);
    }

    #[test]
    fn test_relation_type_normalization() {
        assert_eq!(RelationType::new("works at").as_str(), "WORKS_AT");
        assert_eq!(RelationType::new("LOCATED_IN").as_str(), "LOCATED_IN");
        assert_eq!(RelationType::new("  owns  ").as_str(), "OWNS");
    }

    #[test]
    fn test_entity_alias_dedup() {
        let mut entity = Entity::new("Microsoft", EntityKind::Organization);
        entity.push_alias("Microsoft Corp".to_string());
        entity.push_alias("microsoft corp".to_string());
        entity.push_alias("Microsoft".to_string());
        assert_eq!(entity.aliases, vec!["Microsoft Corp".to_string()]);
    }

    #[test]
    fn test_entity_matches_name() {
        let entity = Entity::new("Microsoft", EntityKind::Organization)
            .with_alias("Microsoft Corp")
            .with_alias("MSFT");
        assert!(entity.matches_name("microsoft"));
        assert!(entity.matches_name("msft"));
        assert!(!entity.matches_name("Apple"));
    }

    #[test]
    fn test_absorb_observation_takes_max_confidence() {
        let mut entity = Entity::new("Acme", EntityKind::Organization).with_confidence(0.6);
        entity.absorb_observation("A corporation", 0.9);
        assert_eq!(entity.confidence, 0.9);
        assert_eq!(entity.mention_count, 2);

        entity.absorb_observation("", 0.3);
        assert_eq!(entity.confidence, 0.9);
        assert_eq!(entity.mention_count, 3);
        assert_eq!(entity.description, "A corporation");
    }

    #[test]
    fn test_relation_strength_maps_to_confidence() {
        let rel = Relation::new(
            EntityId::new("a"),
            EntityId::new("b"),
            RelationType::new("WORKS_AT"),
        )
        .with_strength(9);
        assert_eq!(rel.strength, Some(9));
        assert!((rel.confidence - 0.9).abs() < f32::EPSILON);
    }
}
