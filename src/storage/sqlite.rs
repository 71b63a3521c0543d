//! SQLite-backed graph store.
//!
//! Persistence lives in six tables: `documents`, `text_units`, `entities`,
//! `relations`, `mentions`, and `communities` (+ `community_members`). The
//! schema enforces the identity contracts directly:
//!
//! - `UNIQUE(name_normalized, kind)` on entities — the cross-worker
//!   deduplication point;
//! - `PRIMARY KEY (source_id, rel_type, target_id)` on relations — one edge
//!   per triple;
//! - `PRIMARY KEY (entity_id, text_unit_id)` on mentions — idempotent
//!   grounding links.
//!
//! A `Mutex<Connection>` serializes access; multi-statement mutations run
//! inside transactions so readers never observe dangling edges.

use super::{
    AffectedCommunities, DeletedSubgraph, EntityContext, GraphStats, GraphStore, RelatedEntity,
    RelationTypeStat,
};
use crate::models::{
    Community, CommunitySummary, Document, DocumentStatus, Entity, EntityId, EntityKind, Relation,
    RelationType, Significance, TextUnit, normalize_name,
};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    file_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    last_processed_at INTEGER,
    status TEXT NOT NULL DEFAULT 'pending'
);

CREATE TABLE IF NOT EXISTS text_units (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    start_char INTEGER NOT NULL,
    end_char INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_text_units_document ON text_units(document_id);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    name_normalized TEXT NOT NULL,
    kind TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    confidence REAL NOT NULL,
    mention_count INTEGER NOT NULL DEFAULT 1,
    aliases TEXT NOT NULL DEFAULT '[]',
    document_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(name_normalized, kind)
);
CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);
CREATE INDEX IF NOT EXISTS idx_entities_document ON entities(document_id);

CREATE TABLE IF NOT EXISTS relations (
    source_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    rel_type TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    confidence REAL NOT NULL,
    strength INTEGER,
    PRIMARY KEY (source_id, rel_type, target_id)
);
CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_id);

CREATE TABLE IF NOT EXISTS mentions (
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    text_unit_id TEXT NOT NULL REFERENCES text_units(id) ON DELETE CASCADE,
    PRIMARY KEY (entity_id, text_unit_id)
);
CREATE INDEX IF NOT EXISTS idx_mentions_unit ON mentions(text_unit_id);

CREATE TABLE IF NOT EXISTS communities (
    id INTEGER NOT NULL,
    level INTEGER NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    summary TEXT,
    themes TEXT NOT NULL DEFAULT '[]',
    significance TEXT,
    summary_timestamp INTEGER,
    stale INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, level)
);

CREATE TABLE IF NOT EXISTS community_members (
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    community_id INTEGER NOT NULL,
    level INTEGER NOT NULL,
    PRIMARY KEY (entity_id, level)
);
CREATE INDEX IF NOT EXISTS idx_members_community ON community_members(community_id, level);
";

/// SQLite-backed [`GraphStore`] implementation.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

fn db_err(operation: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| match &e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::GraphConstraint {
                operation: operation.to_string(),
                cause: e.to_string(),
            }
        },
        _ => Error::GraphUnavailable {
            operation: operation.to_string(),
            cause: e.to_string(),
        },
    }
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    let status: String = row.get("status")?;
    Ok(Document {
        id: row.get("id")?,
        name: row.get("name")?,
        file_path: row.get("file_path")?,
        content_hash: row.get("content_hash")?,
        version: row.get("version")?,
        last_processed_at: row
            .get::<_, Option<i64>>("last_processed_at")?
            .map(|v| v.max(0).unsigned_abs()),
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Pending),
    })
}

fn row_to_text_unit(row: &Row<'_>) -> rusqlite::Result<TextUnit> {
    Ok(TextUnit {
        id: row.get("id")?,
        document_id: row.get("document_id")?,
        text: row.get("text")?,
        start_char: row.get::<_, i64>("start_char")?.max(0).unsigned_abs() as usize,
        end_char: row.get::<_, i64>("end_char")?.max(0).unsigned_abs() as usize,
        created_at: row.get::<_, i64>("created_at")?.max(0).unsigned_abs(),
    })
}

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let kind: String = row.get("kind")?;
    let aliases: String = row.get("aliases")?;
    Ok(Entity {
        id: EntityId::new(row.get::<_, String>("id")?),
        name: row.get("name")?,
        kind: EntityKind::parse_lossy(&kind),
        description: row.get("description")?,
        confidence: row.get("confidence")?,
        mention_count: row.get("mention_count")?,
        aliases: serde_json::from_str(&aliases).unwrap_or_default(),
        document_id: row.get("document_id")?,
        created_at: row.get::<_, i64>("created_at")?.max(0).unsigned_abs(),
        updated_at: row.get::<_, i64>("updated_at")?.max(0).unsigned_abs(),
    })
}

fn row_to_relation(row: &Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        source: EntityId::new(row.get::<_, String>("source_id")?),
        target: EntityId::new(row.get::<_, String>("target_id")?),
        rel_type: RelationType::new(row.get::<_, String>("rel_type")?),
        description: row.get("description")?,
        confidence: row.get("confidence")?,
        strength: row.get("strength")?,
    })
}

fn row_to_community(row: &Row<'_>) -> rusqlite::Result<Community> {
    let themes: String = row.get("themes")?;
    let significance: Option<String> = row.get("significance")?;
    Ok(Community {
        id: row.get("id")?,
        level: row.get("level")?,
        size: row.get::<_, i64>("size")?.max(0).unsigned_abs() as usize,
        summary: row.get("summary")?,
        themes: serde_json::from_str(&themes).unwrap_or_default(),
        significance: significance.as_deref().map(Significance::parse_lossy),
        summary_timestamp: row
            .get::<_, Option<i64>>("summary_timestamp")?
            .map(|t| t.max(0).unsigned_abs()),
        stale: row.get::<_, i64>("stale")? != 0,
    })
}

impl SqliteGraphStore {
    /// Opens (or creates) a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns `GraphUnavailable` when the database cannot be opened or the
    /// schema cannot be applied.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("open"))?;
        Self::init(conn)
    }

    /// Opens an in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns `GraphUnavailable` when the database cannot be opened.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("open"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err("init"))?;
        conn.execute_batch(SCHEMA).map_err(db_err("init"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self, operation: &str) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::GraphUnavailable {
            operation: operation.to_string(),
            cause: "connection mutex poisoned".to_string(),
        })
    }

    /// Recomputes `mention_count` from the mentions table for one entity.
    fn recount_mentions(conn: &Connection, entity_id: &str) -> rusqlite::Result<()> {
        conn.execute(
            "UPDATE entities
             SET mention_count = (SELECT COUNT(*) FROM mentions WHERE entity_id = ?1)
             WHERE id = ?1",
            params![entity_id],
        )?;
        Ok(())
    }

    /// Documents an entity is grounded in via mentions.
    fn entity_documents(conn: &Connection, entity_id: &str) -> rusqlite::Result<HashSet<String>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT t.document_id
             FROM mentions m JOIN text_units t ON t.id = m.text_unit_id
             WHERE m.entity_id = ?1",
        )?;
        let rows = stmt.query_map(params![entity_id], |row| row.get::<_, String>(0))?;
        rows.collect()
    }
}

impl GraphStore for SqliteGraphStore {
    fn upsert_document(&self, document: &Document) -> Result<Document> {
        let op = "upsert_document";
        let conn = self.lock(op)?;
        let existing: Option<Document> = conn
            .query_row(
                "SELECT * FROM documents WHERE id = ?1",
                params![document.id],
                row_to_document,
            )
            .optional()
            .map_err(db_err(op))?;

        match existing {
            Some(mut stored) => {
                if stored.content_hash != document.content_hash {
                    stored.version += 1;
                    stored.content_hash = document.content_hash.clone();
                    stored.status = DocumentStatus::Pending;
                }
                stored.name = document.name.clone();
                stored.file_path = document.file_path.clone();
                conn.execute(
                    "UPDATE documents SET name = ?2, file_path = ?3, content_hash = ?4,
                     version = ?5, status = ?6 WHERE id = ?1",
                    params![
                        stored.id,
                        stored.name,
                        stored.file_path,
                        stored.content_hash,
                        stored.version,
                        stored.status.as_str(),
                    ],
                )
                .map_err(db_err(op))?;
                Ok(stored)
            },
            None => {
                conn.execute(
                    "INSERT INTO documents (id, name, file_path, content_hash, version,
                     last_processed_at, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        document.id,
                        document.name,
                        document.file_path,
                        document.content_hash,
                        document.version,
                        document
                            .last_processed_at
                            .map(|t| i64::try_from(t).unwrap_or(i64::MAX)),
                        document.status.as_str(),
                    ],
                )
                .map_err(db_err(op))?;
                Ok(document.clone())
            },
        }
    }

    fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let op = "get_document";
        let conn = self.lock(op)?;
        conn.query_row(
            "SELECT * FROM documents WHERE id = ?1",
            params![id],
            row_to_document,
        )
        .optional()
        .map_err(db_err(op))
    }

    fn set_document_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        let op = "set_document_status";
        let conn = self.lock(op)?;
        let processed_at = (status == DocumentStatus::Completed)
            .then(|| i64::try_from(crate::current_timestamp()).unwrap_or(i64::MAX));
        let changed = conn
            .execute(
                "UPDATE documents SET status = ?2,
                 last_processed_at = COALESCE(?3, last_processed_at)
                 WHERE id = ?1",
                params![id, status.as_str(), processed_at],
            )
            .map_err(db_err(op))?;
        if changed == 0 {
            return Err(Error::not_found("document", id));
        }
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<Document>> {
        let op = "list_documents";
        let conn = self.lock(op)?;
        let mut stmt = conn
            .prepare("SELECT * FROM documents ORDER BY id")
            .map_err(db_err(op))?;
        let rows = stmt
            .query_map([], row_to_document)
            .map_err(db_err(op))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err(op))?;
        Ok(rows)
    }

    fn create_text_unit(&self, unit: &TextUnit) -> Result<()> {
        let op = "create_text_unit";
        let conn = self.lock(op)?;
        conn.execute(
            "INSERT INTO text_units (id, document_id, text, start_char, end_char, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                unit.id,
                unit.document_id,
                unit.text,
                i64::try_from(unit.start_char).unwrap_or(i64::MAX),
                i64::try_from(unit.end_char).unwrap_or(i64::MAX),
                i64::try_from(unit.created_at).unwrap_or(i64::MAX),
            ],
        )
        .map_err(db_err(op))?;
        Ok(())
    }

    fn get_text_unit(&self, id: &str) -> Result<Option<TextUnit>> {
        let op = "get_text_unit";
        let conn = self.lock(op)?;
        conn.query_row(
            "SELECT * FROM text_units WHERE id = ?1",
            params![id],
            row_to_text_unit,
        )
        .optional()
        .map_err(db_err(op))
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
        let op = "upsert_entity";
        let id = EntityId::fingerprint(name, kind);
        let now = i64::try_from(crate::current_timestamp()).unwrap_or(i64::MAX);
        let conn = self.lock(op)?;
        conn.execute(
            "INSERT INTO entities (id, name, name_normalized, kind, description, confidence,
             mention_count, aliases, document_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, '[]', ?7, ?8, ?8)
             ON CONFLICT(name_normalized, kind) DO UPDATE SET
                 confidence = MAX(confidence, excluded.confidence),
                 description = CASE
                     WHEN LENGTH(excluded.description) > LENGTH(description)
                     THEN excluded.description ELSE description END,
                 mention_count = mention_count + 1,
                 updated_at = excluded.updated_at",
            params![
                id.as_str(),
                name,
                normalize_name(name),
                kind.as_str(),
                description,
                confidence.clamp(0.0, 1.0),
                document_id,
                now,
            ],
        )
        .map_err(db_err(op))?;
        Ok(id)
    }

    fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        let op = "get_entity";
        let conn = self.lock(op)?;
        conn.query_row(
            "SELECT * FROM entities WHERE id = ?1",
            params![id.as_str()],
            row_to_entity,
        )
        .optional()
        .map_err(db_err(op))
    }

    fn find_entity_by_name(&self, name: &str, kind: Option<EntityKind>) -> Result<Option<Entity>> {
        let op = "find_entity_by_name";
        let normalized = normalize_name(name);
        let conn = self.lock(op)?;

        // Canonical-name hit first: the UNIQUE index answers it directly.
        let canonical: Option<Entity> = match kind {
            Some(k) => conn
                .query_row(
                    "SELECT * FROM entities WHERE name_normalized = ?1 AND kind = ?2",
                    params![normalized, k.as_str()],
                    row_to_entity,
                )
                .optional()
                .map_err(db_err(op))?,
            None => conn
                .query_row(
                    "SELECT * FROM entities WHERE name_normalized = ?1
                     ORDER BY mention_count DESC LIMIT 1",
                    params![normalized],
                    row_to_entity,
                )
                .optional()
                .map_err(db_err(op))?,
        };
        if canonical.is_some() {
            return Ok(canonical);
        }

        // Alias scan fallback; aliases are a JSON array column.
        let mut stmt = conn
            .prepare("SELECT * FROM entities WHERE aliases != '[]' ORDER BY mention_count DESC")
            .map_err(db_err(op))?;
        let rows = stmt
            .query_map([], row_to_entity)
            .map_err(db_err(op))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err(op))?;
        Ok(rows.into_iter().find(|e| {
            kind.is_none_or(|k| e.kind == k)
                && e.aliases.iter().any(|a| normalize_name(a) == normalized)
        }))
    }

    fn top_entities(&self, limit: usize, document_id: Option<&str>) -> Result<Vec<Entity>> {
        let op = "top_entities";
        let conn = self.lock(op)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match document_id {
            Some(doc) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT DISTINCT e.* FROM entities e
                         JOIN mentions m ON m.entity_id = e.id
                         JOIN text_units t ON t.id = m.text_unit_id
                         WHERE t.document_id = ?1
                         ORDER BY e.mention_count DESC, e.confidence DESC, e.name
                         LIMIT ?2",
                    )
                    .map_err(db_err(op))?;
                stmt.query_map(params![doc, limit], row_to_entity)
                    .map_err(db_err(op))?
                    .collect::<rusqlite::Result<Vec<_>>>()
            },
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM entities
                         ORDER BY mention_count DESC, confidence DESC, name
                         LIMIT ?1",
                    )
                    .map_err(db_err(op))?;
                stmt.query_map(params![limit], row_to_entity)
                    .map_err(db_err(op))?
                    .collect::<rusqlite::Result<Vec<_>>>()
            },
        }
        .map_err(db_err(op))?;
        Ok(rows)
    }

    fn entities_by_kind(&self, kind: Option<EntityKind>) -> Result<Vec<Entity>> {
        let op = "entities_by_kind";
        let conn = self.lock(op)?;
        let rows = match kind {
            Some(k) => {
                let mut stmt = conn
                    .prepare("SELECT * FROM entities WHERE kind = ?1 ORDER BY id")
                    .map_err(db_err(op))?;
                stmt.query_map(params![k.as_str()], row_to_entity)
                    .map_err(db_err(op))?
                    .collect::<rusqlite::Result<Vec<_>>>()
            },
            None => {
                let mut stmt = conn
                    .prepare("SELECT * FROM entities ORDER BY id")
                    .map_err(db_err(op))?;
                stmt.query_map([], row_to_entity)
                    .map_err(db_err(op))?
                    .collect::<rusqlite::Result<Vec<_>>>()
            },
        }
        .map_err(db_err(op))?;
        Ok(rows)
    }

    fn update_entity(&self, entity: &Entity) -> Result<()> {
        let op = "update_entity";
        let conn = self.lock(op)?;
        let aliases = serde_json::to_string(&entity.aliases)
            .map_err(|e| Error::internal(op, e.to_string()))?;
        let changed = conn
            .execute(
                "UPDATE entities SET name = ?2, name_normalized = ?3, kind = ?4,
                 description = ?5, confidence = ?6, mention_count = ?7, aliases = ?8,
                 document_id = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    entity.id.as_str(),
                    entity.name,
                    normalize_name(&entity.name),
                    entity.kind.as_str(),
                    entity.description,
                    entity.confidence,
                    entity.mention_count,
                    aliases,
                    entity.document_id,
                    i64::try_from(crate::current_timestamp()).unwrap_or(i64::MAX),
                ],
            )
            .map_err(db_err(op))?;
        if changed == 0 {
            return Err(Error::not_found("entity", entity.id.as_str()));
        }
        Ok(())
    }

    fn delete_entity(&self, id: &EntityId) -> Result<bool> {
        let op = "delete_entity";
        let conn = self.lock(op)?;
        let changed = conn
            .execute("DELETE FROM entities WHERE id = ?1", params![id.as_str()])
            .map_err(db_err(op))?;
        Ok(changed > 0)
    }

    fn link_mention(&self, entity_id: &EntityId, text_unit_id: &str) -> Result<()> {
        let op = "link_mention";
        let conn = self.lock(op)?;
        conn.execute(
            "INSERT OR IGNORE INTO mentions (entity_id, text_unit_id) VALUES (?1, ?2)",
            params![entity_id.as_str(), text_unit_id],
        )
        .map_err(db_err(op))?;
        Self::recount_mentions(&conn, entity_id.as_str()).map_err(db_err(op))?;
        Ok(())
    }

    fn mentions_of(&self, entity_id: &EntityId) -> Result<Vec<String>> {
        let op = "mentions_of";
        let conn = self.lock(op)?;
        let mut stmt = conn
            .prepare("SELECT text_unit_id FROM mentions WHERE entity_id = ?1 ORDER BY text_unit_id")
            .map_err(db_err(op))?;
        let rows = stmt
            .query_map(params![entity_id.as_str()], |row| row.get(0))
            .map_err(db_err(op))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err(op))?;
        Ok(rows)
    }

    fn text_units_for_entity(&self, entity_id: &EntityId, limit: usize) -> Result<Vec<TextUnit>> {
        let op = "text_units_for_entity";
        let conn = self.lock(op)?;
        let mut stmt = conn
            .prepare(
                "SELECT t.* FROM text_units t
                 JOIN mentions m ON m.text_unit_id = t.id
                 WHERE m.entity_id = ?1
                 ORDER BY t.created_at DESC, t.id
                 LIMIT ?2",
            )
            .map_err(db_err(op))?;
        let rows = stmt
            .query_map(
                params![entity_id.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
                row_to_text_unit,
            )
            .map_err(db_err(op))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err(op))?;
        Ok(rows)
    }

    fn upsert_relation(&self, relation: &Relation) -> Result<()> {
        if relation.rel_type.is_empty() {
            return Err(Error::InvalidInput("relation type is empty".to_string()));
        }
        let op = "upsert_relation";
        let conn = self.lock(op)?;
        conn.execute(
            "INSERT INTO relations (source_id, target_id, rel_type, description, confidence, strength)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source_id, rel_type, target_id) DO UPDATE SET
                 confidence = MAX(confidence, excluded.confidence),
                 description = CASE
                     WHEN LENGTH(excluded.description) > LENGTH(description)
                     THEN excluded.description ELSE description END,
                 strength = COALESCE(strength, excluded.strength)",
            params![
                relation.source.as_str(),
                relation.target.as_str(),
                relation.rel_type.as_str(),
                relation.description,
                relation.confidence,
                relation.strength,
            ],
        )
        .map_err(db_err(op))?;
        Ok(())
    }

    fn relations_of(&self, entity_id: &EntityId) -> Result<Vec<Relation>> {
        let op = "relations_of";
        let conn = self.lock(op)?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM relations WHERE source_id = ?1 OR target_id = ?1
                 ORDER BY confidence DESC",
            )
            .map_err(db_err(op))?;
        let rows = stmt
            .query_map(params![entity_id.as_str()], row_to_relation)
            .map_err(db_err(op))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err(op))?;
        Ok(rows)
    }

    fn relation_types_for_entities(
        &self,
        entity_ids: &[EntityId],
        min_confidence: f32,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<RelationTypeStat>> {
        let op = "relation_types_for_entities";
        let conn = self.lock(op)?;
        let id_set: HashSet<&str> = entity_ids.iter().map(EntityId::as_str).collect();

        let mut stmt = conn
            .prepare("SELECT * FROM relations WHERE confidence > ?1")
            .map_err(db_err(op))?;
        let relations = stmt
            .query_map(params![min_confidence], row_to_relation)
            .map_err(db_err(op))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err(op))?;

        let mut stats: HashMap<RelationType, (usize, f32)> = HashMap::new();
        for relation in relations {
            if !id_set.contains(relation.source.as_str()) && !id_set.contains(relation.target.as_str())
            {
                continue;
            }
            if let Some(docs) = document_ids {
                let source_docs =
                    Self::entity_documents(&conn, relation.source.as_str()).map_err(db_err(op))?;
                let target_docs =
                    Self::entity_documents(&conn, relation.target.as_str()).map_err(db_err(op))?;
                if !docs.iter().any(|d| source_docs.contains(d))
                    || !docs.iter().any(|d| target_docs.contains(d))
                {
                    continue;
                }
            }
            let entry = stats.entry(relation.rel_type).or_insert((0, 0.0));
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
        let op = "related_entities";
        let conn = self.lock(op)?;
        let mut stmt = conn
            .prepare(
                "SELECT e.*, r.confidence AS rel_confidence
                 FROM relations r JOIN entities e ON e.id = r.target_id
                 WHERE r.source_id = ?1 AND r.rel_type = ?2
                 ORDER BY r.confidence DESC, e.mention_count DESC, e.name
                 LIMIT ?3",
            )
            .map_err(db_err(op))?;
        let rows = stmt
            .query_map(
                params![
                    source.as_str(),
                    rel_type.as_str(),
                    i64::try_from(limit).unwrap_or(i64::MAX)
                ],
                |row| {
                    let entity = row_to_entity(row)?;
                    let confidence: f32 = row.get("rel_confidence")?;
                    Ok((entity, confidence))
                },
            )
            .map_err(db_err(op))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err(op))?;

        match document_ids {
            None => Ok(rows),
            Some(docs) => {
                let mut filtered = Vec::new();
                for (entity, confidence) in rows {
                    let entity_docs =
                        Self::entity_documents(&conn, entity.id.as_str()).map_err(db_err(op))?;
                    if docs.iter().any(|d| entity_docs.contains(d)) {
                        filtered.push((entity, confidence));
                    }
                }
                Ok(filtered)
            },
        }
    }

    fn entity_context(
        &self,
        entity_id: &EntityId,
        hop_limit: u32,
        include_text: bool,
    ) -> Result<EntityContext> {
        let op = "entity_context";
        let conn = self.lock(op)?;
        let exists: Option<String> = conn
            .query_row(
                "SELECT id FROM entities WHERE id = ?1",
                params![entity_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err(op))?;
        if exists.is_none() {
            return Err(Error::not_found("entity", entity_id.as_str()));
        }

        let mut context = EntityContext::default();
        let mut visited: HashSet<String> = HashSet::from([entity_id.as_str().to_string()]);
        let mut frontier: VecDeque<(String, u32)> =
            VecDeque::from([(entity_id.as_str().to_string(), 0)]);

        let mut neighbor_stmt = conn
            .prepare(
                "SELECT e.*, r.rel_type AS via
                 FROM relations r
                 JOIN entities e ON e.id = CASE
                     WHEN r.source_id = ?1 THEN r.target_id ELSE r.source_id END
                 WHERE r.source_id = ?1 OR r.target_id = ?1
                 ORDER BY e.id",
            )
            .map_err(db_err(op))?;

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= hop_limit {
                continue;
            }
            let neighbors = neighbor_stmt
                .query_map(params![current], |row| {
                    let entity = row_to_entity(row)?;
                    let via: String = row.get("via")?;
                    Ok((entity, via))
                })
                .map_err(db_err(op))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err(op))?;

            for (entity, via) in neighbors {
                if !visited.insert(entity.id.as_str().to_string()) {
                    continue;
                }
                frontier.push_back((entity.id.as_str().to_string(), depth + 1));
                context.related_entities.push(RelatedEntity {
                    entity,
                    rel_type: RelationType::new(via),
                    distance: depth + 1,
                });
            }
        }

        if include_text {
            let mut seen: HashSet<String> = HashSet::new();
            let mut ids = vec![entity_id.as_str().to_string()];
            ids.extend(
                context
                    .related_entities
                    .iter()
                    .map(|r| r.entity.id.as_str().to_string()),
            );
            let mut unit_stmt = conn
                .prepare(
                    "SELECT t.* FROM text_units t
                     JOIN mentions m ON m.text_unit_id = t.id
                     WHERE m.entity_id = ?1 ORDER BY t.id",
                )
                .map_err(db_err(op))?;
            for id in ids {
                let units = unit_stmt
                    .query_map(params![id], row_to_text_unit)
                    .map_err(db_err(op))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err(op))?;
                for unit in units {
                    if seen.insert(unit.id.clone()) {
                        context.text_units.push(unit);
                    }
                }
            }
        }

        Ok(context)
    }

    fn delete_document_subgraph(&self, document_id: &str) -> Result<DeletedSubgraph> {
        let op = "delete_document_subgraph";
        let mut conn = self.lock(op)?;
        let tx = conn.transaction().map_err(db_err(op))?;
        let mut deleted = DeletedSubgraph::default();

        let touched: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT DISTINCT m.entity_id FROM mentions m
                     JOIN text_units t ON t.id = m.text_unit_id
                     WHERE t.document_id = ?1",
                )
                .map_err(db_err(op))?;
            stmt.query_map(params![document_id], |row| row.get(0))
                .map_err(db_err(op))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err(op))?
        };

        deleted.text_units = tx
            .execute(
                "DELETE FROM text_units WHERE document_id = ?1",
                params![document_id],
            )
            .map_err(db_err(op))?;

        for entity_id in &touched {
            Self::recount_mentions(&tx, entity_id).map_err(db_err(op))?;
            let dangling: bool = tx
                .query_row(
                    "SELECT mention_count = 0 FROM entities WHERE id = ?1",
                    params![entity_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err(op))?
                .unwrap_or(false);
            if dangling {
                deleted.relations += tx
                    .execute(
                        "DELETE FROM relations WHERE source_id = ?1 OR target_id = ?1",
                        params![entity_id],
                    )
                    .map_err(db_err(op))?;
                deleted.entities += tx
                    .execute("DELETE FROM entities WHERE id = ?1", params![entity_id])
                    .map_err(db_err(op))?;
            }
        }

        tx.execute("DELETE FROM documents WHERE id = ?1", params![document_id])
            .map_err(db_err(op))?;
        tx.execute(
            "UPDATE communities SET size =
             (SELECT COUNT(*) FROM community_members cm
              WHERE cm.community_id = communities.id AND cm.level = communities.level)",
            [],
        )
        .map_err(db_err(op))?;
        tx.commit().map_err(db_err(op))?;
        Ok(deleted)
    }

    fn list_affected_communities(&self, document_id: &str) -> Result<AffectedCommunities> {
        let op = "list_affected_communities";
        let conn = self.lock(op)?;
        let entities: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT m.entity_id FROM mentions m
                     JOIN text_units t ON t.id = m.text_unit_id
                     WHERE t.document_id = ?1 ORDER BY m.entity_id",
                )
                .map_err(db_err(op))?;
            stmt.query_map(params![document_id], |row| row.get(0))
                .map_err(db_err(op))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err(op))?
        };

        let mut communities: BTreeSet<i64> = BTreeSet::new();
        let mut stmt = conn
            .prepare("SELECT community_id FROM community_members WHERE entity_id = ?1")
            .map_err(db_err(op))?;
        for entity_id in &entities {
            let rows = stmt
                .query_map(params![entity_id], |row| row.get::<_, i64>(0))
                .map_err(db_err(op))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err(op))?;
            communities.extend(rows);
        }

        Ok(AffectedCommunities {
            communities: communities.into_iter().collect(),
            entities: entities.into_iter().map(EntityId::new).collect(),
        })
    }

    fn assign_communities(&self, assignments: &[(EntityId, i64)], level: u32) -> Result<()> {
        let op = "assign_communities";
        let mut conn = self.lock(op)?;
        let tx = conn.transaction().map_err(db_err(op))?;
        for (entity_id, community_id) in assignments {
            tx.execute(
                "INSERT INTO community_members (entity_id, community_id, level)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity_id, level) DO UPDATE SET community_id = excluded.community_id",
                params![entity_id.as_str(), community_id, level],
            )
            .map_err(db_err(op))?;
            tx.execute(
                "INSERT OR IGNORE INTO communities (id, level) VALUES (?1, ?2)",
                params![community_id, level],
            )
            .map_err(db_err(op))?;
        }
        tx.execute(
            "UPDATE communities SET size =
             (SELECT COUNT(*) FROM community_members cm
              WHERE cm.community_id = communities.id AND cm.level = communities.level)",
            [],
        )
        .map_err(db_err(op))?;
        tx.execute("DELETE FROM communities WHERE size = 0", [])
            .map_err(db_err(op))?;
        tx.commit().map_err(db_err(op))?;
        Ok(())
    }

    fn clear_communities(&self, level: Option<u32>) -> Result<()> {
        let op = "clear_communities";
        let conn = self.lock(op)?;
        match level {
            Some(level) => {
                conn.execute("DELETE FROM community_members WHERE level = ?1", params![level])
                    .map_err(db_err(op))?;
                conn.execute("DELETE FROM communities WHERE level = ?1", params![level])
                    .map_err(db_err(op))?;
            },
            None => {
                conn.execute("DELETE FROM community_members", [])
                    .map_err(db_err(op))?;
                conn.execute("DELETE FROM communities", [])
                    .map_err(db_err(op))?;
            },
        }
        Ok(())
    }

    fn entity_community(&self, entity_id: &EntityId, level: u32) -> Result<Option<i64>> {
        let op = "entity_community";
        let conn = self.lock(op)?;
        conn.query_row(
            "SELECT community_id FROM community_members WHERE entity_id = ?1 AND level = ?2",
            params![entity_id.as_str(), level],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err(op))
    }

    fn community_members(&self, community_id: i64, level: u32) -> Result<Vec<Entity>> {
        let op = "community_members";
        let conn = self.lock(op)?;
        let mut stmt = conn
            .prepare(
                "SELECT e.* FROM entities e
                 JOIN community_members cm ON cm.entity_id = e.id
                 WHERE cm.community_id = ?1 AND cm.level = ?2
                 ORDER BY e.mention_count DESC, e.confidence DESC, e.name",
            )
            .map_err(db_err(op))?;
        let rows = stmt
            .query_map(params![community_id, level], row_to_entity)
            .map_err(db_err(op))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err(op))?;
        Ok(rows)
    }

    fn list_communities(&self, level: Option<u32>) -> Result<Vec<Community>> {
        let op = "list_communities";
        let conn = self.lock(op)?;
        let rows = match level {
            Some(level) => {
                let mut stmt = conn
                    .prepare("SELECT * FROM communities WHERE level = ?1 ORDER BY id")
                    .map_err(db_err(op))?;
                stmt.query_map(params![level], row_to_community)
                    .map_err(db_err(op))?
                    .collect::<rusqlite::Result<Vec<_>>>()
            },
            None => {
                let mut stmt = conn
                    .prepare("SELECT * FROM communities ORDER BY level, id")
                    .map_err(db_err(op))?;
                stmt.query_map([], row_to_community)
                    .map_err(db_err(op))?
                    .collect::<rusqlite::Result<Vec<_>>>()
            },
        }
        .map_err(db_err(op))?;
        Ok(rows)
    }

    fn get_community(&self, community_id: i64, level: u32) -> Result<Option<Community>> {
        let op = "get_community";
        let conn = self.lock(op)?;
        conn.query_row(
            "SELECT * FROM communities WHERE id = ?1 AND level = ?2",
            params![community_id, level],
            row_to_community,
        )
        .optional()
        .map_err(db_err(op))
    }

    fn store_community_summary(
        &self,
        community_id: i64,
        level: u32,
        summary: &CommunitySummary,
    ) -> Result<()> {
        let op = "store_community_summary";
        let conn = self.lock(op)?;
        let themes = serde_json::to_string(&summary.themes)
            .map_err(|e| Error::internal(op, e.to_string()))?;
        let changed = conn
            .execute(
                "UPDATE communities SET summary = ?3, themes = ?4, significance = ?5,
                 summary_timestamp = ?6, stale = 0
                 WHERE id = ?1 AND level = ?2",
                params![
                    community_id,
                    level,
                    summary.summary,
                    themes,
                    summary.significance.as_str(),
                    i64::try_from(crate::current_timestamp()).unwrap_or(i64::MAX),
                ],
            )
            .map_err(db_err(op))?;
        if changed == 0 {
            return Err(Error::not_found("community", community_id.to_string()));
        }
        Ok(())
    }

    fn mark_communities_stale(&self, community_ids: &[i64]) -> Result<()> {
        let op = "mark_communities_stale";
        let conn = self.lock(op)?;
        for community_id in community_ids {
            conn.execute(
                "UPDATE communities SET stale = 1 WHERE id = ?1",
                params![community_id],
            )
            .map_err(db_err(op))?;
        }
        Ok(())
    }

    fn graph_statistics(&self) -> Result<GraphStats> {
        let op = "graph_statistics";
        let conn = self.lock(op)?;
        let count = |table: &str| -> Result<usize> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n.max(0).unsigned_abs() as usize)
            .map_err(db_err(op))
        };
        Ok(GraphStats {
            documents: count("documents")?,
            text_units: count("text_units")?,
            entities: count("entities")?,
            relations: count("relations")?,
            communities: count("communities")?,
        })
    }
}
