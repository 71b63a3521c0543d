//! Domain model types for the knowledge graph and the public envelope.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`entity`] | Entities, entity kinds, relations, fingerprint identity |
//! | [`document`] | Documents, processing status, text units |
//! | [`community`] | Communities, significance, summaries |
//! | [`envelope`] | Public operation envelope and reasoning steps |
//! | [`triplet`] | Evidence triplets produced by ToG reasoning |

pub mod community;
pub mod document;
pub mod envelope;
pub mod entity;
pub mod triplet;

pub use community::{Community, CommunitySummary, Significance};
pub use document::{Document, DocumentStatus, TextUnit};
pub use envelope::{Envelope, ErrorDetail, OpStatus, ReasoningStep};
pub use entity::{Entity, EntityId, EntityKind, Relation, RelationType, normalize_name};
pub use triplet::Triplet;
