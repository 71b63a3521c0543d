//! Document and text-unit types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Ingested but not yet processed.
    Pending,
    /// Currently being chunked and extracted.
    Processing,
    /// At least one chunk produced entities and no fatal fault occurred.
    Completed,
    /// Processing failed outright.
    Failed,
}

impl DocumentStatus {
    /// Returns the status as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a status from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A logical source artifact. Metadata only; content lives in text units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Stable document id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Source file path.
    pub file_path: String,
    /// SHA-256 of the document content, hex-encoded.
    pub content_hash: String,
    /// Version number; starts at 1 and increments when the hash changes.
    pub version: u32,
    /// Last successful processing time (Unix seconds).
    pub last_processed_at: Option<u64>,
    /// Current processing status.
    pub status: DocumentStatus,
}

impl Document {
    /// Creates a new pending document at version 1.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        file_path: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            file_path: file_path.into(),
            content_hash: content_hash.into(),
            version: 1,
            last_processed_at: None,
            status: DocumentStatus::Pending,
        }
    }
}

/// A chunk of source text with byte offsets into the owning document.
///
/// Overlapping `[start_char, end_char)` ranges between neighboring units
/// are intentional; the overlap is what preserves recall across chunk
/// boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextUnit {
    /// Unique text-unit id.
    pub id: String,
    /// Owning document id.
    pub document_id: String,
    /// Chunk text.
    pub text: String,
    /// Byte offset of the chunk start in the source document.
    pub start_char: usize,
    /// Byte offset one past the chunk end.
    pub end_char: usize,
    /// Creation timestamp (Unix seconds).
    pub created_at: u64,
}

impl TextUnit {
    /// Creates a new text unit.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        text: impl Into<String>,
        start_char: usize,
        end_char: usize,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            text: text.into(),
            start_char,
            end_char,
            created_at: crate::current_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Completed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DocumentStatus::parse("unknown"), None);
    }

    #[test]
    fn test_new_document_starts_at_version_one() {
        let doc = Document::new("doc-1", "notes.md", "/tmp/notes.md", "abc123");
        assert_eq!(doc.version, 1);
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert!(doc.last_processed_at.is_none());
    }
}
